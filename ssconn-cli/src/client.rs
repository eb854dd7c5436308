// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use ssconn::cipher::StreamCipherProvider;
use ssconn::relay::relay;
use ssconn::{Config, ConnDecorator, LifecyclePool, StreamTransport};
use tokio::net::{TcpListener, TcpStream};

use crate::listen::{accept_until_cancelled, shutdown_on_ctrl_c};

/// Parameters used to run a client relaying local plaintext to a server
#[derive(Clone, Debug)]
pub struct ClientArgs {
  pub listen: SocketAddr,
  pub server: SocketAddr,
  pub config: Config,
}

#[tracing::instrument(skip(args), fields(listen = %args.listen, server = %args.server), err)]
pub async fn client_main(args: self::ClientArgs) -> Result<()> {
  let pool = LifecyclePool::spawn();
  let decorator = Arc::new(
    ConnDecorator::new(Arc::new(args.config), Arc::new(StreamCipherProvider))?
      .with_lifecycle(pool.handle()),
  );
  let listener = TcpListener::bind(args.listen)
    .await
    .with_context(|| format!("Binding {}", args.listen))?;
  let (shutdown, sigint_handler_task) = shutdown_on_ctrl_c();

  let server = args.server;
  accept_until_cancelled(listener, shutdown, move |stream, _peer| {
    handle_local(stream, decorator.clone(), server)
  })
  .await?;

  sigint_handler_task.abort();
  pool.shutdown().await;
  Ok(())
}

async fn handle_local(
  stream: TcpStream,
  decorator: Arc<ConnDecorator>,
  server: SocketAddr,
) -> Result<()> {
  let outbound = TcpStream::connect(server)
    .await
    .with_context(|| format!("Connecting to server {}", server))?;
  let mut conn = decorator.decorate(Box::new(StreamTransport::tcp(outbound)?));
  let relayed = relay(&mut *conn, stream).await.context("Relaying to server");
  if let Err(e) = conn.close().await {
    tracing::debug!(error = %e, "Failed to close server connection");
  }
  let stats = relayed?;
  tracing::debug!(?stats, "local connection finished");
  Ok(())
}
