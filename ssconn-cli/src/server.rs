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

/// Parameters used to run a server relaying decorated connections to one upstream
#[derive(Clone, Debug)]
pub struct ServerArgs {
  pub listen: SocketAddr,
  pub upstream: SocketAddr,
  pub config: Config,
}

#[tracing::instrument(skip(args), fields(listen = %args.listen, upstream = %args.upstream), err)]
pub async fn server_main(args: self::ServerArgs) -> Result<()> {
  let pool = LifecyclePool::spawn();
  let decorator = Arc::new(
    ConnDecorator::new(Arc::new(args.config), Arc::new(StreamCipherProvider))?
      .with_lifecycle(pool.handle()),
  );
  let listener = TcpListener::bind(args.listen)
    .await
    .with_context(|| format!("Binding {}", args.listen))?;
  let (shutdown, sigint_handler_task) = shutdown_on_ctrl_c();

  let upstream = args.upstream;
  accept_until_cancelled(listener, shutdown, move |stream, _peer| {
    handle_inbound(stream, decorator.clone(), upstream)
  })
  .await?;

  sigint_handler_task.abort();
  tracing::info!("Closing deferred connections");
  pool.shutdown().await;
  Ok(())
}

async fn handle_inbound(
  stream: TcpStream,
  decorator: Arc<ConnDecorator>,
  upstream: SocketAddr,
) -> Result<()> {
  let mut conn = decorator.decorate(Box::new(StreamTransport::tcp(stream)?));
  let relayed = async {
    let target = TcpStream::connect(upstream)
      .await
      .with_context(|| format!("Connecting to upstream {}", upstream))?;
    relay(&mut *conn, target).await.context("Relaying to upstream")
  }
  .await;
  if let Err(e) = conn.close().await {
    tracing::debug!(error = %e, "Failed to close inbound connection");
  }
  let stats = relayed?;
  tracing::debug!(?stats, "inbound connection finished");
  Ok(())
}
