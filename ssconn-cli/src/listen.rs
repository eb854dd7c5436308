// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::future::Future;
use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

/// A token cancelled on the first SIGINT, and the task watching for it
pub fn shutdown_on_ctrl_c() -> (CancellationToken, JoinHandle<()>) {
  let shutdown = CancellationToken::new();
  let shutdown_trigger = shutdown.clone();
  let sigint_handler_task = tokio::task::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    tracing::trace!("SIGINT detected, initiating graceful shutdown");
    shutdown_trigger.cancel();
  });
  (shutdown, sigint_handler_task)
}

/// Spawns `handler` for each accepted connection until `shutdown` is cancelled
pub async fn accept_until_cancelled<H, F>(
  listener: TcpListener,
  shutdown: CancellationToken,
  handler: H,
) -> Result<()>
where
  H: Fn(TcpStream, SocketAddr) -> F,
  F: Future<Output = Result<()>> + Send + 'static,
{
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => {
        let (stream, peer) = match accepted {
          Ok(accepted) => accepted,
          Err(e) => {
            tracing::warn!(error = %e, "Failed to accept connection");
            continue;
          }
        };
        let connection = handler(stream, peer);
        tokio::task::spawn(
          async move {
            match connection.await {
              Ok(()) => tracing::trace!("connection complete"),
              Err(e) => tracing::debug!(error = ?e, "connection failed"),
            }
          }
          .instrument(tracing::debug_span!("connection", %peer)),
        );
      }
    }
  }
  tracing::info!("No longer accepting connections");
  Ok(())
}
