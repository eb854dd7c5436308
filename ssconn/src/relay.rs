// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::conn::Conn;

const RELAY_BUFFER_CAPACITY: usize = 1024 * 32;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RelayStats {
  pub conn_to_peer: u64,
  pub peer_to_conn: u64,
}

/// Copies between a decorated connection and a plain stream until the plain stream ends
///
/// Both directions are served from one task. End of stream from `conn`
/// shuts down the peer's write half; end of stream from `peer` finishes
/// the relay, leaving `conn` for the caller to close.
#[tracing::instrument(level = "trace", err, skip(conn, peer))]
pub async fn relay<S: AsyncRead + AsyncWrite + Unpin>(
  conn: &mut dyn Conn,
  peer: S,
) -> io::Result<RelayStats> {
  let (mut peer_reader, mut peer_writer) = tokio::io::split(peer);
  let mut from_conn = vec![0u8; RELAY_BUFFER_CAPACITY];
  let mut from_peer = vec![0u8; RELAY_BUFFER_CAPACITY];
  let mut stats = RelayStats::default();
  let mut conn_open = true;
  loop {
    let peer_read = if conn_open {
      tokio::select! {
        read = conn.read(&mut from_conn) => {
          match read? {
            0 => {
              tracing::trace!("connection finished sending");
              conn_open = false;
              peer_writer.shutdown().await?;
            }
            n => {
              peer_writer.write_all(&from_conn[..n]).await?;
              stats.conn_to_peer += n as u64;
            }
          }
          continue;
        }
        read = peer_reader.read(&mut from_peer) => read?,
      }
    } else {
      peer_reader.read(&mut from_peer).await?
    };
    if peer_read == 0 {
      break;
    }
    conn.write(&mut from_peer[..peer_read]).await?;
    stats.peer_to_conn += peer_read as u64;
  }
  tracing::trace!(?stats, "relay complete");
  Ok(stats)
}
