// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io;
use std::net::SocketAddr;

use futures::future::{BoxFuture, FutureExt};

pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use transport::StreamTransport;

/// A bidirectional byte stream which decorators can be stacked upon
///
/// Every decorator owns exactly one inner [BoxedConn] and forwards the
/// operations it does not handle itself. Writes take mutable buffers, as
/// transforms such as stream ciphers operate in place on caller memory.
///
/// `read` implementations must be cancel safe: if the returned future is
/// dropped before it completes, no bytes have been consumed from the stream.
/// Writes carry no such guarantee and must be driven to completion.
pub trait Conn: Send {
  /// Reads available bytes into `buf`, returning `Ok(0)` at end of stream
  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;

  /// Writes the entirety of `buf`, which may be transformed in place
  fn write<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;

  /// Writes a batch of segments, equivalent to one `write` per segment in order
  ///
  /// Transports override this to submit the batch as a single vectored write.
  fn write_buffers<'a, 'b>(
    &'a mut self,
    bufs: &'a mut [&'b mut [u8]],
  ) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      let mut written = 0;
      for buf in bufs.iter_mut() {
        written += self.write(&mut **buf).await?;
      }
      Ok(written)
    }
    .boxed()
  }

  /// Closes the connection, consuming it
  fn close(self: Box<Self>) -> BoxFuture<'static, io::Result<()>>;

  fn local_addr(&self) -> io::Result<SocketAddr>;

  fn remote_addr(&self) -> io::Result<SocketAddr>;
}

pub type BoxedConn = Box<dyn Conn>;

/// Total length of a batch of segments
pub(crate) fn batch_len(bufs: &[&mut [u8]]) -> usize {
  bufs.iter().map(|b| b.len()).sum()
}

/// Renders an address for logging, tolerating unaddressed transports
pub(crate) fn describe_addr(addr: io::Result<SocketAddr>) -> String {
  addr
    .map(|addr| addr.to_string())
    .unwrap_or_else(|_| String::from("<unaddressed>"))
}

pub(crate) fn describe_remote(conn: &dyn Conn) -> String {
  describe_addr(conn.remote_addr())
}
