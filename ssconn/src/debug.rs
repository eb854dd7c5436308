// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io;
use std::net::SocketAddr;

use futures::future::{BoxFuture, FutureExt};

use crate::conn::{describe_addr, BoxedConn, Conn};

/// Logs every successful transfer at trace level, payload included
pub struct DebugConn {
  inner: BoxedConn,
}

impl DebugConn {
  pub fn new(inner: BoxedConn) -> Self {
    Self { inner }
  }

  fn log(&self, operation: &'static str, data: &[u8]) {
    tracing::trace!(
      operation,
      bytes = data.len(),
      local = %describe_addr(self.inner.local_addr()),
      remote = %describe_addr(self.inner.remote_addr()),
      payload = ?data,
    );
  }
}

impl Conn for DebugConn {
  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      let n = self.inner.read(buf).await?;
      if n > 0 {
        self.log("read", &buf[..n]);
      }
      Ok(n)
    }
    .boxed()
  }

  fn write<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      // Captured first, as inner layers may encrypt in place
      let payload = tracing::enabled!(tracing::Level::TRACE).then(|| buf.to_vec());
      let n = self.inner.write(buf).await?;
      if let Some(payload) = payload {
        self.log("write", &payload);
      }
      Ok(n)
    }
    .boxed()
  }

  fn write_buffers<'a, 'b>(
    &'a mut self,
    bufs: &'a mut [&'b mut [u8]],
  ) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      let payload = tracing::enabled!(tracing::Level::TRACE).then(|| bufs.concat());
      let n = self.inner.write_buffers(bufs).await?;
      if let Some(payload) = payload {
        self.log("write_buffers", &payload);
      }
      Ok(n)
    }
    .boxed()
  }

  fn close(self: Box<Self>) -> BoxFuture<'static, io::Result<()>> {
    tracing::trace!(remote = %describe_addr(self.inner.remote_addr()), "close");
    self.inner.close()
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    self.inner.local_addr()
  }

  fn remote_addr(&self) -> io::Result<SocketAddr> {
    self.inner.remote_addr()
  }
}
