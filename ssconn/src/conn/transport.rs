// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::{self, IoSlice};
use std::net::SocketAddr;

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpStream;

use super::{batch_len, Conn};

const TRANSPORT_READ_BUFFER_CAPACITY: usize = 4096;

/// The leaf of every decorator stack: a raw stream with buffered reads
///
/// Batched writes are submitted with vectored I/O so that a leading segment
/// and its body leave in as few transport writes as the stream allows.
pub struct StreamTransport<S> {
  stream: BufReader<S>,
  local: Option<SocketAddr>,
  remote: Option<SocketAddr>,
}

impl<S: AsyncRead> StreamTransport<S> {
  pub fn new(stream: S, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
    Self {
      stream: BufReader::with_capacity(TRANSPORT_READ_BUFFER_CAPACITY, stream),
      local,
      remote,
    }
  }
}

impl StreamTransport<TcpStream> {
  pub fn tcp(stream: TcpStream) -> io::Result<Self> {
    let local = stream.local_addr()?;
    let remote = stream.peer_addr()?;
    Ok(Self::new(stream, Some(local), Some(remote)))
  }
}

impl StreamTransport<DuplexStream> {
  /// An entangled pair of unaddressed in-memory transports
  pub fn duplex(max_buf_size: usize) -> (Self, Self) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (Self::new(a, None, None), Self::new(b, None, None))
  }
}

fn unaddressed() -> io::Error {
  io::Error::new(io::ErrorKind::NotConnected, "transport carries no address")
}

impl<S> Conn for StreamTransport<S>
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move { self.stream.read(buf).await }.boxed()
  }

  fn write<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      self.stream.write_all(buf).await?;
      Ok(buf.len())
    }
    .boxed()
  }

  fn write_buffers<'a, 'b>(
    &'a mut self,
    bufs: &'a mut [&'b mut [u8]],
  ) -> BoxFuture<'a, io::Result<usize>> {
    async move { write_all_vectored(&mut self.stream, bufs).await }.boxed()
  }

  fn close(self: Box<Self>) -> BoxFuture<'static, io::Result<()>> {
    async move {
      let mut this = self;
      this.stream.shutdown().await
    }
    .boxed()
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    self.local.ok_or_else(unaddressed)
  }

  fn remote_addr(&self) -> io::Result<SocketAddr> {
    self.remote.ok_or_else(unaddressed)
  }
}

/// Writes every segment in order, resubmitting the unwritten tail after short writes
pub(crate) async fn write_all_vectored<W: AsyncWrite + Unpin>(
  writer: &mut W,
  bufs: &[&mut [u8]],
) -> io::Result<usize> {
  let total = batch_len(bufs);
  let (mut segment, mut offset) = (0usize, 0usize);
  while segment < bufs.len() {
    if offset == bufs[segment].len() {
      segment += 1;
      offset = 0;
      continue;
    }
    let slices = std::iter::once(IoSlice::new(&bufs[segment][offset..]))
      .chain(bufs[segment + 1..].iter().map(|b| IoSlice::new(b)))
      .collect::<Vec<_>>();
    let mut written = writer.write_vectored(&slices).await?;
    if written == 0 {
      return Err(io::ErrorKind::WriteZero.into());
    }
    while written > 0 {
      let remaining = bufs[segment].len() - offset;
      if written < remaining {
        offset += written;
        written = 0;
      } else {
        written -= remaining;
        segment += 1;
        offset = 0;
      }
    }
  }
  Ok(total)
}
