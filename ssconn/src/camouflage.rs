// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fmt;
use std::io;
use std::net::SocketAddr;

use futures::future::{BoxFuture, FutureExt};

use crate::conn::{describe_addr, BoxedConn, Conn};

pub const MAX_HEADER_BYTES: usize = 8 * 1024;
pub const MAX_HEADERS: usize = 64;

const RESPONSE_PREFIX: &[u8] = b"HTTP/";

#[derive(thiserror::Error, Debug)]
pub enum HeaderParseError {
  #[error("Header block exceeds {0} bytes")]
  TooLarge(usize),
  #[error("Malformed HTTP header: {0}")]
  Malformed(#[from] httparse::Error),
}

/// Incremental accumulator for one HTTP request or response header block
#[derive(Debug, Default)]
pub struct HttpHeaderParser {
  buf: Vec<u8>,
}

impl HttpHeaderParser {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends `data`, returning the header text once the block is complete
  pub fn feed(&mut self, data: &[u8]) -> Result<Option<String>, HeaderParseError> {
    let room = MAX_HEADER_BYTES - self.buf.len();
    self
      .buf
      .extend_from_slice(&data[..data.len().min(room)]);
    if self.buf.len() < RESPONSE_PREFIX.len() && RESPONSE_PREFIX.starts_with(&self.buf) {
      return Ok(None);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let status = if self.buf.starts_with(RESPONSE_PREFIX) {
      httparse::Response::new(&mut headers).parse(&self.buf)?
    } else {
      httparse::Request::new(&mut headers).parse(&self.buf)?
    };
    match status {
      httparse::Status::Complete(len) => {
        let text = String::from_utf8_lossy(&self.buf[..len]);
        Ok(Some(text.trim_end().to_string()))
      }
      httparse::Status::Partial if self.buf.len() >= MAX_HEADER_BYTES => {
        Err(HeaderParseError::TooLarge(MAX_HEADER_BYTES))
      }
      httparse::Status::Partial => Ok(None),
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
  Inbound,
  Outbound,
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Direction::Inbound => "inbound",
      Direction::Outbound => "outbound",
    })
  }
}

/// Logs the HTTP header block leading each direction, if there is one
///
/// Inspection of a direction ends for good after its first complete header
/// block or the first bytes which cannot be one. Data is never altered.
pub struct CamouflageConn {
  inner: BoxedConn,
  read_parser: Option<HttpHeaderParser>,
  write_parser: Option<HttpHeaderParser>,
}

impl CamouflageConn {
  pub fn new(inner: BoxedConn) -> Self {
    Self {
      inner,
      read_parser: Some(HttpHeaderParser::new()),
      write_parser: Some(HttpHeaderParser::new()),
    }
  }

  pub fn is_inspecting(&self, direction: Direction) -> bool {
    match direction {
      Direction::Inbound => self.read_parser.is_some(),
      Direction::Outbound => self.write_parser.is_some(),
    }
  }
}

fn inspect(
  parser: &mut Option<HttpHeaderParser>,
  data: &[u8],
  direction: Direction,
  conn: &dyn Conn,
) {
  let active = match parser {
    Some(active) => active,
    None => return,
  };
  match active.feed(data) {
    Ok(None) => return,
    Ok(Some(header)) => {
      tracing::info!(
        local = %describe_addr(conn.local_addr()),
        remote = %describe_addr(conn.remote_addr()),
        %direction,
        %header,
        "HTTP header"
      );
    }
    Err(e) => tracing::trace!(%direction, error = %e, "stream does not lead with an HTTP header"),
  }
  *parser = None;
}

impl Conn for CamouflageConn {
  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      let n = self.inner.read(buf).await?;
      if n > 0 {
        inspect(
          &mut self.read_parser,
          &buf[..n],
          Direction::Inbound,
          &*self.inner,
        );
      }
      Ok(n)
    }
    .boxed()
  }

  fn write<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      // Inner layers may transform the buffer in place, so inspect first
      inspect(&mut self.write_parser, buf, Direction::Outbound, &*self.inner);
      self.inner.write(buf).await
    }
    .boxed()
  }

  fn write_buffers<'a, 'b>(
    &'a mut self,
    bufs: &'a mut [&'b mut [u8]],
  ) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      for buf in bufs.iter() {
        if self.write_parser.is_none() {
          break;
        }
        inspect(&mut self.write_parser, buf, Direction::Outbound, &*self.inner);
      }
      self.inner.write_buffers(bufs).await
    }
    .boxed()
  }

  fn close(self: Box<Self>) -> BoxFuture<'static, io::Result<()>> {
    self.inner.close()
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    self.inner.local_addr()
  }

  fn remote_addr(&self) -> io::Result<SocketAddr> {
    self.inner.remote_addr()
  }
}

#[cfg(test)]
mod tests {
  use std::io;

  use tracing::Level;

  use super::{CamouflageConn, Direction, HeaderParseError, HttpHeaderParser, MAX_HEADER_BYTES};
  use crate::conn::testing::{CapturedEvents, RecordingConn};
  use crate::conn::Conn;

  const REQUEST: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";

  #[test]
  fn parser_recognizes_requests_and_responses() {
    let mut parser = HttpHeaderParser::new();
    let header = parser.feed(REQUEST).unwrap().unwrap();
    assert!(header.starts_with("GET /index.html HTTP/1.1"));
    assert!(header.ends_with("Accept: */*"));

    let mut parser = HttpHeaderParser::new();
    assert_eq!(parser.feed(b"HT").unwrap(), None);
    assert_eq!(parser.feed(b"TP/1.1 204 No").unwrap(), None);
    let header = parser.feed(b" Content\r\nServer: x\r\n\r\n").unwrap();
    assert_eq!(header.as_deref(), Some("HTTP/1.1 204 No Content\r\nServer: x"));
  }

  #[test]
  fn parser_gives_up_on_oversized_or_malformed_input() {
    let mut parser = HttpHeaderParser::new();
    parser.feed(b"GET / HTTP/1.1\r\n").unwrap();
    let padding = vec![b'a'; MAX_HEADER_BYTES];
    let mut filler = b"X-Padding: ".to_vec();
    filler.extend_from_slice(&padding);
    assert!(matches!(
      parser.feed(&filler),
      Err(HeaderParseError::TooLarge(MAX_HEADER_BYTES))
    ));

    let mut parser = HttpHeaderParser::new();
    assert!(matches!(
      parser.feed(&[0x16, 0x03, 0x01, 0x02, 0x00, 0x01]),
      Err(HeaderParseError::Malformed(_))
    ));

    let mut many = b"GET / HTTP/1.1\r\n".to_vec();
    for i in 0..65 {
      many.extend_from_slice(format!("X-{}: {}\r\n", i, i).as_bytes());
    }
    many.extend_from_slice(b"\r\n");
    assert!(matches!(
      HttpHeaderParser::new().feed(&many),
      Err(HeaderParseError::Malformed(httparse::Error::TooManyHeaders))
    ));
  }

  #[tokio::test]
  async fn request_is_logged_once_and_payload_passes_through() {
    let (captured, _guard) = CapturedEvents::install();
    let payload = vec![0u8, 159, 146, 150, 255];
    let (transport, _) = RecordingConn::new();
    let transport = transport.with_reads([REQUEST.to_vec(), payload.clone(), REQUEST.to_vec()]);
    let mut conn = CamouflageConn::new(Box::new(transport));
    let mut buf = [0u8; 256];

    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], REQUEST);
    assert!(!conn.is_inspecting(Direction::Inbound));
    assert!(conn.is_inspecting(Direction::Outbound));
    let logged = captured.matching(Level::INFO, "ssconn::camouflage");
    assert_eq!(logged.len(), 1);
    assert!(logged[0].fields.contains("direction=inbound"));
    assert!(logged[0].fields.contains("Host: example.com"));
    assert!(logged[0].fields.contains("remote=192.0.2.1:40000"));

    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &payload[..]);
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], REQUEST);
    assert_eq!(captured.matching(Level::INFO, "ssconn::camouflage").len(), 1);
  }

  #[tokio::test]
  async fn header_may_span_reads() {
    let (transport, _) = RecordingConn::new();
    let transport = transport.with_reads([REQUEST[..9].to_vec(), REQUEST[9..].to_vec()]);
    let mut conn = CamouflageConn::new(Box::new(transport));
    let mut buf = [0u8; 256];
    conn.read(&mut buf).await.unwrap();
    assert!(conn.is_inspecting(Direction::Inbound));
    conn.read(&mut buf).await.unwrap();
    assert!(!conn.is_inspecting(Direction::Inbound));
  }

  #[tokio::test]
  async fn binary_streams_end_inspection_silently() {
    let tls_hello = vec![0x16, 0x03, 0x01, 0x00, 0xa5, 0x01];
    let (transport, _) = RecordingConn::new();
    let transport = transport
      .with_reads([tls_hello.clone()])
      .with_read_error(io::ErrorKind::ConnectionAborted);
    let mut conn = CamouflageConn::new(Box::new(transport));
    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &tls_hello[..]);
    assert!(!conn.is_inspecting(Direction::Inbound));
    let err = conn.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
  }

  #[tokio::test]
  async fn responses_are_inspected_on_write() {
    let (captured, _guard) = CapturedEvents::install();
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec();
    let (transport, recording) = RecordingConn::new();
    let mut conn = CamouflageConn::new(Box::new(transport));
    let (mut head, mut body) = (response[..20].to_vec(), response[20..].to_vec());
    conn
      .write_buffers(&mut [&mut head[..], &mut body[..]])
      .await
      .unwrap();
    assert!(!conn.is_inspecting(Direction::Outbound));
    conn.write(&mut b"more".to_vec()).await.unwrap();

    let recording = recording.lock().unwrap();
    assert_eq!(recording.calls.len(), 2);
    assert_eq!(&recording.written()[..response.len()], &response[..]);
    let logged = captured.matching(Level::INFO, "ssconn::camouflage");
    assert_eq!(logged.len(), 1);
    assert!(logged[0].fields.contains("direction=outbound"));
    assert!(logged[0].fields.contains("HTTP/1.1 200 OK"));
  }
}
