// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use super::Conn;

/// Everything a [RecordingConn] has observed, shared with the test body
#[derive(Debug, Default)]
pub(crate) struct Recording {
  /// One entry per transport call, holding the segments of that call
  pub calls: Vec<Vec<Vec<u8>>>,
  pub closes: usize,
}

impl Recording {
  /// All bytes written, in order, as the peer would see them
  pub fn written(&self) -> Vec<u8> {
    self.calls.iter().flatten().flatten().copied().collect()
  }
}

pub(crate) type RecordingState = Arc<Mutex<Recording>>;

/// Scripted in-memory transport which records writes and closes
pub(crate) struct RecordingConn {
  reads: VecDeque<io::Result<Vec<u8>>>,
  state: RecordingState,
  fail_writes: bool,
  remote: SocketAddr,
}

impl RecordingConn {
  pub fn new() -> (Self, RecordingState) {
    let state = RecordingState::default();
    let conn = Self {
      reads: VecDeque::new(),
      state: state.clone(),
      fail_writes: false,
      remote: SocketAddr::from(([192, 0, 2, 1], 40000)),
    };
    (conn, state)
  }

  /// Queues chunks to be returned by successive reads; an exhausted script reads as end of stream
  pub fn with_reads<I: IntoIterator<Item = Vec<u8>>>(mut self, chunks: I) -> Self {
    self.reads.extend(chunks.into_iter().map(Ok));
    self
  }

  pub fn with_read_error(mut self, kind: io::ErrorKind) -> Self {
    self.reads.push_back(Err(kind.into()));
    self
  }

  pub fn with_failing_writes(mut self) -> Self {
    self.fail_writes = true;
    self
  }

  pub fn with_remote(mut self, remote: SocketAddr) -> Self {
    self.remote = remote;
    self
  }

  fn record(&self, segments: Vec<Vec<u8>>) -> io::Result<()> {
    if self.fail_writes {
      return Err(io::ErrorKind::BrokenPipe.into());
    }
    self.state.lock().unwrap().calls.push(segments);
    Ok(())
  }
}

impl Conn for RecordingConn {
  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    let result = match self.reads.pop_front() {
      None => Ok(0),
      Some(Err(e)) => Err(e),
      Some(Ok(mut chunk)) => {
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
          self.reads.push_front(Ok(chunk.split_off(n)));
        }
        Ok(n)
      }
    };
    futures::future::ready(result).boxed()
  }

  fn write<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    let result = self.record(vec![buf.to_vec()]).map(|_| buf.len());
    futures::future::ready(result).boxed()
  }

  fn write_buffers<'a, 'b>(
    &'a mut self,
    bufs: &'a mut [&'b mut [u8]],
  ) -> BoxFuture<'a, io::Result<usize>> {
    let segments = bufs.iter().map(|b| b.to_vec()).collect::<Vec<_>>();
    let total = segments.iter().map(Vec::len).sum::<usize>();
    let result = self.record(segments).map(|_| total);
    futures::future::ready(result).boxed()
  }

  fn close(self: Box<Self>) -> BoxFuture<'static, io::Result<()>> {
    self.state.lock().unwrap().closes += 1;
    futures::future::ready(Ok(())).boxed()
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    Ok(SocketAddr::from(([192, 0, 2, 254], 8388)))
  }

  fn remote_addr(&self) -> io::Result<SocketAddr> {
    Ok(self.remote)
  }
}

/// Yields to the runtime until `state` has seen `closes` closes, or gives up
pub(crate) async fn settle_closes(state: &RecordingState, closes: usize) -> usize {
  for _ in 0..1000 {
    if state.lock().unwrap().closes >= closes {
      break;
    }
    tokio::task::yield_now().await;
  }
  state.lock().unwrap().closes
}

/// A log record seen by [CapturedEvents], with its fields rendered as `name=value` pairs
#[derive(Debug, Clone)]
pub(crate) struct CapturedEvent {
  pub level: Level,
  pub target: String,
  pub fields: String,
}

struct FieldText<'a>(&'a mut String);

impl<'a> Visit for FieldText<'a> {
  fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
    let _ = write!(self.0, "{}={:?} ", field.name(), value);
  }
}

/// Collects every record emitted on the current thread while its guard lives
#[derive(Clone, Default)]
pub(crate) struct CapturedEvents {
  events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedEvents {
  pub fn install() -> (Self, DefaultGuard) {
    let captured = Self::default();
    let subscriber = tracing_subscriber::registry().with(captured.clone());
    (captured, tracing::subscriber::set_default(subscriber))
  }

  pub fn matching(&self, level: Level, target: &str) -> Vec<CapturedEvent> {
    self
      .events
      .lock()
      .unwrap()
      .iter()
      .filter(|event| event.level == level && event.target == target)
      .cloned()
      .collect()
  }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
  fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
    let mut fields = String::new();
    event.record(&mut FieldText(&mut fields));
    self.events.lock().unwrap().push(CapturedEvent {
      level: *event.metadata().level(),
      target: event.metadata().target().to_string(),
      fields,
    });
  }
}
