// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Deferred, randomized closing of connections the application has finished with
//!
//! Closing a tunnel the moment its last byte is relayed leaks timing
//! information to an observer. A [LifecyclePool] instead holds finished
//! connections open for a random number of seconds before the real close.

use std::collections::HashMap;
use std::io;
use std::ops::RangeInclusive;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::conn::{describe_remote, BoxedConn};

pub const COUNTDOWN_DRAW_RANGE: RangeInclusive<u32> = 1..=16;
pub const COUNTDOWN_ACCEPT_RANGE: RangeInclusive<u32> = 3..=14;
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);

/// Sums draws from `draw` until one lands in [COUNTDOWN_ACCEPT_RANGE], including that last draw
pub fn countdown_from(mut draw: impl FnMut() -> u32) -> u32 {
  let mut total = 0u32;
  loop {
    let value = draw();
    total = total.saturating_add(value);
    if COUNTDOWN_ACCEPT_RANGE.contains(&value) {
      return total;
    }
  }
}

pub struct PoolOptions {
  /// Period of the countdown tick; `None` leaves ticking to [LifecycleHandle::tick]
  pub tick_period: Option<Duration>,
  /// Source of countdown draws, uniform over [COUNTDOWN_DRAW_RANGE] by default
  pub draw: Box<dyn FnMut() -> u32 + Send>,
}

impl Default for PoolOptions {
  fn default() -> Self {
    Self {
      tick_period: Some(DEFAULT_TICK_PERIOD),
      draw: Box::new(|| rand::thread_rng().gen_range(COUNTDOWN_DRAW_RANGE)),
    }
  }
}

impl std::fmt::Debug for PoolOptions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PoolOptions")
      .field("tick_period", &self.tick_period)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PoolStats {
  pub pending: usize,
}

enum Command {
  Defer(BoxedConn),
  Tick,
  Stats(oneshot::Sender<PoolStats>),
}

/// Cloneable sender side of a [LifecyclePool], handed to each connection
#[derive(Clone)]
pub struct LifecycleHandle {
  commands: mpsc::UnboundedSender<Command>,
  token: CancellationToken,
}

impl std::fmt::Debug for LifecycleHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LifecycleHandle")
      .field("terminated", &self.is_terminated())
      .finish()
  }
}

impl LifecycleHandle {
  pub fn is_terminated(&self) -> bool {
    self.token.is_cancelled() || self.commands.is_closed()
  }

  /// Hands `conn` to the pool without waiting on it
  ///
  /// Once the pool has terminated, the connection is closed immediately instead.
  pub async fn close_deferred(&self, conn: BoxedConn) -> io::Result<()> {
    if self.token.is_cancelled() {
      return conn.close().await;
    }
    match self.commands.send(Command::Defer(conn)) {
      Ok(()) => Ok(()),
      Err(mpsc::error::SendError(Command::Defer(conn))) => {
        tracing::debug!("lifecycle pool terminated, closing immediately");
        conn.close().await
      }
      Err(_) => Ok(()),
    }
  }

  /// Advances every countdown by one second; returns false if the pool has terminated
  pub fn tick(&self) -> bool {
    self.commands.send(Command::Tick).is_ok()
  }

  pub async fn stats(&self) -> Option<PoolStats> {
    let (reply, response) = oneshot::channel();
    self.commands.send(Command::Stats(reply)).ok()?;
    response.await.ok()
  }
}

/// Owner of the coordinator task; dropping it cancels the coordinator
pub struct LifecyclePool {
  handle: LifecycleHandle,
  task: Option<JoinHandle<()>>,
}

impl LifecyclePool {
  pub fn spawn() -> Self {
    Self::spawn_with(PoolOptions::default())
  }

  pub fn spawn_with(options: PoolOptions) -> Self {
    let (commands, receiver) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    let coordinator = Coordinator {
      pending: HashMap::new(),
      draw: options.draw,
    };
    let task = tokio::task::spawn(
      coordinator
        .run(receiver, options.tick_period, token.clone())
        .instrument(tracing::debug_span!("lifecycle_pool")),
    );
    Self {
      handle: LifecycleHandle { commands, token },
      task: Some(task),
    }
  }

  pub fn handle(&self) -> LifecycleHandle {
    self.handle.clone()
  }

  /// Closes every pending connection and waits for the coordinator to exit
  pub async fn shutdown(mut self) {
    self.handle.token.cancel();
    if let Some(task) = self.task.take() {
      if let Err(e) = task.await {
        tracing::warn!(error = %e, "Lifecycle coordinator failed during shutdown");
      }
    }
  }
}

impl Drop for LifecyclePool {
  fn drop(&mut self) {
    self.handle.token.cancel();
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
  remote: String,
  id: Uuid,
}

struct PendingClose {
  conn: BoxedConn,
  remaining: u32,
}

struct Coordinator {
  pending: HashMap<EntryKey, PendingClose>,
  draw: Box<dyn FnMut() -> u32 + Send>,
}

impl Coordinator {
  async fn run(
    mut self,
    mut commands: mpsc::UnboundedReceiver<Command>,
    tick_period: Option<Duration>,
    token: CancellationToken,
  ) {
    let mut ticker = tick_period
      .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));
    loop {
      let next_tick = async {
        match ticker.as_mut() {
          Some(ticker) => {
            ticker.tick().await;
          }
          None => futures::future::pending::<()>().await,
        }
      };
      tokio::select! {
        _ = token.cancelled() => break,
        command = commands.recv() => match command {
          Some(command) => self.handle(command),
          None => break,
        },
        _ = next_tick => self.tick(),
      }
    }

    commands.close();
    let mut closing = Vec::new();
    while let Some(command) = commands.recv().await {
      if let Command::Defer(conn) = command {
        closing.push(conn);
      }
    }
    closing.extend(self.pending.drain().map(|(_, entry)| entry.conn));
    tracing::debug!(count = closing.len(), "closing pending connections for shutdown");
    let results = join_all(closing.into_iter().map(|conn| conn.close())).await;
    for e in results.into_iter().filter_map(Result::err) {
      tracing::debug!(error = %e, "close failed during shutdown");
    }
  }

  fn handle(&mut self, command: Command) {
    match command {
      Command::Defer(conn) => self.defer(conn),
      Command::Tick => self.tick(),
      Command::Stats(reply) => {
        let _ = reply.send(PoolStats {
          pending: self.pending.len(),
        });
      }
    }
  }

  fn defer(&mut self, conn: BoxedConn) {
    let seconds = countdown_from(&mut self.draw);
    let remote = describe_remote(&*conn);
    tracing::debug!(%remote, seconds, "deferring close");
    let key = EntryKey {
      remote,
      id: Uuid::new_v4(),
    };
    self.pending.insert(
      key,
      PendingClose {
        conn,
        remaining: seconds,
      },
    );
  }

  fn tick(&mut self) {
    for entry in self.pending.values_mut() {
      entry.remaining = entry.remaining.saturating_sub(1);
    }
    let expired = self
      .pending
      .iter()
      .filter(|(_, entry)| entry.remaining == 0)
      .map(|(key, _)| key.clone())
      .collect::<Vec<_>>();
    for key in expired {
      if let Some(entry) = self.pending.remove(&key) {
        let remote = key.remote;
        tokio::task::spawn(
          async move {
            match entry.conn.close().await {
              Ok(()) => tracing::trace!("deferred close complete"),
              Err(e) => tracing::debug!(error = %e, "deferred close failed"),
            }
          }
          .instrument(tracing::trace_span!("deferred_close", %remote)),
        );
      }
    }
  }
}
