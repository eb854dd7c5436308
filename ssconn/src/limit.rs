// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::time::Instant;

use crate::conn::{BoxedConn, Conn};

type QuotaLimiter<C> =
  RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Replenishment time of a full burst
const BURST_PERIOD: Duration = Duration::from_secs(1);

struct Pacing<C: Clock> {
  quota: QuotaLimiter<C>,
  burst: NonZeroU32,
  clock: C,
}

/// Bytes counted by a [Limiter] which its quota could not admit yet
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Shortfall {
  pub remaining: u64,
  /// Time until the first of the remaining bytes may be admitted
  pub wait: Duration,
}

/// Cumulative byte counter, optionally pacing traffic to a rate in bytes per second
///
/// One limiter may be shared by many connections. A pacing limiter holds a
/// quota of `rate` bytes per second with one second of burst; transfers
/// larger than the burst are admitted a burst at a time.
pub struct Limiter<C: Clock = DefaultClock> {
  rate: u64,
  total: AtomicU64,
  pacing: Option<Pacing<C>>,
}

impl Limiter {
  /// A limiter pacing to `rate` bytes per second, or only counting if `rate` is 0
  pub fn new(rate: u64) -> Self {
    Self::with_clock(rate, &DefaultClock::default())
  }

  pub fn counting() -> Self {
    Self::new(0)
  }
}

impl<C: Clock> Limiter<C> {
  pub fn with_clock(rate: u64, clock: &C) -> Self {
    let pacing = NonZeroU32::new(rate.min(u32::MAX as u64) as u32).map(|burst| Pacing {
      quota: RateLimiter::direct_with_clock(Quota::per_second(burst).allow_burst(burst), clock),
      burst,
      clock: clock.clone(),
    });
    Self {
      rate,
      total: AtomicU64::new(0),
      pacing,
    }
  }

  pub fn rate(&self) -> u64 {
    self.rate
  }

  /// Bytes accounted so far
  pub fn total(&self) -> u64 {
    self.total.load(Ordering::Relaxed)
  }

  /// Accounts `bytes` and claims them from the quota
  pub fn update(&self, bytes: u64) -> Result<(), Shortfall> {
    self.total.fetch_add(bytes, Ordering::Relaxed);
    self.claim(bytes)
  }

  /// Claims already-counted bytes from the quota, a burst at a time
  pub fn claim(&self, bytes: u64) -> Result<(), Shortfall> {
    let pacing = match &self.pacing {
      Some(pacing) => pacing,
      None => return Ok(()),
    };
    let mut remaining = bytes;
    while let Some(cells) = NonZeroU32::new(remaining.min(pacing.burst.get() as u64) as u32) {
      match pacing.quota.check_n(cells) {
        Ok(Ok(_)) => remaining -= cells.get() as u64,
        Ok(Err(not_until)) => {
          return Err(Shortfall {
            remaining,
            wait: not_until.wait_time_from(pacing.clock.now()),
          })
        }
        // Cells never exceed the burst
        Err(_) => {
          return Err(Shortfall {
            remaining,
            wait: BURST_PERIOD,
          })
        }
      }
    }
    Ok(())
  }
}

impl<C: Clock> fmt::Debug for Limiter<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Limiter")
      .field("rate", &self.rate)
      .field("total", &self.total())
      .finish()
  }
}

/// One direction's limiters, the bytes each still owes its quota, and when to retry
struct Schedule<C: Clock> {
  limiters: Vec<Arc<Limiter<C>>>,
  owed: Vec<u64>,
  resume_at: Option<Instant>,
}

impl<C: Clock> Schedule<C> {
  fn new(limiters: Vec<Arc<Limiter<C>>>) -> Self {
    Self {
      owed: vec![0; limiters.len()],
      limiters,
      resume_at: None,
    }
  }

  fn defer(&mut self, wait: Option<Duration>) {
    self.resume_at = wait.map(|wait| Instant::now() + wait);
  }

  /// Counts a completed transfer; bytes the quotas cannot admit yet become owed
  fn account(&mut self, bytes: usize) {
    let mut wait = None;
    for (limiter, owed) in self.limiters.iter().zip(self.owed.iter_mut()) {
      if let Err(shortfall) = limiter.update(bytes as u64) {
        *owed += shortfall.remaining;
        wait = wait.max(Some(shortfall.wait));
      }
    }
    self.defer(wait);
  }

  /// Waits until every owed byte has been admitted
  ///
  /// Progress is kept in `self`, so an abandoned wait resumes where it stopped.
  async fn settle(&mut self) {
    loop {
      if let Some(deadline) = self.resume_at {
        tokio::time::sleep_until(deadline).await;
        self.resume_at = None;
      }
      let mut wait = None;
      for (limiter, owed) in self.limiters.iter().zip(self.owed.iter_mut()) {
        if *owed == 0 {
          continue;
        }
        match limiter.claim(*owed) {
          Ok(()) => *owed = 0,
          Err(shortfall) => {
            *owed = shortfall.remaining;
            wait = wait.max(Some(shortfall.wait));
          }
        }
      }
      if wait.is_none() {
        return;
      }
      self.defer(wait);
    }
  }
}

/// Accounts every successful transfer against ordered read and write limiter sets
///
/// Bytes a pacing quota cannot admit are owed, and the next operation in
/// the same direction waits for them first, so a read abandoned while
/// waiting loses no data.
pub struct RateLimitedConn<C: Clock = DefaultClock> {
  inner: BoxedConn,
  reads: Schedule<C>,
  writes: Schedule<C>,
}

impl<C: Clock> RateLimitedConn<C> {
  pub fn new(
    inner: BoxedConn,
    read_limiters: Vec<Arc<Limiter<C>>>,
    write_limiters: Vec<Arc<Limiter<C>>>,
  ) -> Self {
    Self {
      inner,
      reads: Schedule::new(read_limiters),
      writes: Schedule::new(write_limiters),
    }
  }

  pub fn read_limiters(&self) -> &[Arc<Limiter<C>>] {
    &self.reads.limiters
  }

  pub fn write_limiters(&self) -> &[Arc<Limiter<C>>] {
    &self.writes.limiters
  }
}

impl<C> Conn for RateLimitedConn<C>
where
  C: Clock + Send + Sync + 'static,
  C::Instant: Send + Sync,
{
  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      self.reads.settle().await;
      let n = self.inner.read(buf).await?;
      self.reads.account(n);
      Ok(n)
    }
    .boxed()
  }

  fn write<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      self.writes.settle().await;
      let n = self.inner.write(buf).await?;
      self.writes.account(n);
      Ok(n)
    }
    .boxed()
  }

  fn write_buffers<'a, 'b>(
    &'a mut self,
    bufs: &'a mut [&'b mut [u8]],
  ) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      self.writes.settle().await;
      let n = self.inner.write_buffers(bufs).await?;
      self.writes.account(n);
      Ok(n)
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
  use std::sync::Arc;
  use std::time::Duration;

  use futures::FutureExt;
  use governor::clock::FakeRelativeClock;
  use tokio::time::Instant;

  use super::{Limiter, RateLimitedConn};
  use crate::conn::testing::RecordingConn;
  use crate::conn::Conn;

  #[tokio::test]
  async fn successful_transfers_accumulate() {
    let reads = Arc::new(Limiter::counting());
    let writes = Arc::new(Limiter::counting());
    let (transport, recording) = RecordingConn::new();
    let transport = transport.with_reads([b"abc".to_vec(), b"de".to_vec()]);
    let mut conn = RateLimitedConn::new(
      Box::new(transport),
      vec![reads.clone()],
      vec![writes.clone()],
    );

    let mut buf = [0u8; 16];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 3);
    assert_eq!(conn.read(&mut buf).await.unwrap(), 2);
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    conn.write(&mut b"xyz".to_vec()).await.unwrap();
    let (mut a, mut b) = (vec![1u8; 2], vec![2u8; 4]);
    conn.write_buffers(&mut [&mut a[..], &mut b[..]]).await.unwrap();

    assert_eq!(reads.total(), 5);
    assert_eq!(writes.total(), 9);
    assert_eq!(recording.lock().unwrap().written().len(), 9);
  }

  #[tokio::test]
  async fn failed_transfers_count_nothing() {
    let limiter = Arc::new(Limiter::counting());
    let (transport, _) = RecordingConn::new();
    let transport = transport
      .with_read_error(io::ErrorKind::ConnectionReset)
      .with_failing_writes();
    let mut conn = RateLimitedConn::new(
      Box::new(transport),
      vec![limiter.clone()],
      vec![limiter.clone()],
    );
    let mut buf = [0u8; 16];
    assert!(conn.read(&mut buf).await.is_err());
    assert!(conn.write(&mut b"lost".to_vec()).await.is_err());
    assert_eq!(limiter.total(), 0);
  }

  #[tokio::test]
  async fn shared_and_exclusive_limiters() {
    let shared = Arc::new(Limiter::counting());
    let mut exclusive = Vec::new();
    for payload in [b"first".to_vec(), b"second!".to_vec()] {
      let own = Arc::new(Limiter::counting());
      let (transport, _) = RecordingConn::new();
      let mut conn = RateLimitedConn::new(
        Box::new(transport),
        Vec::new(),
        vec![shared.clone(), own.clone()],
      );
      assert_eq!(conn.write_limiters().len(), 2);
      assert!(conn.read_limiters().is_empty());
      let len = payload.len();
      conn.write(&mut payload.clone()).await.unwrap();
      assert_eq!(own.total(), len as u64);
      exclusive.push(own);
    }
    assert_eq!(shared.total(), 12);
  }

  #[test]
  fn quota_allows_one_second_of_burst() {
    let clock = FakeRelativeClock::default();
    let limiter = Limiter::with_clock(1000, &clock);
    assert_eq!(limiter.rate(), 1000);
    assert_eq!(limiter.update(1000), Ok(()));
    let shortfall = limiter.update(1000).unwrap_err();
    assert_eq!(shortfall.remaining, 1000);
    assert!(shortfall.wait > Duration::from_millis(900));
    assert!(shortfall.wait <= Duration::from_secs(1));
    assert_eq!(limiter.update(0), Ok(()));
    assert_eq!(limiter.total(), 2000);

    clock.advance(Duration::from_secs(1));
    assert_eq!(limiter.claim(1000), Ok(()));
    assert_eq!(limiter.total(), 2000);
    assert_eq!(Limiter::counting().update(u64::MAX / 2), Ok(()));
  }

  #[test]
  fn transfers_above_the_burst_are_admitted_in_steps() {
    let clock = FakeRelativeClock::default();
    let limiter = Limiter::with_clock(100, &clock);
    assert_eq!(limiter.update(250).unwrap_err().remaining, 150);
    clock.advance(Duration::from_secs(1));
    assert_eq!(limiter.claim(150).unwrap_err().remaining, 50);
    clock.advance(Duration::from_secs(1));
    assert_eq!(limiter.claim(50), Ok(()));
  }

  #[tokio::test(start_paused = true)]
  async fn writes_wait_out_owed_bytes() {
    let clock = FakeRelativeClock::default();
    let limiter = Arc::new(Limiter::with_clock(1000, &clock));
    let (transport, recording) = RecordingConn::new();
    let mut conn = RateLimitedConn::new(Box::new(transport), Vec::new(), vec![limiter.clone()]);
    let start = Instant::now();
    conn.write(&mut vec![0u8; 1000]).await.unwrap();
    conn.write(&mut vec![0u8; 1000]).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(1));
    assert_eq!(recording.lock().unwrap().calls.len(), 2);

    clock.advance(Duration::from_secs(1));
    conn.write(&mut vec![0u8; 10]).await.unwrap();
    assert!(start.elapsed() > Duration::from_millis(900));
    assert_eq!(limiter.total(), 2010);
    assert_eq!(recording.lock().unwrap().calls.len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn abandoned_waits_keep_their_debt() {
    let clock = FakeRelativeClock::default();
    let limiter = Arc::new(Limiter::with_clock(1000, &clock));
    let (transport, recording) = RecordingConn::new();
    let mut conn = RateLimitedConn::new(Box::new(transport), Vec::new(), vec![limiter.clone()]);
    conn.write(&mut vec![0u8; 2000]).await.unwrap();

    assert!(conn.write(&mut b"held".to_vec()).now_or_never().is_none());
    assert_eq!(recording.lock().unwrap().calls.len(), 1);

    clock.advance(Duration::from_secs(2));
    conn.write(&mut b"sent".to_vec()).await.unwrap();
    assert_eq!(recording.lock().unwrap().written().len(), 2004);
  }
}
