// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use crate::camouflage::CamouflageConn;
use crate::cipher::{CipherConn, CipherProvider, CipherSettings};
use crate::compress::CompressedConn;
use crate::config::{Config, ConfigError, Layer};
use crate::conn::{describe_remote, BoxedConn};
use crate::debug::DebugConn;
use crate::lifecycle::LifecycleHandle;
use crate::limit::{Limiter, RateLimitedConn};

/// Turns accepted transports into the decorator stack a [Config] describes
///
/// Listener-wide state, namely the resolved cipher settings and the shared
/// limiters, is created once here and handed to every connection.
pub struct ConnDecorator {
  config: Arc<Config>,
  cipher: Arc<CipherSettings>,
  read_limiters: Vec<Arc<Limiter>>,
  write_limiters: Vec<Arc<Limiter>>,
  lifecycle: Option<LifecycleHandle>,
}

fn limiters(rates: &[u64]) -> Vec<Arc<Limiter>> {
  rates.iter().map(|&rate| Arc::new(Limiter::new(rate))).collect()
}

impl ConnDecorator {
  pub fn new(config: Arc<Config>, provider: Arc<dyn CipherProvider>) -> Result<Self, ConfigError> {
    config.validate()?;
    let cipher = CipherSettings::new(
      provider,
      config.method.as_str(),
      config.password.as_str(),
      config.partial_encryption,
    )?;
    Ok(Self {
      read_limiters: limiters(&config.limits.read),
      write_limiters: limiters(&config.limits.write),
      cipher: Arc::new(cipher),
      config,
      lifecycle: None,
    })
  }

  /// Defers closes through `pool`, if the configuration asks for deferral
  pub fn with_lifecycle(mut self, pool: LifecycleHandle) -> Self {
    if self.config.defer_close {
      self.lifecycle = Some(pool);
    }
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn read_limiters(&self) -> &[Arc<Limiter>] {
    &self.read_limiters
  }

  pub fn write_limiters(&self) -> &[Arc<Limiter>] {
    &self.write_limiters
  }

  pub fn decorate(&self, transport: BoxedConn) -> BoxedConn {
    tracing::trace!(
      remote = %describe_remote(&*transport),
      layers = ?self.config.layers,
      "decorating connection"
    );
    let mut cipher = CipherConn::new(transport, self.cipher.clone());
    if let Some(pool) = &self.lifecycle {
      cipher.enable_deferred_close(pool.clone());
    }
    let mut conn: BoxedConn = Box::new(cipher);
    for layer in &self.config.layers {
      conn = match layer {
        Layer::RateLimit => Box::new(self.rate_limited(conn)),
        Layer::Camouflage => Box::new(CamouflageConn::new(conn)),
        Layer::Compress => Box::new(CompressedConn::new(conn)),
        Layer::Debug => Box::new(DebugConn::new(conn)),
      };
    }
    conn
  }

  fn rate_limited(&self, conn: BoxedConn) -> RateLimitedConn {
    let limits = &self.config.limits;
    let mut read_limiters = self.read_limiters.clone();
    read_limiters.extend(limits.per_conn_read.map(|rate| Arc::new(Limiter::new(rate))));
    let mut write_limiters = self.write_limiters.clone();
    write_limiters.extend(limits.per_conn_write.map(|rate| Arc::new(Limiter::new(rate))));
    RateLimitedConn::new(conn, read_limiters, write_limiters)
  }
}
