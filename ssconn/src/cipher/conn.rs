// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use super::{CipherError, CipherSettings, Decrypter, Encrypter};
use crate::conn::{batch_len, BoxedConn, Conn};
use crate::lifecycle::LifecycleHandle;

#[derive(thiserror::Error, Debug)]
pub enum CipherConnError {
  #[error("Stream ended after {received} of {expected} IV bytes")]
  ShortIv { expected: usize, received: usize },
  #[error("Cipher construction failed: {0}")]
  Cipher(#[from] CipherError),
  #[error("Cipher stream is unusable after an earlier failure")]
  Unusable,
}

impl From<CipherConnError> for io::Error {
  fn from(e: CipherConnError) -> Self {
    let kind = match &e {
      CipherConnError::ShortIv { .. } => io::ErrorKind::UnexpectedEof,
      CipherConnError::Cipher(_) => io::ErrorKind::InvalidInput,
      CipherConnError::Unusable => io::ErrorKind::BrokenPipe,
    };
    io::Error::new(kind, e)
  }
}

enum EncryptState {
  IvPending,
  Active(Box<dyn Encrypter>),
  Bypassed,
  Failed,
}

enum DecryptState {
  AwaitingIv { iv: Vec<u8>, filled: usize },
  Active(Box<dyn Decrypter>),
  Bypassed,
  Failed,
}

/// Splits a transfer of `len` bytes against what remains of a partial-encryption budget
///
/// Returns the length of the prefix which must still be transformed, and
/// whether the budget is spent once that prefix is. `transformed` never
/// exceeds `threshold`.
fn threshold_span(threshold: Option<usize>, transformed: &mut usize, len: usize) -> (usize, bool) {
  match threshold {
    None => (len, false),
    Some(threshold) => {
      let remaining = threshold - *transformed;
      if len >= remaining {
        *transformed = threshold;
        (remaining, true)
      } else {
        *transformed += len;
        (len, false)
      }
    }
  }
}

/// Stream-cipher framing over an inner connection
///
/// Each direction carries its IV in cleartext ahead of the first ciphertext
/// byte. In partial mode only the first `partial` bytes of each direction are
/// transformed, after which the cipher is dropped and bytes pass through.
pub struct CipherConn {
  inner: BoxedConn,
  settings: Arc<CipherSettings>,
  enc: EncryptState,
  dec: DecryptState,
  encrypted: usize,
  decrypted: usize,
  deferred_close: Option<LifecycleHandle>,
}

impl CipherConn {
  pub fn new(inner: BoxedConn, settings: Arc<CipherSettings>) -> Self {
    Self {
      inner,
      settings,
      enc: EncryptState::IvPending,
      dec: DecryptState::AwaitingIv {
        iv: Vec::new(),
        filled: 0,
      },
      encrypted: 0,
      decrypted: 0,
      deferred_close: None,
    }
  }

  pub fn settings(&self) -> &CipherSettings {
    &self.settings
  }

  /// Routes the next `close` through `pool`, which closes the transport at a randomized later time
  pub fn enable_deferred_close(&mut self, pool: LifecycleHandle) {
    self.deferred_close = Some(pool);
  }

  pub fn disable_deferred_close(&mut self) {
    self.deferred_close = None;
  }

  /// Reads the peer's IV, keeping progress across cancelled reads, and seeds the decrypter
  async fn receive_iv(&mut self) -> io::Result<()> {
    let expected = self.settings.iv_len;
    loop {
      let (iv, filled) = match &mut self.dec {
        DecryptState::AwaitingIv { iv, filled } => (iv, filled),
        _ => return Ok(()),
      };
      if iv.len() != expected {
        iv.resize(expected, 0);
      }
      if *filled == expected {
        let iv = std::mem::take(iv);
        let settings = &self.settings;
        match settings
          .provider
          .new_decrypter(&settings.method, &settings.password, &iv)
        {
          Ok(decrypter) => self.dec = DecryptState::Active(decrypter),
          Err(e) => {
            self.dec = DecryptState::Failed;
            return Err(CipherConnError::Cipher(e).into());
          }
        }
        return Ok(());
      }
      match self.inner.read(&mut iv[*filled..]).await? {
        0 => {
          let received = *filled;
          self.dec = DecryptState::Failed;
          return Err(CipherConnError::ShortIv { expected, received }.into());
        }
        n => *filled += n,
      }
    }
  }

  /// Encrypts and sends a batch, leading with the IV on the first call
  async fn send(&mut self, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
    let body_len = batch_len(bufs);
    let mut iv = None;
    match self.enc {
      EncryptState::Bypassed => {
        self.forward(bufs).await?;
        return Ok(body_len);
      }
      EncryptState::Failed => return Err(CipherConnError::Unusable.into()),
      EncryptState::IvPending => {
        let settings = &self.settings;
        match settings
          .provider
          .new_encrypter(&settings.method, &settings.password)
        {
          Ok(encrypter) => {
            iv = Some(encrypter.iv().to_vec());
            self.enc = EncryptState::Active(encrypter);
          }
          Err(e) => {
            self.enc = EncryptState::Failed;
            return Err(CipherConnError::Cipher(e).into());
          }
        }
      }
      EncryptState::Active(_) => {}
    }

    let partial = self.settings.partial;
    let mut exhausted = false;
    if let EncryptState::Active(encrypter) = &mut self.enc {
      for buf in bufs.iter_mut() {
        let (span, spent) = threshold_span(partial, &mut self.encrypted, buf.len());
        encrypter.encrypt(&mut buf[..span]);
        if spent {
          exhausted = true;
          break;
        }
      }
    }
    if exhausted {
      tracing::trace!(threshold = ?partial, "partial encryption budget spent on send");
      self.enc = EncryptState::Bypassed;
    }

    match iv {
      Some(mut iv) => {
        // The IV and the body it precedes leave as one batch
        let mut batch: Vec<&mut [u8]> = Vec::with_capacity(bufs.len() + 1);
        batch.push(&mut iv[..]);
        batch.extend(bufs.iter_mut().map(|buf| &mut **buf));
        self.inner.write_buffers(&mut batch[..]).await?;
      }
      None => self.forward(bufs).await?,
    }
    Ok(body_len)
  }

  async fn forward(&mut self, bufs: &mut [&mut [u8]]) -> io::Result<()> {
    if bufs.len() == 1 {
      self.inner.write(&mut *bufs[0]).await?;
    } else {
      self.inner.write_buffers(bufs).await?;
    }
    Ok(())
  }
}

impl Conn for CipherConn {
  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      match self.dec {
        DecryptState::Bypassed => return self.inner.read(buf).await,
        DecryptState::Failed => return Err(CipherConnError::Unusable.into()),
        DecryptState::AwaitingIv { .. } => self.receive_iv().await?,
        DecryptState::Active(_) => {}
      }
      let n = self.inner.read(buf).await?;
      if n == 0 {
        return Ok(0);
      }
      let (span, spent) = threshold_span(self.settings.partial, &mut self.decrypted, n);
      if let DecryptState::Active(decrypter) = &mut self.dec {
        decrypter.decrypt(&mut buf[..span]);
      }
      if spent {
        tracing::trace!(threshold = ?self.settings.partial, "partial encryption budget spent on receive");
        self.dec = DecryptState::Bypassed;
      }
      Ok(n)
    }
    .boxed()
  }

  fn write<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move { self.send(&mut [buf]).await }.boxed()
  }

  fn write_buffers<'a, 'b>(
    &'a mut self,
    bufs: &'a mut [&'b mut [u8]],
  ) -> BoxFuture<'a, io::Result<usize>> {
    async move { self.send(bufs).await }.boxed()
  }

  fn close(mut self: Box<Self>) -> BoxFuture<'static, io::Result<()>> {
    match self.deferred_close.take() {
      Some(pool) => async move { pool.close_deferred(self).await }.boxed(),
      None => self.inner.close(),
    }
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    self.inner.local_addr()
  }

  fn remote_addr(&self) -> io::Result<SocketAddr> {
    self.inner.remote_addr()
  }
}
