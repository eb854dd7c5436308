// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

pub mod conn;
pub mod stream;

pub use conn::{CipherConn, CipherConnError};
pub use stream::{CipherMethod, StreamCipherProvider};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
  #[error("Unknown cipher method {0:?}")]
  UnknownMethod(String),
  #[error("Cipher method {method} requires an IV of {expected} bytes, received {received}")]
  InvalidIvLength {
    method: String,
    expected: usize,
    received: usize,
  },
  #[error("Password must not be empty")]
  EmptyPassword,
}

/// Encrypts one direction of a stream, starting from its own random IV
pub trait Encrypter: Send {
  /// The IV this encrypter was seeded with, to be sent to the peer once
  fn iv(&self) -> &[u8];

  fn encrypt(&mut self, buf: &mut [u8]);
}

/// Decrypts one direction of a stream, seeded with the IV received from the peer
pub trait Decrypter: Send {
  fn decrypt(&mut self, buf: &mut [u8]);
}

/// Constructs stream ciphers by method name
///
/// Providers never retain the ciphers they hand out; each connection
/// direction receives a fresh instance.
#[cfg_attr(test, mockall::automock)]
pub trait CipherProvider: Send + Sync {
  fn iv_len(&self, method: &str) -> Result<usize, CipherError>;

  fn new_encrypter(&self, method: &str, password: &str)
    -> Result<Box<dyn Encrypter>, CipherError>;

  fn new_decrypter(
    &self,
    method: &str,
    password: &str,
    iv: &[u8],
  ) -> Result<Box<dyn Decrypter>, CipherError>;
}

/// Everything a [CipherConn] needs to build its ciphers
///
/// Resolved once per listener and shared by every connection it accepts.
#[derive(Clone)]
pub struct CipherSettings {
  pub method: String,
  pub password: String,
  pub iv_len: usize,
  /// Byte count after which each direction passes through unencrypted
  pub partial: Option<usize>,
  pub provider: Arc<dyn CipherProvider>,
}

impl CipherSettings {
  pub fn new(
    provider: Arc<dyn CipherProvider>,
    method: impl Into<String>,
    password: impl Into<String>,
    partial: Option<usize>,
  ) -> Result<Self, CipherError> {
    let method = method.into();
    let password = password.into();
    if password.is_empty() {
      return Err(CipherError::EmptyPassword);
    }
    let iv_len = provider.iv_len(&method)?;
    Ok(Self {
      method,
      password,
      iv_len,
      partial,
      provider,
    })
  }
}

impl std::fmt::Debug for CipherSettings {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CipherSettings")
      .field("method", &self.method)
      .field("iv_len", &self.iv_len)
      .field("partial", &self.partial)
      .finish_non_exhaustive()
  }
}
