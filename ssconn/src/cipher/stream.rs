// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fmt;
use std::str::FromStr;

use aes::{Aes128, Aes192, Aes256};
use chacha20::{ChaCha20, ChaCha20Legacy};
use cipher::{KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use rand::RngCore;

use super::{CipherError, CipherProvider, Decrypter, Encrypter};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Stream cipher methods understood by [StreamCipherProvider]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CipherMethod {
  Aes128Ctr,
  Aes192Ctr,
  Aes256Ctr,
  Chacha20,
  Chacha20Ietf,
}

impl CipherMethod {
  pub const ALL: [CipherMethod; 5] = [
    CipherMethod::Aes128Ctr,
    CipherMethod::Aes192Ctr,
    CipherMethod::Aes256Ctr,
    CipherMethod::Chacha20,
    CipherMethod::Chacha20Ietf,
  ];

  pub fn name(self) -> &'static str {
    match self {
      CipherMethod::Aes128Ctr => "aes-128-ctr",
      CipherMethod::Aes192Ctr => "aes-192-ctr",
      CipherMethod::Aes256Ctr => "aes-256-ctr",
      CipherMethod::Chacha20 => "chacha20",
      CipherMethod::Chacha20Ietf => "chacha20-ietf",
    }
  }

  pub fn key_len(self) -> usize {
    match self {
      CipherMethod::Aes128Ctr => 16,
      CipherMethod::Aes192Ctr => 24,
      CipherMethod::Aes256Ctr | CipherMethod::Chacha20 | CipherMethod::Chacha20Ietf => 32,
    }
  }

  pub fn iv_len(self) -> usize {
    match self {
      CipherMethod::Aes128Ctr | CipherMethod::Aes192Ctr | CipherMethod::Aes256Ctr => 16,
      CipherMethod::Chacha20 => 8,
      CipherMethod::Chacha20Ietf => 12,
    }
  }
}

impl FromStr for CipherMethod {
  type Err = CipherError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    CipherMethod::ALL
      .into_iter()
      .find(|method| method.name().eq_ignore_ascii_case(s))
      .ok_or_else(|| CipherError::UnknownMethod(s.to_string()))
  }
}

impl fmt::Display for CipherMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// OpenSSL's `EVP_BytesToKey` with MD5 and a single iteration, as stream-cipher
/// deployments derive their keys from a shared password
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
  let mut key = Vec::with_capacity(key_len + 16);
  let mut previous = Vec::new();
  while key.len() < key_len {
    let mut hasher = Md5::new();
    hasher.update(&previous);
    hasher.update(password);
    previous = hasher.finalize().to_vec();
    key.extend_from_slice(&previous);
  }
  key.truncate(key_len);
  key
}

enum Keystream {
  Aes128Ctr(Aes128Ctr),
  Aes192Ctr(Aes192Ctr),
  Aes256Ctr(Aes256Ctr),
  Chacha20(ChaCha20Legacy),
  Chacha20Ietf(ChaCha20),
}

impl Keystream {
  fn new(method: CipherMethod, key: &[u8], iv: &[u8]) -> Result<Self, cipher::InvalidLength> {
    Ok(match method {
      CipherMethod::Aes128Ctr => Keystream::Aes128Ctr(Aes128Ctr::new_from_slices(key, iv)?),
      CipherMethod::Aes192Ctr => Keystream::Aes192Ctr(Aes192Ctr::new_from_slices(key, iv)?),
      CipherMethod::Aes256Ctr => Keystream::Aes256Ctr(Aes256Ctr::new_from_slices(key, iv)?),
      CipherMethod::Chacha20 => Keystream::Chacha20(ChaCha20Legacy::new_from_slices(key, iv)?),
      CipherMethod::Chacha20Ietf => Keystream::Chacha20Ietf(ChaCha20::new_from_slices(key, iv)?),
    })
  }

  fn apply(&mut self, buf: &mut [u8]) {
    match self {
      Keystream::Aes128Ctr(c) => c.apply_keystream(buf),
      Keystream::Aes192Ctr(c) => c.apply_keystream(buf),
      Keystream::Aes256Ctr(c) => c.apply_keystream(buf),
      Keystream::Chacha20(c) => c.apply_keystream(buf),
      Keystream::Chacha20Ietf(c) => c.apply_keystream(buf),
    }
  }
}

/// A keystream together with the IV it was seeded from
struct SeededCipher {
  keystream: Keystream,
  iv: Vec<u8>,
}

impl SeededCipher {
  fn new(method: CipherMethod, password: &str, iv: Vec<u8>) -> Result<Self, CipherError> {
    if password.is_empty() {
      return Err(CipherError::EmptyPassword);
    }
    let key = evp_bytes_to_key(password.as_bytes(), method.key_len());
    let keystream =
      Keystream::new(method, &key, &iv).map_err(|_| CipherError::InvalidIvLength {
        method: method.to_string(),
        expected: method.iv_len(),
        received: iv.len(),
      })?;
    Ok(Self { keystream, iv })
  }
}

impl Encrypter for SeededCipher {
  fn iv(&self) -> &[u8] {
    &self.iv
  }

  fn encrypt(&mut self, buf: &mut [u8]) {
    self.keystream.apply(buf)
  }
}

impl Decrypter for SeededCipher {
  fn decrypt(&mut self, buf: &mut [u8]) {
    self.keystream.apply(buf)
  }
}

/// [CipherProvider] backed by RustCrypto stream ciphers
#[derive(Debug, Default, Copy, Clone)]
pub struct StreamCipherProvider;

impl CipherProvider for StreamCipherProvider {
  fn iv_len(&self, method: &str) -> Result<usize, CipherError> {
    Ok(method.parse::<CipherMethod>()?.iv_len())
  }

  fn new_encrypter(
    &self,
    method: &str,
    password: &str,
  ) -> Result<Box<dyn Encrypter>, CipherError> {
    let method = method.parse::<CipherMethod>()?;
    let mut iv = vec![0u8; method.iv_len()];
    rand::thread_rng().fill_bytes(&mut iv);
    Ok(Box::new(SeededCipher::new(method, password, iv)?))
  }

  fn new_decrypter(
    &self,
    method: &str,
    password: &str,
    iv: &[u8],
  ) -> Result<Box<dyn Decrypter>, CipherError> {
    let method = method.parse::<CipherMethod>()?;
    if iv.len() != method.iv_len() {
      return Err(CipherError::InvalidIvLength {
        method: method.to_string(),
        expected: method.iv_len(),
        received: iv.len(),
      });
    }
    Ok(Box::new(SeededCipher::new(method, password, iv.to_vec())?))
  }
}
