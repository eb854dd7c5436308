// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cipher::CipherError;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failure parsing configuration: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Failure reading configuration from {path:?}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("Layer {0} is configured more than once")]
  DuplicateLayer(Layer),
  #[error("Unknown layer {0:?}")]
  UnknownLayer(String),
  #[error("Invalid cipher configuration: {0}")]
  Cipher(#[from] CipherError),
}

/// A decorator applied over the cipher, in configuration order
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layer {
  RateLimit,
  Camouflage,
  Compress,
  Debug,
}

impl Layer {
  pub const ALL: [Layer; 4] = [
    Layer::RateLimit,
    Layer::Camouflage,
    Layer::Compress,
    Layer::Debug,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Layer::RateLimit => "rate-limit",
      Layer::Camouflage => "camouflage",
      Layer::Compress => "compress",
      Layer::Debug => "debug",
    }
  }
}

impl FromStr for Layer {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Layer::ALL
      .into_iter()
      .find(|layer| layer.name() == s)
      .ok_or_else(|| ConfigError::UnknownLayer(s.to_string()))
  }
}

impl fmt::Display for Layer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Limiter rates in bytes per second; 0 counts without pacing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitConfig {
  /// Read limiters shared by every connection of a listener
  pub read: Vec<u64>,
  /// Write limiters shared by every connection of a listener
  pub write: Vec<u64>,
  /// Rate of a read limiter created for each connection
  pub per_conn_read: Option<u64>,
  pub per_conn_write: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  pub method: String,
  pub password: String,
  /// Bytes of each direction to encrypt before passing traffic through in the clear
  #[serde(default)]
  pub partial_encryption: Option<usize>,
  #[serde(default)]
  pub defer_close: bool,
  #[serde(default)]
  pub layers: Vec<Layer>,
  #[serde(default)]
  pub limits: LimitConfig,
}

impl Config {
  pub fn new(method: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      method: method.into(),
      password: password.into(),
      partial_encryption: None,
      defer_close: false,
      layers: Vec::new(),
      limits: LimitConfig::default(),
    }
  }

  pub fn from_json_slice(data: &[u8]) -> Result<Self, ConfigError> {
    let config = serde_json::from_slice::<Config>(data)?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json_slice(&data)
  }

  /// Checks what can be checked without a cipher provider
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.password.is_empty() {
      return Err(CipherError::EmptyPassword.into());
    }
    for (i, layer) in self.layers.iter().enumerate() {
      if self.layers[..i].contains(layer) {
        return Err(ConfigError::DuplicateLayer(*layer));
      }
    }
    Ok(())
  }
}
