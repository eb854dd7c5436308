// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io;
use std::net::SocketAddr;
use std::path::Path;

use crate::cipher::CipherMethod;
use crate::config::Layer;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> io::Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)?.next().ok_or_else(|| {
    io::Error::new(
      io::ErrorKind::NotFound,
      "No addresses were resolved from the given host",
    )
  })
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_method(v: &str) -> Result<(), String> {
  v.parse::<CipherMethod>()
    .map(|_| ())
    .map_err(|e| e.to_string())
}

pub fn validate_layer(v: &str) -> Result<(), String> {
  v.parse::<Layer>().map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_byte_count(v: &str) -> Result<(), String> {
  v.parse::<usize>()
    .map(|_| ())
    .map_err(|e| format!("Expected a byte count: {}", e))
}

#[cfg(test)]
mod tests {
  use super::{
    parse_socketaddr, validate_byte_count, validate_existing_file, validate_layer, validate_method,
    validate_socketaddr,
  };

  #[test]
  fn socket_addresses() {
    assert_eq!(
      parse_socketaddr("127.0.0.1:8388").unwrap(),
      std::net::SocketAddr::from(([127, 0, 0, 1], 8388))
    );
    assert!(validate_socketaddr("[::1]:443").is_ok());
    assert!(validate_socketaddr("127.0.0.1").is_err());
  }

  #[test]
  fn option_values() {
    assert!(validate_method("aes-128-ctr").is_ok());
    assert!(validate_method("rc4").is_err());
    assert!(validate_layer("rate-limit").is_ok());
    assert!(validate_layer("RateLimit").is_err());
    assert!(validate_byte_count("4096").is_ok());
    assert!(validate_byte_count("-1").is_err());
    assert!(validate_existing_file("/definitely/not/a/real/path.json").is_err());
  }
}
