// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Parsers and `clap` validator callbacks for command-line arguments
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn parse_millis(v: &str) -> Result<Duration> {
  v.parse::<u64>()
    .map(Duration::from_millis)
    .map_err(|_| AnyErr::msg("Duration must be a whole number of milliseconds"))
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_millis(v: &str) -> Result<(), String> {
  parse_millis(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::{parse_millis, parse_socketaddr, validate_existing_file, validate_socketaddr};
  use std::time::Duration;

  #[test]
  fn socket_addresses() {
    assert_eq!(
      parse_socketaddr("127.0.0.1:9000").unwrap(),
      "127.0.0.1:9000".parse().unwrap()
    );
    assert!(validate_socketaddr("127.0.0.1").is_err());
    assert!(validate_socketaddr("not an address:port").is_err());
  }

  #[test]
  fn millis() {
    assert_eq!(parse_millis("250").unwrap(), Duration::from_millis(250));
    assert!(parse_millis("-1").is_err());
    assert!(parse_millis("1.5").is_err());
  }

  #[test]
  fn missing_files_are_rejected() {
    assert!(validate_existing_file("/definitely/not/a/real/file.json").is_err());
  }
}
