use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use itertools::Itertools;

use crate::error::ConfigurationError;

/// Ordered `key=value` options, written as `"key1=value1,key2=value2"`.
///
/// Used both as the device address passed on the command line and as the
/// free-form options of `StreamArgs` (e.g. `spp=1000`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceAddr(BTreeMap<String, String>);

impl DeviceAddr {
  pub fn new() -> Self {
    Self::default()
  }

  /// Parses an address string. Separators may be `,` or `;`, keys without `=` get an empty value,
  /// whitespace around keys and values is ignored.
  pub fn parse(s: &str) -> Self {
    let map = s
      .split(|c| c == ',' || c == ';')
      .map(str::trim)
      .filter(|kv| !kv.is_empty())
      .map(|kv| match kv.split_once('=') {
        Some((k, v)) => (k.trim().to_owned(), v.trim().to_owned()),
        None => (kv.to_owned(), String::new()),
      })
      .collect();
    Self(map)
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.get(key).map(String::as_str)
  }

  pub fn has_key(&self, key: &str) -> bool {
    self.0.contains_key(key)
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
    self.0.insert(key.into(), value.to_string());
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Returns the value under `key` parsed as `T`, `default` if the key is absent.
  pub fn cast<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigurationError> {
    match self.0.get(key) {
      None => Ok(default),
      Some(value) => value.parse().map_err(|_| ConfigurationError::InvalidStreamArg {
        key: key.to_owned(),
        value: value.clone(),
      }),
    }
  }
}

impl Display for DeviceAddr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = self.0.iter().map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") }).join(",");
    f.write_str(&s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_and_cast() {
    let addr = DeviceAddr::parse(" type=sim, spp = 1000 ,verbose");
    assert_eq!(addr.get("type"), Some("sim"));
    assert_eq!(addr.cast::<usize>("spp", 0).unwrap(), 1000);
    assert!(addr.has_key("verbose"));
    assert_eq!(addr.cast::<f64>("missing", 2.5).unwrap(), 2.5);
  }

  #[test]
  fn test_cast_error_names_key() {
    let addr = DeviceAddr::parse("spp=lots");
    match addr.cast::<f64>("spp", 0.0) {
      Err(ConfigurationError::InvalidStreamArg { key, value }) => {
        assert_eq!(key, "spp");
        assert_eq!(value, "lots");
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn test_display_round_trip() {
    let addr = DeviceAddr::parse("b=2,a=1,flag");
    assert_eq!(addr.to_string(), "a=1,b=2,flag");
    assert_eq!(DeviceAddr::parse(&addr.to_string()), addr);
    assert!(DeviceAddr::parse("").is_empty());
  }
}
