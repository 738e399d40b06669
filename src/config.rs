use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  models::{parse_uuid, ScanOptions},
  Result,
};

fn default_event_capacity() -> usize {
  64
}

fn default_scan_capacity() -> usize {
  256
}

/// Settings of one [`CentralSession`](crate::CentralSession).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
  /// Buffer of every per-callback channel.
  #[serde(default = "default_event_capacity")]
  pub event_capacity: usize,
  #[serde(default = "default_scan_capacity")]
  pub scan_capacity: usize,
  /// Service filter used by `scan()`, in short or full UUID form.
  #[serde(default)]
  pub scan_services: Vec<String>,
  #[serde(default)]
  pub allow_duplicates: bool,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      event_capacity: default_event_capacity(),
      scan_capacity: default_scan_capacity(),
      scan_services: Vec::new(),
      allow_duplicates: false,
    }
  }
}

impl SessionConfig {
  pub fn from_json(json: &str) -> Result<Self> {
    Ok(serde_json::from_str(json)?)
  }

  /// The configured scan filter; `None` when it is empty.
  pub fn scan_service_uuids(&self) -> Result<Option<Vec<Uuid>>> {
    if self.scan_services.is_empty() {
      return Ok(None);
    }
    self.scan_services.iter().map(|service| parse_uuid(service)).collect::<Result<Vec<_>>>().map(Some)
  }

  pub fn scan_options(&self) -> ScanOptions {
    ScanOptions {
      allow_duplicates: self.allow_duplicates,
      ..ScanOptions::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{models::uuid_from_u16, Error};

  #[test]
  fn missing_keys_fall_back_to_defaults() {
    let config = SessionConfig::from_json(r#"{ "scanCapacity": 32 }"#).unwrap();
    assert_eq!(config.event_capacity, 64);
    assert_eq!(config.scan_capacity, 32);
    assert_eq!(config.scan_service_uuids().unwrap(), None);
    assert!(!config.scan_options().allow_duplicates);
  }

  #[test]
  fn scan_services_accept_short_forms() {
    let config = SessionConfig::from_json(
      r#"{ "scanServices": ["180d", "0000180f-0000-1000-8000-00805f9b34fb"], "allowDuplicates": true }"#,
    )
    .unwrap();
    assert_eq!(
      config.scan_service_uuids().unwrap(),
      Some(vec![uuid_from_u16(0x180d), uuid_from_u16(0x180f)])
    );
    assert!(config.scan_options().allow_duplicates);
  }

  #[test]
  fn invalid_input_is_reported() {
    assert!(matches!(SessionConfig::from_json("{"), Err(Error::Json(_))));
    let config = SessionConfig {
      scan_services: vec!["heart-rate".into()],
      ..SessionConfig::default()
    };
    assert!(matches!(config.scan_service_uuids(), Err(Error::UuidParse(_))));
  }
}
