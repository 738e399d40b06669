use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{host::L2capTransport, peripheral::Peripheral, Result};

const BLUETOOTH_BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// Identifier the host stack assigns to a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PeripheralId(pub Uuid);

impl PeripheralId {
  pub fn new_random() -> Self {
    Self(Uuid::new_v4())
  }
}

impl fmt::Display for PeripheralId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.0, f)
  }
}

impl From<Uuid> for PeripheralId {
  fn from(uuid: Uuid) -> Self {
    Self(uuid)
  }
}

/// Parses a full UUID or a 16/32-bit Bluetooth SIG short form such as `180d` or `0x2a37`.
pub fn parse_uuid(input: &str) -> Result<Uuid> {
  let input = input.trim();
  let trimmed = input
    .strip_prefix("0x")
    .or_else(|| input.strip_prefix("0X"))
    .unwrap_or(input);
  let normalized = match trimmed.len() {
    4 => format!("0000{trimmed}{BLUETOOTH_BASE_UUID_SUFFIX}"),
    8 => format!("{trimmed}{BLUETOOTH_BASE_UUID_SUFFIX}"),
    _ => trimmed.to_string(),
  };
  Ok(Uuid::parse_str(&normalized)?)
}

/// Expands a 16-bit assigned number onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
  Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Power and availability of the local adapter, mirrored from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CentralState {
  #[default]
  Unknown,
  Resetting,
  Unsupported,
  Unauthorized,
  PoweredOff,
  PoweredOn,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PeripheralState {
  #[default]
  Disconnected,
  Connecting,
  Connected,
  Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteType {
  WithResponse,
  WithoutResponse,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicProperties {
  pub broadcast: bool,
  pub read: bool,
  pub write_without_response: bool,
  pub write: bool,
  pub notify: bool,
  pub indicate: bool,
  pub authenticated_signed_writes: bool,
  pub reliable_write: bool,
  pub writable_auxiliaries: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
  pub uuid: Uuid,
  pub peripheral: PeripheralId,
  #[serde(default)]
  pub is_primary: bool,
}

impl Service {
  pub fn new(peripheral: PeripheralId, uuid: Uuid) -> Self {
    Self {
      uuid,
      peripheral,
      is_primary: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Characteristic {
  pub uuid: Uuid,
  pub service: Uuid,
  pub peripheral: PeripheralId,
  #[serde(default)]
  pub properties: CharacteristicProperties,
  /// base64 encoded in serialized form
  #[serde(default, with = "base64_value")]
  pub value: Option<Vec<u8>>,
  #[serde(default)]
  pub is_notifying: bool,
}

impl Characteristic {
  pub fn new(service: &Service, uuid: Uuid) -> Self {
    Self {
      uuid,
      service: service.uuid,
      peripheral: service.peripheral,
      properties: CharacteristicProperties::default(),
      value: None,
      is_notifying: false,
    }
  }

  pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
    self.value = Some(value.into());
    self
  }

  pub fn with_notifying(mut self, is_notifying: bool) -> Self {
    self.is_notifying = is_notifying;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
  pub uuid: Uuid,
  pub characteristic: Uuid,
  pub service: Uuid,
  pub peripheral: PeripheralId,
  /// base64 encoded in serialized form
  #[serde(default, with = "base64_value")]
  pub value: Option<Vec<u8>>,
}

impl Descriptor {
  pub fn new(characteristic: &Characteristic, uuid: Uuid) -> Self {
    Self {
      uuid,
      characteristic: characteristic.uuid,
      service: characteristic.service,
      peripheral: characteristic.peripheral,
      value: None,
    }
  }

  pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
    self.value = Some(value.into());
    self
  }
}

/// Advertisement payload carried by one discovery callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementData {
  pub local_name: Option<String>,
  #[serde(default, with = "base64_value")]
  pub manufacturer_data: Option<Vec<u8>>,
  #[serde(default)]
  pub service_data: HashMap<Uuid, Vec<u8>>,
  #[serde(default)]
  pub services: Vec<Uuid>,
  #[serde(default)]
  pub overflow_services: Vec<Uuid>,
  #[serde(default)]
  pub solicited_services: Vec<Uuid>,
  pub tx_power_level: Option<i16>,
  pub is_connectable: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOptions {
  #[serde(default)]
  pub allow_duplicates: bool,
  #[serde(default)]
  pub solicited_services: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
  #[serde(default)]
  pub notify_on_connection: bool,
  #[serde(default)]
  pub notify_on_disconnection: bool,
  #[serde(default)]
  pub notify_on_notification: bool,
  pub start_delay_secs: Option<u32>,
}

/// One discovery callback mapped onto the canonical device handle.
#[derive(Debug, Clone)]
pub struct AdvertisingPeripheral {
  pub peripheral: Peripheral,
  pub advertisement: AdvertisementData,
  pub rssi: i16,
}

#[derive(Debug, Clone)]
pub enum PeripheralConnectionEvent {
  Connected(Peripheral),
  Disconnected {
    peripheral: Peripheral,
    error: Option<crate::HostError>,
  },
  FailedToConnect {
    peripheral: Peripheral,
    error: Option<crate::HostError>,
  },
}

impl PeripheralConnectionEvent {
  pub fn peripheral(&self) -> &Peripheral {
    match self {
      PeripheralConnectionEvent::Connected(peripheral) => peripheral,
      PeripheralConnectionEvent::Disconnected { peripheral, .. } => peripheral,
      PeripheralConnectionEvent::FailedToConnect { peripheral, .. } => peripheral,
    }
  }
}

#[derive(Debug, Clone)]
pub struct RestoredState {
  pub peripherals: Vec<Peripheral>,
  pub scan_services: Option<Vec<Uuid>>,
  pub scan_options: Option<ScanOptions>,
}

#[derive(Debug, Clone)]
pub enum StateRestorationEvent {
  WillRestoreState(RestoredState),
}

/// Elements of a notify stream: the enabled marker, then every value update.
#[derive(Debug, Clone, PartialEq)]
pub enum CharacteristicNotification {
  Enabled(Characteristic),
  Value(Characteristic),
}

impl CharacteristicNotification {
  pub fn characteristic(&self) -> &Characteristic {
    match self {
      CharacteristicNotification::Enabled(characteristic) => characteristic,
      CharacteristicNotification::Value(characteristic) => characteristic,
    }
  }
}

#[derive(Clone)]
pub struct L2capChannel {
  pub peripheral: PeripheralId,
  pub psm: u16,
  pub transport: Arc<dyn L2capTransport>,
}

impl fmt::Debug for L2capChannel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("L2capChannel")
      .field("peripheral", &self.peripheral)
      .field("psm", &self.psm)
      .finish_non_exhaustive()
  }
}

mod base64_value {
  use base64::{prelude::BASE64_STANDARD, Engine};
  use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

  pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    match value {
      Some(bytes) => serializer.serialize_some(&BASE64_STANDARD.encode(bytes)),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
  where
    D: Deserializer<'de>,
  {
    Option::<String>::deserialize(deserializer)?
      .map(|encoded| BASE64_STANDARD.decode(encoded).map_err(D::Error::custom))
      .transpose()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn short_uuids_expand_onto_the_base_uuid() {
    let heart_rate = parse_uuid("180d").unwrap();
    assert_eq!(heart_rate.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
    assert_eq!(heart_rate, uuid_from_u16(0x180d));
    assert_eq!(parse_uuid("0x2A37").unwrap(), uuid_from_u16(0x2a37));
    assert_eq!(parse_uuid("0X2A37").unwrap(), uuid_from_u16(0x2a37));
    assert_eq!(parse_uuid(" 0X0000180F ").unwrap(), uuid_from_u16(0x180f));
    assert!(parse_uuid("not-a-uuid").is_err());
  }

  #[test]
  fn characteristic_values_serialize_as_base64() {
    let service = Service::new(PeripheralId::new_random(), uuid_from_u16(0x180d));
    let characteristic = Characteristic::new(&service, uuid_from_u16(0x2a37)).with_value(vec![1, 2, 3]);
    let json = serde_json::to_value(&characteristic).unwrap();
    assert_eq!(json["value"], "AQID");
    assert_eq!(json["isNotifying"], false);

    let decoded: Characteristic = serde_json::from_value(json).unwrap();
    assert_eq!(decoded, characteristic);
  }
}
