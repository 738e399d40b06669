use std::fmt;

use serde::{ser::Serializer, Serialize};

use crate::models::{Characteristic, Descriptor, PeripheralId, Service};
use crate::peripheral::Peripheral;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the host stack for a single action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("host error {code}: {message}")]
pub struct HostError {
  pub code: i64,
  pub message: String,
}

impl HostError {
  pub fn new(code: i64, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
    }
  }
}

/// The host action a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
  ReadRssi,
  DiscoverServices,
  DiscoverIncludedServices,
  DiscoverCharacteristics,
  ReadCharacteristic,
  WriteCharacteristic,
  UpdateNotificationState,
  DiscoverDescriptors,
  ReadDescriptor,
  WriteDescriptor,
  OpenChannel,
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Operation::ReadRssi => "read RSSI",
      Operation::DiscoverServices => "discover services",
      Operation::DiscoverIncludedServices => "discover included services",
      Operation::DiscoverCharacteristics => "discover characteristics",
      Operation::ReadCharacteristic => "read characteristic value",
      Operation::WriteCharacteristic => "write characteristic value",
      Operation::UpdateNotificationState => "update notification state",
      Operation::DiscoverDescriptors => "discover descriptors",
      Operation::ReadDescriptor => "read descriptor value",
      Operation::WriteDescriptor => "write descriptor value",
      Operation::OpenChannel => "open L2CAP channel",
    };
    f.write_str(name)
  }
}

/// The entity an operation was aimed at.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
  Peripheral(PeripheralId),
  Service(Service),
  Characteristic(Characteristic),
  Descriptor(Descriptor),
}

impl fmt::Display for Entity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Entity::Peripheral(id) => write!(f, "peripheral {id}"),
      Entity::Service(service) => write!(f, "service {} on {}", service.uuid, service.peripheral),
      Entity::Characteristic(characteristic) => write!(
        f,
        "characteristic {} of service {} on {}",
        characteristic.uuid, characteristic.service, characteristic.peripheral
      ),
      Entity::Descriptor(descriptor) => write!(
        f,
        "descriptor {} of characteristic {} on {}",
        descriptor.uuid, descriptor.characteristic, descriptor.peripheral
      ),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error(transparent)]
  UuidParse(#[from] uuid::Error),
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  #[cfg(feature = "btleplug")]
  #[error(transparent)]
  Btleplug(#[from] btleplug::Error),
  #[cfg(feature = "btleplug")]
  #[error("Bluetooth adapter is not available on this system")]
  NoAdapter,
  #[error("{entity} was not produced by this session for peripheral {expected}")]
  WrapperTypeMismatch { expected: PeripheralId, entity: Entity },
  #[error("this session is no longer the delegate of the central manager")]
  DelegateOwnershipLost,
  #[error("failed to {operation} for {entity}: {cause}")]
  OperationFailed {
    operation: Operation,
    entity: Entity,
    cause: HostError,
  },
  #[error("failed to connect to peripheral {}{}", .peripheral.id(), format_cause(.cause))]
  FailedToConnect {
    peripheral: Peripheral,
    cause: Option<HostError>,
  },
  #[error("lost connection to peripheral {}{}", .peripheral.id(), format_cause(.cause))]
  LostConnection {
    peripheral: Peripheral,
    cause: Option<HostError>,
  },
  #[error("host opened no L2CAP channel for PSM {psm} on {peripheral} and reported no error")]
  ChannelOpenFailedWithNoChannelAndNoError { peripheral: PeripheralId, psm: u16 },
  #[error("listener on {channel} fell behind and skipped {skipped} events")]
  EventsLagged { channel: &'static str, skipped: u64 },
  #[error("event source {channel} was closed")]
  SessionClosed { channel: &'static str },
}

impl Error {
  pub(crate) fn operation(operation: Operation, entity: Entity, cause: HostError) -> Self {
    Error::OperationFailed {
      operation,
      entity,
      cause,
    }
  }

  /// Whether the error ends every stream of the session rather than a single operation.
  pub fn is_session_wide(&self) -> bool {
    matches!(self, Error::DelegateOwnershipLost)
  }
}

fn format_cause(cause: &Option<HostError>) -> String {
  match cause {
    Some(cause) => format!(": {cause}"),
    None => String::new(),
  }
}

impl Serialize for Error {
  fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(self.to_string().as_ref())
  }
}
