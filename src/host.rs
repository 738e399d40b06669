//! The host stack seen from this crate: commands go out through [`HostCentral`] and
//! [`HostPeripheral`], every outcome comes back through the delegate traits installed
//! in a [`DelegateSlot`].

use std::{
  fmt,
  sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, PoisonError, RwLock,
  },
};

use tokio::sync::watch;
use uuid::Uuid;

use crate::{
  models::{
    AdvertisementData, CentralState, Characteristic, ConnectOptions, Descriptor, L2capChannel,
    PeripheralId, PeripheralState, ScanOptions, Service, WriteType,
  },
  HostError,
};

pub type HostPeripheralRef = Arc<dyn HostPeripheral>;

/// Identity of whoever currently owns a delegate slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelegateToken(u64);

impl DelegateToken {
  pub fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Self(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

/// The single delegate slot of a host object.
///
/// The host keeps exactly one delegate at a time. Installing a new one replaces the
/// previous owner, which can observe the change through [`DelegateSlot::subscribe`].
pub struct DelegateSlot<D: ?Sized> {
  delegate: RwLock<Option<Arc<D>>>,
  owner: watch::Sender<Option<DelegateToken>>,
  installs: AtomicUsize,
}

impl<D: ?Sized> DelegateSlot<D> {
  pub fn new() -> Self {
    let (owner, _) = watch::channel(None);
    Self {
      delegate: RwLock::new(None),
      owner,
      installs: AtomicUsize::new(0),
    }
  }

  pub fn install(&self, token: DelegateToken, delegate: Arc<D>) {
    *self.delegate.write().unwrap_or_else(PoisonError::into_inner) = Some(delegate);
    self.installs.fetch_add(1, Ordering::Relaxed);
    self.owner.send_replace(Some(token));
  }

  /// How many times a delegate was installed over the life of the slot.
  pub fn installs(&self) -> usize {
    self.installs.load(Ordering::Relaxed)
  }

  pub fn clear(&self) {
    *self.delegate.write().unwrap_or_else(PoisonError::into_inner) = None;
    self.owner.send_replace(None);
  }

  pub fn owner(&self) -> Option<DelegateToken> {
    *self.owner.borrow()
  }

  pub fn is_owned_by(&self, token: DelegateToken) -> bool {
    self.owner() == Some(token)
  }

  pub fn subscribe(&self) -> watch::Receiver<Option<DelegateToken>> {
    self.owner.subscribe()
  }

  pub fn delegate(&self) -> Option<Arc<D>> {
    self.delegate.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  /// Delivers a callback to the installed delegate, if any.
  pub fn notify(&self, callback: impl FnOnce(&D)) {
    if let Some(delegate) = self.delegate() {
      callback(&delegate);
    }
  }
}

impl<D: ?Sized> Default for DelegateSlot<D> {
  fn default() -> Self {
    Self::new()
  }
}

impl<D: ?Sized> fmt::Debug for DelegateSlot<D> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DelegateSlot").field("owner", &self.owner()).finish()
  }
}

/// Commands of the local adapter. Each one returns immediately; its outcome arrives
/// later through [`CentralDelegate`].
pub trait HostCentral: Send + Sync + 'static {
  fn state(&self) -> CentralState;
  fn is_scanning(&self) -> bool;
  fn delegate_slot(&self) -> &DelegateSlot<dyn CentralDelegate>;
  fn scan_for_peripherals(&self, services: Option<&[Uuid]>, options: &ScanOptions);
  fn stop_scan(&self);
  fn connect(&self, peripheral: &HostPeripheralRef, options: &ConnectOptions);
  fn cancel_peripheral_connection(&self, peripheral: &HostPeripheralRef);
  fn retrieve_peripherals(&self, identifiers: &[PeripheralId]) -> Vec<HostPeripheralRef>;
  fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<HostPeripheralRef>;
}

/// Callback surface of the local adapter.
pub trait CentralDelegate: Send + Sync {
  fn did_update_state(&self, state: CentralState);
  fn did_update_scanning(&self, is_scanning: bool);
  fn will_restore_state(&self, restored: HostRestoredState);
  fn did_discover(&self, peripheral: HostPeripheralRef, advertisement: AdvertisementData, rssi: i16);
  fn did_connect(&self, peripheral: HostPeripheralRef);
  fn did_fail_to_connect(&self, peripheral: HostPeripheralRef, error: Option<HostError>);
  fn did_disconnect(&self, peripheral: HostPeripheralRef, error: Option<HostError>);
}

#[derive(Clone)]
pub struct HostRestoredState {
  pub peripherals: Vec<HostPeripheralRef>,
  pub scan_services: Option<Vec<Uuid>>,
  pub scan_options: Option<ScanOptions>,
}

/// Commands of one remote device. Outcomes arrive through [`PeripheralDelegate`].
pub trait HostPeripheral: Send + Sync + 'static {
  fn id(&self) -> PeripheralId;
  fn name(&self) -> Option<String>;
  fn state(&self) -> PeripheralState;
  fn services(&self) -> Option<Vec<Service>>;
  fn delegate_slot(&self) -> &DelegateSlot<dyn PeripheralDelegate>;
  fn read_rssi(&self);
  fn discover_services(&self, services: Option<&[Uuid]>);
  fn discover_included_services(&self, included: Option<&[Uuid]>, service: &Service);
  fn discover_characteristics(&self, characteristics: Option<&[Uuid]>, service: &Service);
  fn read_characteristic_value(&self, characteristic: &Characteristic);
  fn write_characteristic_value(&self, value: &[u8], characteristic: &Characteristic, write_type: WriteType);
  fn set_notify_value(&self, enabled: bool, characteristic: &Characteristic);
  fn is_notifying(&self, characteristic: &Characteristic) -> bool;
  fn discover_descriptors(&self, characteristic: &Characteristic);
  fn read_descriptor_value(&self, descriptor: &Descriptor);
  fn write_descriptor_value(&self, value: &[u8], descriptor: &Descriptor);
  fn open_l2cap_channel(&self, psm: u16);
  fn maximum_write_value_length(&self, write_type: WriteType) -> usize;
  fn can_send_write_without_response(&self) -> bool;
}

/// Callback surface of one remote device.
pub trait PeripheralDelegate: Send + Sync {
  fn did_read_rssi(&self, rssi: Result<i16, HostError>);
  fn did_discover_services(&self, services: Result<Vec<Service>, HostError>);
  fn did_discover_included_services(&self, service: Service, included: Result<Vec<Service>, HostError>);
  fn did_discover_characteristics(&self, service: Service, characteristics: Result<Vec<Characteristic>, HostError>);
  fn did_update_value_for_characteristic(&self, characteristic: Characteristic, error: Option<HostError>);
  fn did_write_value_for_characteristic(&self, characteristic: Characteristic, error: Option<HostError>);
  fn did_update_notification_state(&self, characteristic: Characteristic, error: Option<HostError>);
  fn did_discover_descriptors(&self, characteristic: Characteristic, descriptors: Result<Vec<Descriptor>, HostError>);
  fn did_update_value_for_descriptor(&self, descriptor: Descriptor, error: Option<HostError>);
  fn did_write_value_for_descriptor(&self, descriptor: Descriptor, error: Option<HostError>);
  fn is_ready_to_send_write_without_response(&self);
  fn did_open_channel(&self, channel: Option<L2capChannel>, error: Option<HostError>);
}

/// Byte transport behind an opened L2CAP channel.
pub trait L2capTransport: Send + Sync {
  fn write(&self, data: &[u8]) -> Result<usize, HostError>;
  fn read(&self, buf: &mut [u8]) -> Result<usize, HostError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Nothing;

  #[test]
  fn installing_a_new_delegate_replaces_the_owner() {
    let slot: DelegateSlot<Nothing> = DelegateSlot::new();
    let first = DelegateToken::next();
    let second = DelegateToken::next();
    let mut watcher = slot.subscribe();

    slot.install(first, Arc::new(Nothing));
    assert!(slot.is_owned_by(first));
    assert_eq!(*watcher.borrow_and_update(), Some(first));

    slot.install(second, Arc::new(Nothing));
    assert!(!slot.is_owned_by(first));
    assert_eq!(*watcher.borrow_and_update(), Some(second));
    assert_eq!(slot.installs(), 2);

    slot.clear();
    assert!(slot.delegate().is_none());
    assert_eq!(slot.owner(), None);
  }
}
