//! An in-memory host stack.
//!
//! The fakes record every command they receive and never call back on their own,
//! except for the scanning flag. Tests drive the callbacks explicitly through
//! [`FakeCentral::fire`] and [`FakePeripheral::fire`] or the convenience methods.

use std::{
  collections::{HashSet, VecDeque},
  sync::{Arc, Mutex, PoisonError},
};

use uuid::Uuid;

use crate::{
  host::{
    CentralDelegate, DelegateSlot, DelegateToken, HostCentral, HostPeripheral, HostPeripheralRef,
    HostRestoredState, L2capTransport, PeripheralDelegate,
  },
  models::{
    AdvertisementData, CentralState, Characteristic, ConnectOptions, Descriptor, L2capChannel, PeripheralId,
    PeripheralState, ScanOptions, Service, WriteType,
  },
  HostError,
};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CentralCommand {
  ScanForPeripherals {
    services: Option<Vec<Uuid>>,
    options: ScanOptions,
  },
  StopScan,
  Connect {
    peripheral: PeripheralId,
    options: ConnectOptions,
  },
  CancelConnection(PeripheralId),
}

pub struct FakeCentral {
  slot: DelegateSlot<dyn CentralDelegate>,
  state: Mutex<CentralState>,
  scanning: Mutex<bool>,
  peripherals: Mutex<Vec<Arc<FakePeripheral>>>,
  commands: Mutex<Vec<CentralCommand>>,
}

impl FakeCentral {
  pub fn new(state: CentralState) -> Arc<Self> {
    Arc::new(Self {
      slot: DelegateSlot::new(),
      state: Mutex::new(state),
      scanning: Mutex::new(false),
      peripherals: Mutex::new(Vec::new()),
      commands: Mutex::new(Vec::new()),
    })
  }

  /// Makes `peripheral` known to the retrieval commands.
  pub fn add_peripheral(&self, peripheral: Arc<FakePeripheral>) {
    locked(&self.peripherals).push(peripheral);
  }

  pub fn commands(&self) -> Vec<CentralCommand> {
    locked(&self.commands).clone()
  }

  pub fn count(&self, matches: impl Fn(&CentralCommand) -> bool) -> usize {
    locked(&self.commands).iter().filter(|command| matches(command)).count()
  }

  pub fn fire(&self, callback: impl FnOnce(&dyn CentralDelegate)) {
    self.slot.notify(|delegate| callback(delegate));
  }

  pub fn set_state(&self, state: CentralState) {
    *locked(&self.state) = state;
    self.fire(|delegate| delegate.did_update_state(state));
  }

  pub fn advertise(&self, peripheral: &Arc<FakePeripheral>, advertisement: AdvertisementData, rssi: i16) {
    let host: HostPeripheralRef = peripheral.clone();
    self.fire(|delegate| delegate.did_discover(host, advertisement, rssi));
  }

  pub fn complete_connection(&self, peripheral: &Arc<FakePeripheral>) {
    peripheral.set_state(PeripheralState::Connected);
    let host: HostPeripheralRef = peripheral.clone();
    self.fire(|delegate| delegate.did_connect(host));
  }

  pub fn fail_connection(&self, peripheral: &Arc<FakePeripheral>, error: Option<HostError>) {
    peripheral.set_state(PeripheralState::Disconnected);
    let host: HostPeripheralRef = peripheral.clone();
    self.fire(|delegate| delegate.did_fail_to_connect(host, error));
  }

  pub fn drop_connection(&self, peripheral: &Arc<FakePeripheral>, error: Option<HostError>) {
    peripheral.set_state(PeripheralState::Disconnected);
    let host: HostPeripheralRef = peripheral.clone();
    self.fire(|delegate| delegate.did_disconnect(host, error));
  }

  pub fn restore(&self, peripherals: &[Arc<FakePeripheral>], scan_services: Option<Vec<Uuid>>) {
    let restored = HostRestoredState {
      peripherals: peripherals.iter().map(|peripheral| peripheral.clone() as HostPeripheralRef).collect(),
      scan_services,
      scan_options: None,
    };
    self.fire(|delegate| delegate.will_restore_state(restored));
  }

  /// Installs an unrelated delegate, as another component taking over the central would.
  pub fn steal_delegate(&self) -> DelegateToken {
    let token = DelegateToken::next();
    self.slot.install(token, Arc::new(Bystander));
    token
  }

  fn record(&self, command: CentralCommand) {
    log::trace!("Fake central command | command={:?}", command);
    locked(&self.commands).push(command);
  }

  fn set_scanning(&self, is_scanning: bool) {
    *locked(&self.scanning) = is_scanning;
    self.fire(|delegate| delegate.did_update_scanning(is_scanning));
  }
}

impl HostCentral for FakeCentral {
  fn state(&self) -> CentralState {
    *locked(&self.state)
  }

  fn is_scanning(&self) -> bool {
    *locked(&self.scanning)
  }

  fn delegate_slot(&self) -> &DelegateSlot<dyn CentralDelegate> {
    &self.slot
  }

  fn scan_for_peripherals(&self, services: Option<&[Uuid]>, options: &ScanOptions) {
    self.record(CentralCommand::ScanForPeripherals {
      services: services.map(<[Uuid]>::to_vec),
      options: options.clone(),
    });
    self.set_scanning(true);
  }

  fn stop_scan(&self) {
    self.record(CentralCommand::StopScan);
    self.set_scanning(false);
  }

  fn connect(&self, peripheral: &HostPeripheralRef, options: &ConnectOptions) {
    self.record(CentralCommand::Connect {
      peripheral: peripheral.id(),
      options: options.clone(),
    });
  }

  fn cancel_peripheral_connection(&self, peripheral: &HostPeripheralRef) {
    self.record(CentralCommand::CancelConnection(peripheral.id()));
  }

  fn retrieve_peripherals(&self, identifiers: &[PeripheralId]) -> Vec<HostPeripheralRef> {
    locked(&self.peripherals)
      .iter()
      .filter(|peripheral| identifiers.contains(&peripheral.id()))
      .map(|peripheral| peripheral.clone() as HostPeripheralRef)
      .collect()
  }

  fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<HostPeripheralRef> {
    locked(&self.peripherals)
      .iter()
      .filter(|peripheral| peripheral.state() == PeripheralState::Connected)
      .filter(|peripheral| {
        peripheral
          .services()
          .unwrap_or_default()
          .iter()
          .any(|service| services.contains(&service.uuid))
      })
      .map(|peripheral| peripheral.clone() as HostPeripheralRef)
      .collect()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralCommand {
  ReadRssi,
  DiscoverServices(Option<Vec<Uuid>>),
  DiscoverIncludedServices {
    service: Uuid,
    included: Option<Vec<Uuid>>,
  },
  DiscoverCharacteristics {
    service: Uuid,
    characteristics: Option<Vec<Uuid>>,
  },
  ReadCharacteristic(Characteristic),
  WriteCharacteristic {
    characteristic: Characteristic,
    value: Vec<u8>,
    write_type: WriteType,
  },
  SetNotify {
    characteristic: Characteristic,
    enabled: bool,
  },
  DiscoverDescriptors(Characteristic),
  ReadDescriptor(Descriptor),
  WriteDescriptor {
    descriptor: Descriptor,
    value: Vec<u8>,
  },
  OpenL2capChannel(u16),
}

pub struct FakePeripheral {
  id: PeripheralId,
  name: Option<String>,
  state: Mutex<PeripheralState>,
  services: Mutex<Option<Vec<Service>>>,
  notifying: Mutex<HashSet<(Uuid, Uuid)>>,
  slot: DelegateSlot<dyn PeripheralDelegate>,
  commands: Mutex<Vec<PeripheralCommand>>,
}

impl FakePeripheral {
  pub fn new(name: &str) -> Arc<Self> {
    Self::with_id(PeripheralId::new_random(), name)
  }

  pub fn with_id(id: PeripheralId, name: &str) -> Arc<Self> {
    Arc::new(Self {
      id,
      name: Some(name.to_string()),
      state: Mutex::new(PeripheralState::Disconnected),
      services: Mutex::new(None),
      notifying: Mutex::new(HashSet::new()),
      slot: DelegateSlot::new(),
      commands: Mutex::new(Vec::new()),
    })
  }

  pub fn set_state(&self, state: PeripheralState) {
    *locked(&self.state) = state;
  }

  pub fn set_services(&self, services: Vec<Service>) {
    *locked(&self.services) = Some(services);
  }

  /// Marks `characteristic` as notifying without any callback.
  pub fn set_notifying(&self, characteristic: &Characteristic, notifying: bool) {
    let key = (characteristic.service, characteristic.uuid);
    let mut set = locked(&self.notifying);
    if notifying {
      set.insert(key);
    } else {
      set.remove(&key);
    }
  }

  pub fn delegate_installs(&self) -> usize {
    self.slot.installs()
  }

  pub fn commands(&self) -> Vec<PeripheralCommand> {
    locked(&self.commands).clone()
  }

  pub fn count(&self, matches: impl Fn(&PeripheralCommand) -> bool) -> usize {
    locked(&self.commands).iter().filter(|command| matches(command)).count()
  }

  pub fn fire(&self, callback: impl FnOnce(&dyn PeripheralDelegate)) {
    self.slot.notify(|delegate| callback(delegate));
  }

  pub fn steal_delegate(&self) -> DelegateToken {
    let token = DelegateToken::next();
    self.slot.install(token, Arc::new(Bystander));
    token
  }

  fn record(&self, command: PeripheralCommand) {
    log::trace!("Fake peripheral command | peripheral={} | command={:?}", self.id, command);
    locked(&self.commands).push(command);
  }
}

impl HostPeripheral for FakePeripheral {
  fn id(&self) -> PeripheralId {
    self.id
  }

  fn name(&self) -> Option<String> {
    self.name.clone()
  }

  fn state(&self) -> PeripheralState {
    *locked(&self.state)
  }

  fn services(&self) -> Option<Vec<Service>> {
    locked(&self.services).clone()
  }

  fn delegate_slot(&self) -> &DelegateSlot<dyn PeripheralDelegate> {
    &self.slot
  }

  fn read_rssi(&self) {
    self.record(PeripheralCommand::ReadRssi);
  }

  fn discover_services(&self, services: Option<&[Uuid]>) {
    self.record(PeripheralCommand::DiscoverServices(services.map(<[Uuid]>::to_vec)));
  }

  fn discover_included_services(&self, included: Option<&[Uuid]>, service: &Service) {
    self.record(PeripheralCommand::DiscoverIncludedServices {
      service: service.uuid,
      included: included.map(<[Uuid]>::to_vec),
    });
  }

  fn discover_characteristics(&self, characteristics: Option<&[Uuid]>, service: &Service) {
    self.record(PeripheralCommand::DiscoverCharacteristics {
      service: service.uuid,
      characteristics: characteristics.map(<[Uuid]>::to_vec),
    });
  }

  fn read_characteristic_value(&self, characteristic: &Characteristic) {
    self.record(PeripheralCommand::ReadCharacteristic(characteristic.clone()));
  }

  fn write_characteristic_value(&self, value: &[u8], characteristic: &Characteristic, write_type: WriteType) {
    self.record(PeripheralCommand::WriteCharacteristic {
      characteristic: characteristic.clone(),
      value: value.to_vec(),
      write_type,
    });
  }

  fn set_notify_value(&self, enabled: bool, characteristic: &Characteristic) {
    self.record(PeripheralCommand::SetNotify {
      characteristic: characteristic.clone(),
      enabled,
    });
  }

  fn is_notifying(&self, characteristic: &Characteristic) -> bool {
    locked(&self.notifying).contains(&(characteristic.service, characteristic.uuid))
  }

  fn discover_descriptors(&self, characteristic: &Characteristic) {
    self.record(PeripheralCommand::DiscoverDescriptors(characteristic.clone()));
  }

  fn read_descriptor_value(&self, descriptor: &Descriptor) {
    self.record(PeripheralCommand::ReadDescriptor(descriptor.clone()));
  }

  fn write_descriptor_value(&self, value: &[u8], descriptor: &Descriptor) {
    self.record(PeripheralCommand::WriteDescriptor {
      descriptor: descriptor.clone(),
      value: value.to_vec(),
    });
  }

  fn open_l2cap_channel(&self, psm: u16) {
    self.record(PeripheralCommand::OpenL2capChannel(psm));
  }

  fn maximum_write_value_length(&self, write_type: WriteType) -> usize {
    match write_type {
      WriteType::WithResponse => 512,
      WriteType::WithoutResponse => 182,
    }
  }

  fn can_send_write_without_response(&self) -> bool {
    true
  }
}

/// L2CAP transport that hands written bytes back to the reader.
#[derive(Default)]
pub struct LoopbackTransport {
  buffer: Mutex<VecDeque<u8>>,
}

impl LoopbackTransport {
  pub fn channel(peripheral: PeripheralId, psm: u16) -> L2capChannel {
    L2capChannel {
      peripheral,
      psm,
      transport: Arc::new(Self::default()),
    }
  }
}

impl L2capTransport for LoopbackTransport {
  fn write(&self, data: &[u8]) -> Result<usize, HostError> {
    locked(&self.buffer).extend(data);
    Ok(data.len())
  }

  fn read(&self, buf: &mut [u8]) -> Result<usize, HostError> {
    let mut buffer = locked(&self.buffer);
    let len = buf.len().min(buffer.len());
    for (slot, byte) in buf.iter_mut().zip(buffer.drain(..len)) {
      *slot = byte;
    }
    Ok(len)
  }
}

/// A delegate belonging to somebody else.
struct Bystander;

impl CentralDelegate for Bystander {
  fn did_update_state(&self, _state: CentralState) {}
  fn did_update_scanning(&self, _is_scanning: bool) {}
  fn will_restore_state(&self, _restored: HostRestoredState) {}
  fn did_discover(&self, _peripheral: HostPeripheralRef, _advertisement: AdvertisementData, _rssi: i16) {}
  fn did_connect(&self, _peripheral: HostPeripheralRef) {}
  fn did_fail_to_connect(&self, _peripheral: HostPeripheralRef, _error: Option<HostError>) {}
  fn did_disconnect(&self, _peripheral: HostPeripheralRef, _error: Option<HostError>) {}
}

impl PeripheralDelegate for Bystander {
  fn did_read_rssi(&self, _rssi: Result<i16, HostError>) {}
  fn did_discover_services(&self, _services: Result<Vec<Service>, HostError>) {}
  fn did_discover_included_services(&self, _service: Service, _included: Result<Vec<Service>, HostError>) {}
  fn did_discover_characteristics(&self, _service: Service, _characteristics: Result<Vec<Characteristic>, HostError>) {}
  fn did_update_value_for_characteristic(&self, _characteristic: Characteristic, _error: Option<HostError>) {}
  fn did_write_value_for_characteristic(&self, _characteristic: Characteristic, _error: Option<HostError>) {}
  fn did_update_notification_state(&self, _characteristic: Characteristic, _error: Option<HostError>) {}
  fn did_discover_descriptors(&self, _characteristic: Characteristic, _descriptors: Result<Vec<Descriptor>, HostError>) {}
  fn did_update_value_for_descriptor(&self, _descriptor: Descriptor, _error: Option<HostError>) {}
  fn did_write_value_for_descriptor(&self, _descriptor: Descriptor, _error: Option<HostError>) {}
  fn is_ready_to_send_write_without_response(&self) {}
  fn did_open_channel(&self, _channel: Option<L2capChannel>, _error: Option<HostError>) {}
}
