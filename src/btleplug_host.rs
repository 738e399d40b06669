//! Host stack backed by a real adapter through btleplug.
//!
//! btleplug is async and answers each call directly, so every command spawns a task on
//! the runtime that created the host and reports the outcome through the installed
//! delegate, the same way a native callback stack would.

use std::{
  collections::HashMap,
  future::Future,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError, Weak,
  },
  time::Duration,
};

use btleplug::{
  api::{
    Central as _, CentralEvent, CentralState as BtleCentralState, CharPropFlags, Characteristic as BtleCharacteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, WriteType as BtleWriteType,
  },
  platform::{Adapter, Manager as BtleManager, Peripheral as BtlePeripheral, PeripheralId as BtlePeripheralId},
};
use futures::StreamExt;
use tokio::{runtime::Handle, task::JoinHandle};
use uuid::Uuid;

use crate::{
  host::{CentralDelegate, DelegateSlot, HostCentral, HostPeripheral, HostPeripheralRef, PeripheralDelegate},
  models::{
    AdvertisementData, CentralState, Characteristic, CharacteristicProperties, ConnectOptions, Descriptor,
    PeripheralId, PeripheralState, ScanOptions, Service, WriteType,
  },
  Error, HostError, Result,
};

const UNSUPPORTED: i64 = 4;
const NOT_FOUND: i64 = 2;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn host_error(err: btleplug::Error) -> HostError {
  let code = match &err {
    btleplug::Error::PermissionDenied => 1,
    btleplug::Error::DeviceNotFound => NOT_FOUND,
    btleplug::Error::NotConnected => 3,
    btleplug::Error::NotSupported(_) => UNSUPPORTED,
    btleplug::Error::TimedOut(_) => 5,
    _ => 0,
  };
  HostError::new(code, err.to_string())
}

/// btleplug identifiers are platform specific; they are folded into a stable UUID.
fn stable_id(id: &BtlePeripheralId) -> PeripheralId {
  PeripheralId(Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{id:?}").as_bytes()))
}

pub struct BtleplugCentral {
  me: Weak<Self>,
  adapter: Adapter,
  runtime: Handle,
  slot: DelegateSlot<dyn CentralDelegate>,
  state: Mutex<CentralState>,
  scanning: AtomicBool,
  peripherals: Mutex<HashMap<PeripheralId, Arc<BtleplugPeripheral>>>,
  connecting: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
}

impl BtleplugCentral {
  /// Uses the first adapter of the system.
  pub async fn new() -> Result<Arc<Self>> {
    let manager = BtleManager::new().await?;
    let adapter = manager.adapters().await?.into_iter().next().ok_or(Error::NoAdapter)?;
    Ok(Self::with_adapter(adapter))
  }

  /// Wraps `adapter`. Must be called from within a tokio runtime.
  pub fn with_adapter(adapter: Adapter) -> Arc<Self> {
    let runtime = Handle::current();
    let central = Arc::new_cyclic(|me| Self {
      me: me.clone(),
      adapter: adapter.clone(),
      runtime: runtime.clone(),
      slot: DelegateSlot::new(),
      state: Mutex::new(CentralState::Unknown),
      scanning: AtomicBool::new(false),
      peripherals: Mutex::new(HashMap::new()),
      connecting: Mutex::new(HashMap::new()),
    });
    runtime.spawn(query_state(Arc::downgrade(&central), adapter.clone()));
    runtime.spawn(pump_events(Arc::downgrade(&central), adapter));
    central
  }

  fn wrap(&self, peripheral: BtlePeripheral) -> Arc<BtleplugPeripheral> {
    let id = stable_id(&peripheral.id());
    locked(&self.peripherals)
      .entry(id)
      .or_insert_with(|| BtleplugPeripheral::new(id, peripheral, self.runtime.clone()))
      .clone()
  }

  fn known(&self, id: &PeripheralId) -> Option<Arc<BtleplugPeripheral>> {
    locked(&self.peripherals).get(id).cloned()
  }

  fn set_state(&self, state: CentralState) {
    let previous = std::mem::replace(&mut *locked(&self.state), state);
    if previous != state {
      log::info!("Adapter state changed | from={:?} | to={:?}", previous, state);
      self.slot.notify(|delegate| delegate.did_update_state(state));
    }
  }

  fn set_scanning(&self, is_scanning: bool) {
    if self.scanning.swap(is_scanning, Ordering::SeqCst) != is_scanning {
      self.slot.notify(|delegate| delegate.did_update_scanning(is_scanning));
    }
  }

  async fn handle_event(&self, event: CentralEvent) {
    match event {
      CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
        if !self.scanning.load(Ordering::SeqCst) {
          return;
        }
        let Ok(peripheral) = self.adapter.peripheral(&id).await else {
          return;
        };
        let properties = match peripheral.properties().await {
          Ok(Some(properties)) => properties,
          _ => return,
        };
        let host = self.wrap(peripheral);
        host.remember_name(properties.local_name.clone());
        let rssi = properties.rssi.unwrap_or_default();
        let advertisement = advertisement_from(&properties);
        let host: HostPeripheralRef = host;
        self.slot.notify(|delegate| delegate.did_discover(host, advertisement, rssi));
      }
      CentralEvent::StateUpdate(state) => self.set_state(central_state(state)),
      CentralEvent::DeviceDisconnected(id) => {
        if let Some(host) = self.known(&stable_id(&id)) {
          host.set_state(PeripheralState::Disconnected);
          host.clear_notifications();
          let host: HostPeripheralRef = host;
          self.slot.notify(|delegate| delegate.did_disconnect(host, None));
        }
      }
      _ => {}
    }
  }
}

fn central_state(state: BtleCentralState) -> CentralState {
  match state {
    BtleCentralState::PoweredOn => CentralState::PoweredOn,
    BtleCentralState::PoweredOff => CentralState::PoweredOff,
    _ => CentralState::Unknown,
  }
}

async fn query_state(central: Weak<BtleplugCentral>, adapter: Adapter) {
  let state = match adapter.adapter_state().await {
    Ok(state) => central_state(state),
    Err(err) => {
      log::warn!("Failed to query adapter state | error={}", err);
      return;
    }
  };
  if let Some(central) = central.upgrade() {
    central.set_state(state);
  }
}

async fn pump_events(central: Weak<BtleplugCentral>, adapter: Adapter) {
  let mut events = match adapter.events().await {
    Ok(stream) => stream,
    Err(err) => {
      log::error!("Failed to subscribe to Bluetooth adapter events: {err}");
      return;
    }
  };
  while let Some(event) = events.next().await {
    let Some(central) = central.upgrade() else {
      break;
    };
    central.handle_event(event).await;
  }
}

impl HostCentral for BtleplugCentral {
  fn state(&self) -> CentralState {
    *locked(&self.state)
  }

  fn is_scanning(&self) -> bool {
    self.scanning.load(Ordering::SeqCst)
  }

  fn delegate_slot(&self) -> &DelegateSlot<dyn CentralDelegate> {
    &self.slot
  }

  fn scan_for_peripherals(&self, services: Option<&[Uuid]>, _options: &ScanOptions) {
    let filter = ScanFilter {
      services: services.map(<[Uuid]>::to_vec).unwrap_or_default(),
    };
    self.set_scanning(true);
    let adapter = self.adapter.clone();
    let me = self.me.clone();
    self.runtime.spawn(async move {
      if let Err(err) = adapter.start_scan(filter).await {
        log::warn!("Failed to start scan | error={}", err);
        if let Some(central) = me.upgrade() {
          central.set_scanning(false);
        }
      }
    });
  }

  fn stop_scan(&self) {
    self.set_scanning(false);
    let adapter = self.adapter.clone();
    self.runtime.spawn(async move {
      adapter.stop_scan().await.ok();
    });
  }

  fn connect(&self, peripheral: &HostPeripheralRef, options: &ConnectOptions) {
    let id = peripheral.id();
    let Some(target) = self.known(&id) else {
      let host = peripheral.clone();
      self.slot.notify(|delegate| {
        delegate.did_fail_to_connect(host, Some(HostError::new(NOT_FOUND, "peripheral is unknown to the adapter")))
      });
      return;
    };
    let delay = options.start_delay_secs.map(|secs| Duration::from_secs(secs.into()));
    let me = self.me.clone();
    target.set_state(PeripheralState::Connecting);
    let task = self.runtime.spawn(async move {
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      let outcome = target.inner.connect().await;
      let Some(central) = me.upgrade() else {
        return;
      };
      locked(&central.connecting).remove(&target.id);
      let host: HostPeripheralRef = target.clone();
      match outcome {
        Ok(()) => {
          target.set_state(PeripheralState::Connected);
          central.slot.notify(|delegate| delegate.did_connect(host));
        }
        Err(err) => {
          target.set_state(PeripheralState::Disconnected);
          central.slot.notify(|delegate| delegate.did_fail_to_connect(host, Some(host_error(err))));
        }
      }
    });
    if let Some(previous) = locked(&self.connecting).insert(id, task) {
      previous.abort();
    }
  }

  fn cancel_peripheral_connection(&self, peripheral: &HostPeripheralRef) {
    let id = peripheral.id();
    if let Some(pending) = locked(&self.connecting).remove(&id) {
      pending.abort();
    }
    if let Some(target) = self.known(&id) {
      target.set_state(PeripheralState::Disconnecting);
      self.runtime.spawn(async move {
        target.inner.disconnect().await.ok();
      });
    }
  }

  fn retrieve_peripherals(&self, identifiers: &[PeripheralId]) -> Vec<HostPeripheralRef> {
    identifiers
      .iter()
      .filter_map(|id| self.known(id))
      .map(|peripheral| peripheral as HostPeripheralRef)
      .collect()
  }

  fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<HostPeripheralRef> {
    locked(&self.peripherals)
      .values()
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

pub struct BtleplugPeripheral {
  me: Weak<Self>,
  id: PeripheralId,
  inner: BtlePeripheral,
  runtime: Handle,
  slot: DelegateSlot<dyn PeripheralDelegate>,
  name: Mutex<Option<String>>,
  state: Mutex<PeripheralState>,
  services: Mutex<Option<Vec<Service>>>,
  subscriptions: Mutex<Subscriptions>,
}

impl BtleplugPeripheral {
  fn new(id: PeripheralId, inner: BtlePeripheral, runtime: Handle) -> Arc<Self> {
    Arc::new_cyclic(|me| Self {
      me: me.clone(),
      id,
      inner,
      runtime,
      slot: DelegateSlot::new(),
      name: Mutex::new(None),
      state: Mutex::new(PeripheralState::Disconnected),
      services: Mutex::new(None),
      subscriptions: Mutex::new(Subscriptions::default()),
    })
  }

  fn remember_name(&self, name: Option<String>) {
    if name.is_some() {
      *locked(&self.name) = name;
    }
  }

  fn set_state(&self, state: PeripheralState) {
    *locked(&self.state) = state;
  }

  /// Runs `task` on the runtime with a strong handle to this peripheral.
  fn spawn<F, Fut>(&self, task: F)
  where
    F: FnOnce(Arc<Self>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
  {
    if let Some(this) = self.me.upgrade() {
      self.runtime.spawn(task(this));
    }
  }

  fn find_characteristic(&self, characteristic: &Characteristic) -> std::result::Result<BtleCharacteristic, HostError> {
    self
      .inner
      .characteristics()
      .into_iter()
      .find(|candidate| candidate.uuid == characteristic.uuid && candidate.service_uuid == characteristic.service)
      .ok_or_else(|| HostError::new(NOT_FOUND, format!("characteristic {} not discovered", characteristic.uuid)))
  }

  fn find_descriptor(&self, descriptor: &Descriptor) -> std::result::Result<btleplug::api::Descriptor, HostError> {
    self
      .inner
      .characteristics()
      .into_iter()
      .filter(|candidate| candidate.uuid == descriptor.characteristic && candidate.service_uuid == descriptor.service)
      .flat_map(|candidate| candidate.descriptors.into_iter())
      .find(|candidate| candidate.uuid == descriptor.uuid)
      .ok_or_else(|| HostError::new(NOT_FOUND, format!("descriptor {} not discovered", descriptor.uuid)))
  }

  fn service_model(&self, service: &btleplug::api::Service) -> Service {
    Service {
      uuid: service.uuid,
      peripheral: self.id,
      is_primary: service.primary,
    }
  }

  fn characteristic_model(&self, characteristic: &BtleCharacteristic) -> Characteristic {
    let flags = characteristic.properties;
    Characteristic {
      uuid: characteristic.uuid,
      service: characteristic.service_uuid,
      peripheral: self.id,
      properties: CharacteristicProperties {
        broadcast: flags.contains(CharPropFlags::BROADCAST),
        read: flags.contains(CharPropFlags::READ),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        write: flags.contains(CharPropFlags::WRITE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
        authenticated_signed_writes: flags.contains(CharPropFlags::AUTHENTICATED_SIGNED_WRITES),
        reliable_write: false,
        writable_auxiliaries: false,
      },
      value: None,
      is_notifying: self.is_notifying_key(characteristic.service_uuid, characteristic.uuid),
    }
  }

  /// Drops every subscription of this peripheral; the link that carried them is gone.
  fn clear_notifications(&self) {
    let cleared = locked(&self.subscriptions).clear();
    log::debug!("Cleared notifications | peripheral={} | count={}", self.id, cleared);
  }

  fn is_notifying_key(&self, service: Uuid, characteristic: Uuid) -> bool {
    locked(&self.subscriptions).contains(&(service, characteristic))
  }

  async fn enable_notifications(self: Arc<Self>, characteristic: Characteristic) {
    let key = (characteristic.service, characteristic.uuid);
    let outcome = match self.find_characteristic(&characteristic) {
      Ok(target) => self.inner.subscribe(&target).await.map_err(host_error),
      Err(err) => Err(err),
    };
    if let Err(err) = outcome {
      self.slot.notify(|delegate| delegate.did_update_notification_state(characteristic, Some(err)));
      return;
    }
    let mut notifications = match self.inner.notifications().await {
      Ok(stream) => stream,
      Err(err) => {
        self
          .slot
          .notify(|delegate| delegate.did_update_notification_state(characteristic, Some(host_error(err))));
        return;
      }
    };
    let this = self.clone();
    let template = characteristic.clone();
    let pump = self.runtime.spawn(async move {
      while let Some(notification) = notifications.next().await {
        if notification.uuid != template.uuid {
          continue;
        }
        let update = template.clone().with_notifying(true).with_value(notification.value);
        this.slot.notify(|delegate| delegate.did_update_value_for_characteristic(update, None));
      }
    });
    locked(&self.subscriptions).insert(key, pump);
    self
      .slot
      .notify(|delegate| delegate.did_update_notification_state(characteristic.with_notifying(true), None));
  }

  async fn disable_notifications(self: Arc<Self>, characteristic: Characteristic) {
    let key = (characteristic.service, characteristic.uuid);
    locked(&self.subscriptions).remove(&key);
    let error = match self.find_characteristic(&characteristic) {
      Ok(target) => self.inner.unsubscribe(&target).await.map_err(host_error).err(),
      Err(err) => Some(err),
    };
    self
      .slot
      .notify(|delegate| delegate.did_update_notification_state(characteristic.with_notifying(false), error));
  }
}

impl HostPeripheral for BtleplugPeripheral {
  fn id(&self) -> PeripheralId {
    self.id
  }

  fn name(&self) -> Option<String> {
    locked(&self.name).clone()
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
    self.spawn(|this| async move {
      let rssi = match this.inner.properties().await {
        Ok(Some(properties)) => properties
          .rssi
          .ok_or_else(|| HostError::new(NOT_FOUND, "no RSSI reported")),
        Ok(None) => Err(HostError::new(NOT_FOUND, "no properties reported")),
        Err(err) => Err(host_error(err)),
      };
      this.slot.notify(|delegate| delegate.did_read_rssi(rssi));
    });
  }

  fn discover_services(&self, _services: Option<&[Uuid]>) {
    self.spawn(|this| async move {
      let outcome = match this.inner.discover_services().await {
        Ok(()) => {
          let services: Vec<Service> = this.inner.services().iter().map(|service| this.service_model(service)).collect();
          *locked(&this.services) = Some(services.clone());
          Ok(services)
        }
        Err(err) => Err(host_error(err)),
      };
      this.slot.notify(|delegate| delegate.did_discover_services(outcome));
    });
  }

  fn discover_included_services(&self, _included: Option<&[Uuid]>, service: &Service) {
    let service = service.clone();
    self.slot.notify(|delegate| {
      delegate.did_discover_included_services(
        service,
        Err(HostError::new(UNSUPPORTED, "included services are not supported by btleplug")),
      )
    });
  }

  fn discover_characteristics(&self, _characteristics: Option<&[Uuid]>, service: &Service) {
    let service = service.clone();
    self.spawn(|this| async move {
      let found = this
        .inner
        .services()
        .into_iter()
        .find(|candidate| candidate.uuid == service.uuid)
        .map(|found| {
          found
            .characteristics
            .iter()
            .map(|characteristic| this.characteristic_model(characteristic))
            .collect::<Vec<_>>()
        })
        .ok_or_else(|| HostError::new(NOT_FOUND, format!("service {} not discovered", service.uuid)));
      this.slot.notify(|delegate| delegate.did_discover_characteristics(service, found));
    });
  }

  fn read_characteristic_value(&self, characteristic: &Characteristic) {
    let characteristic = characteristic.clone();
    self.spawn(|this| async move {
      let outcome = match this.find_characteristic(&characteristic) {
        Ok(target) => this.inner.read(&target).await.map_err(host_error),
        Err(err) => Err(err),
      };
      let (update, error) = match outcome {
        Ok(bytes) => (characteristic.with_value(bytes), None),
        Err(err) => (characteristic, Some(err)),
      };
      this.slot.notify(|delegate| delegate.did_update_value_for_characteristic(update, error));
    });
  }

  fn write_characteristic_value(&self, value: &[u8], characteristic: &Characteristic, write_type: WriteType) {
    let characteristic = characteristic.clone();
    let value = value.to_vec();
    self.spawn(|this| async move {
      let btle_write_type = match write_type {
        WriteType::WithResponse => BtleWriteType::WithResponse,
        WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
      };
      let error = match this.find_characteristic(&characteristic) {
        Ok(target) => this.inner.write(&target, &value, btle_write_type).await.map_err(host_error).err(),
        Err(err) => Some(err),
      };
      match write_type {
        WriteType::WithResponse => {
          this
            .slot
            .notify(|delegate| delegate.did_write_value_for_characteristic(characteristic, error));
        }
        WriteType::WithoutResponse => {
          if let Some(err) = error {
            log::warn!("Write without response failed | peripheral={} | error={}", this.id, err);
          }
          this.slot.notify(|delegate| delegate.is_ready_to_send_write_without_response());
        }
      }
    });
  }

  fn set_notify_value(&self, enabled: bool, characteristic: &Characteristic) {
    let characteristic = characteristic.clone();
    if enabled {
      self.spawn(|this| this.enable_notifications(characteristic));
    } else {
      self.spawn(|this| this.disable_notifications(characteristic));
    }
  }

  fn is_notifying(&self, characteristic: &Characteristic) -> bool {
    self.is_notifying_key(characteristic.service, characteristic.uuid)
  }

  fn discover_descriptors(&self, characteristic: &Characteristic) {
    let characteristic = characteristic.clone();
    let outcome = self.find_characteristic(&characteristic).map(|target| {
      target
        .descriptors
        .iter()
        .map(|descriptor| Descriptor::new(&characteristic, descriptor.uuid))
        .collect::<Vec<_>>()
    });
    self.spawn(|this| async move {
      this.slot.notify(|delegate| delegate.did_discover_descriptors(characteristic, outcome));
    });
  }

  fn read_descriptor_value(&self, descriptor: &Descriptor) {
    let descriptor = descriptor.clone();
    self.spawn(|this| async move {
      let outcome = match this.find_descriptor(&descriptor) {
        Ok(target) => this.inner.read_descriptor(&target).await.map_err(host_error),
        Err(err) => Err(err),
      };
      let (update, error) = match outcome {
        Ok(bytes) => (descriptor.with_value(bytes), None),
        Err(err) => (descriptor, Some(err)),
      };
      this.slot.notify(|delegate| delegate.did_update_value_for_descriptor(update, error));
    });
  }

  fn write_descriptor_value(&self, value: &[u8], descriptor: &Descriptor) {
    let descriptor = descriptor.clone();
    let value = value.to_vec();
    self.spawn(|this| async move {
      let error = match this.find_descriptor(&descriptor) {
        Ok(target) => this.inner.write_descriptor(&target, &value).await.map_err(host_error).err(),
        Err(err) => Some(err),
      };
      this.slot.notify(|delegate| delegate.did_write_value_for_descriptor(descriptor, error));
    });
  }

  fn open_l2cap_channel(&self, psm: u16) {
    log::debug!("L2CAP requested on btleplug host | peripheral={} | psm={}", self.id, psm);
    self.spawn(|this| async move {
      this.slot.notify(|delegate| {
        delegate.did_open_channel(None, Some(HostError::new(UNSUPPORTED, "L2CAP channels are not supported by btleplug")))
      });
    });
  }

  fn maximum_write_value_length(&self, write_type: WriteType) -> usize {
    match write_type {
      WriteType::WithResponse => 512,
      WriteType::WithoutResponse => 20,
    }
  }

  fn can_send_write_without_response(&self) -> bool {
    true
  }
}

type SubscriptionKey = (Uuid, Uuid);

/// Notification pumps keyed by (service, characteristic). A key is notifying exactly
/// while its pump is tracked.
#[derive(Default)]
struct Subscriptions {
  pumps: HashMap<SubscriptionKey, JoinHandle<()>>,
}

impl Subscriptions {
  fn insert(&mut self, key: SubscriptionKey, pump: JoinHandle<()>) {
    if let Some(previous) = self.pumps.insert(key, pump) {
      previous.abort();
    }
  }

  fn remove(&mut self, key: &SubscriptionKey) {
    if let Some(pump) = self.pumps.remove(key) {
      pump.abort();
    }
  }

  fn contains(&self, key: &SubscriptionKey) -> bool {
    self.pumps.contains_key(key)
  }

  /// Aborts every pump and returns how many were running.
  fn clear(&mut self) -> usize {
    let count = self.pumps.len();
    for (_, pump) in self.pumps.drain() {
      pump.abort();
    }
    count
  }
}

/// Folds btleplug properties into one advertisement. Manufacturer data is laid out as
/// the little-endian company identifier followed by the payload.
fn advertisement_from(properties: &PeripheralProperties) -> AdvertisementData {
  let manufacturer_data = properties.manufacturer_data.iter().next().map(|(company, payload)| {
    let mut bytes = company.to_le_bytes().to_vec();
    bytes.extend_from_slice(payload);
    bytes
  });
  AdvertisementData {
    local_name: properties.local_name.clone(),
    manufacturer_data,
    service_data: properties.service_data.clone(),
    services: properties.services.clone(),
    overflow_services: Vec::new(),
    solicited_services: Vec::new(),
    tx_power_level: properties.tx_power_level,
    is_connectable: None,
  }
}
