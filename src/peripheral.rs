use std::{fmt, future::Future, sync::Arc};

use futures::stream::{self, BoxStream, StreamExt};
use uuid::Uuid;

use crate::{
  bridge::{allow_listed, expand, request, CancelGuard},
  channel::EventChannel,
  correlation::{AttributeUpdate, Correlate, Discovery, Listener, Reply},
  host::{DelegateToken, HostPeripheralRef, PeripheralDelegate},
  models::{
    Characteristic, CharacteristicNotification, Descriptor, L2capChannel, PeripheralId,
    PeripheralState, Service, WriteType,
  },
  Entity, Error, HostError, Operation, Result,
};

/// The canonical handle of one remote device.
///
/// Clones share everything; the session hands out exactly one handle per identifier,
/// so two handles for the same device are always [`Peripheral::ptr_eq`].
#[derive(Clone)]
pub struct Peripheral {
  inner: Arc<PeripheralInner>,
}

struct PeripheralInner {
  id: PeripheralId,
  host: HostPeripheralRef,
  router: Arc<PeripheralRouter>,
  delegate_token: DelegateToken,
}

impl Peripheral {
  pub(crate) fn new(host: HostPeripheralRef, event_capacity: usize) -> Self {
    let id = host.id();
    let router = Arc::new(PeripheralRouter::new(event_capacity));
    let delegate_token = DelegateToken::next();
    host.delegate_slot().install(delegate_token, router.clone());
    log::info!("Installed peripheral delegate | peripheral={} | token={:?}", id, delegate_token);
    Self {
      inner: Arc::new(PeripheralInner {
        id,
        host,
        router,
        delegate_token,
      }),
    }
  }

  pub fn ptr_eq(a: &Peripheral, b: &Peripheral) -> bool {
    Arc::ptr_eq(&a.inner, &b.inner)
  }

  pub fn id(&self) -> PeripheralId {
    self.inner.id
  }

  pub fn name(&self) -> Option<String> {
    self.inner.host.name()
  }

  pub fn state(&self) -> PeripheralState {
    self.inner.host.state()
  }

  /// Services the host has discovered so far, if any discovery completed.
  pub fn services(&self) -> Option<Vec<Service>> {
    self.inner.host.services()
  }

  /// Whether this handle still receives the callbacks of its host peripheral.
  pub fn is_delegate(&self) -> bool {
    self.inner.host.delegate_slot().is_owned_by(self.inner.delegate_token)
  }

  pub fn maximum_write_value_length(&self, write_type: WriteType) -> usize {
    self.inner.host.maximum_write_value_length(write_type)
  }

  pub fn can_send_write_without_response(&self) -> bool {
    self.inner.host.can_send_write_without_response()
  }

  pub(crate) fn host(&self) -> &HostPeripheralRef {
    &self.inner.host
  }

  /// Fires each time the host can again queue writes without response.
  pub fn ready_for_write_without_response(&self) -> BoxStream<'static, ()> {
    self.inner.router.write_ready.stream()
  }

  pub fn read_rssi(&self) -> impl Future<Output = Result<i16>> + Send + 'static {
    let inner = self.inner.clone();
    async move {
      log::debug!("Reading RSSI | peripheral={}", inner.id);
      let Reply(reply) = request(&inner.router.rssi, (), || inner.host.read_rssi()).await?;
      reply.map_err(|cause| Error::operation(Operation::ReadRssi, Entity::Peripheral(inner.id), cause))
    }
  }

  /// Discovers the primary services, restricted to `services` when given.
  pub fn discover_services(&self, services: Option<Vec<Uuid>>) -> BoxStream<'static, Result<Service>> {
    let inner = self.inner.clone();
    expand(async move {
      log::debug!("Discovering services | peripheral={} | filter={:?}", inner.id, services);
      let Reply(reply) = request(&inner.router.services, (), || {
        inner.host.discover_services(services.as_deref())
      })
      .await?;
      let found = reply.map_err(|cause| {
        Error::operation(Operation::DiscoverServices, Entity::Peripheral(inner.id), cause)
      })?;
      Ok(allow_listed(found, services.as_deref(), |service| service.uuid))
    })
  }

  pub fn discover_included_services(
    &self,
    included: Option<Vec<Uuid>>,
    service: &Service,
  ) -> BoxStream<'static, Result<Service>> {
    let inner = self.inner.clone();
    let service = service.clone();
    expand(async move {
      inner.ensure_owned(service.peripheral, || Entity::Service(service.clone()))?;
      let discovery = request(&inner.router.included_services, service.correlation_key(), || {
        inner.host.discover_included_services(included.as_deref(), &service)
      })
      .await?;
      let found = discovery.result.map_err(|cause| {
        Error::operation(Operation::DiscoverIncludedServices, Entity::Service(service.clone()), cause)
      })?;
      Ok(allow_listed(found, included.as_deref(), |service| service.uuid))
    })
  }

  pub fn discover_characteristics(
    &self,
    characteristics: Option<Vec<Uuid>>,
    service: &Service,
  ) -> BoxStream<'static, Result<Characteristic>> {
    let inner = self.inner.clone();
    let service = service.clone();
    expand(async move {
      inner.ensure_owned(service.peripheral, || Entity::Service(service.clone()))?;
      log::debug!(
        "Discovering characteristics | peripheral={} | service={} | filter={:?}",
        inner.id,
        service.uuid,
        characteristics
      );
      let discovery = request(&inner.router.characteristics, service.correlation_key(), || {
        inner.host.discover_characteristics(characteristics.as_deref(), &service)
      })
      .await?;
      let found = discovery.result.map_err(|cause| {
        Error::operation(Operation::DiscoverCharacteristics, Entity::Service(service.clone()), cause)
      })?;
      Ok(allow_listed(found, characteristics.as_deref(), |characteristic| characteristic.uuid))
    })
  }

  /// Reads the value once; the returned characteristic carries it.
  pub fn read_characteristic(
    &self,
    characteristic: &Characteristic,
  ) -> impl Future<Output = Result<Characteristic>> + Send + 'static {
    let inner = self.inner.clone();
    let characteristic = characteristic.clone();
    async move {
      inner.ensure_owned(characteristic.peripheral, || Entity::Characteristic(characteristic.clone()))?;
      let update = request(&inner.router.characteristic_value, characteristic.correlation_key(), || {
        inner.host.read_characteristic_value(&characteristic)
      })
      .await?;
      settle(update, Operation::ReadCharacteristic, Entity::Characteristic)
    }
  }

  /// Writes `value`. A write without response completes once the command is queued,
  /// since the host acknowledges nothing for it.
  pub fn write_characteristic(
    &self,
    value: Vec<u8>,
    characteristic: &Characteristic,
    write_type: WriteType,
  ) -> impl Future<Output = Result<Characteristic>> + Send + 'static {
    let inner = self.inner.clone();
    let characteristic = characteristic.clone();
    async move {
      inner.ensure_owned(characteristic.peripheral, || Entity::Characteristic(characteristic.clone()))?;
      log::debug!(
        "Writing characteristic | peripheral={} | characteristic={} | len={} | type={:?}",
        inner.id,
        characteristic.uuid,
        value.len(),
        write_type
      );
      if write_type == WriteType::WithoutResponse {
        inner.host.write_characteristic_value(&value, &characteristic, write_type);
        return Ok(characteristic);
      }
      let update = request(&inner.router.characteristic_write, characteristic.correlation_key(), || {
        inner.host.write_characteristic_value(&value, &characteristic, write_type)
      })
      .await?;
      settle(update, Operation::WriteCharacteristic, Entity::Characteristic)
    }
  }

  /// Enables notifications and streams every value update until dropped.
  ///
  /// The first element is [`CharacteristicNotification::Enabled`], emitted as soon as
  /// the characteristic is known to notify; when it already does, no host callback is
  /// awaited. Values the host reports once notifications are requested are queued and
  /// follow `Enabled`. Dropping the stream disables notifications again.
  pub fn notify(&self, characteristic: &Characteristic) -> BoxStream<'static, Result<CharacteristicNotification>> {
    let inner = self.inner.clone();
    let characteristic = characteristic.clone();
    stream::unfold(NotifyPhase::Pending, move |phase| {
      advance_notify(inner.clone(), characteristic.clone(), phase)
    })
    .boxed()
  }

  pub fn discover_descriptors(&self, characteristic: &Characteristic) -> BoxStream<'static, Result<Descriptor>> {
    let inner = self.inner.clone();
    let characteristic = characteristic.clone();
    expand(async move {
      inner.ensure_owned(characteristic.peripheral, || Entity::Characteristic(characteristic.clone()))?;
      let discovery = request(&inner.router.descriptors, characteristic.correlation_key(), || {
        inner.host.discover_descriptors(&characteristic)
      })
      .await?;
      discovery.result.map_err(|cause| {
        Error::operation(
          Operation::DiscoverDescriptors,
          Entity::Characteristic(characteristic.clone()),
          cause,
        )
      })
    })
  }

  pub fn read_descriptor(&self, descriptor: &Descriptor) -> impl Future<Output = Result<Descriptor>> + Send + 'static {
    let inner = self.inner.clone();
    let descriptor = descriptor.clone();
    async move {
      inner.ensure_owned(descriptor.peripheral, || Entity::Descriptor(descriptor.clone()))?;
      let update = request(&inner.router.descriptor_value, descriptor.correlation_key(), || {
        inner.host.read_descriptor_value(&descriptor)
      })
      .await?;
      settle(update, Operation::ReadDescriptor, Entity::Descriptor)
    }
  }

  pub fn write_descriptor(
    &self,
    value: Vec<u8>,
    descriptor: &Descriptor,
  ) -> impl Future<Output = Result<Descriptor>> + Send + 'static {
    let inner = self.inner.clone();
    let descriptor = descriptor.clone();
    async move {
      inner.ensure_owned(descriptor.peripheral, || Entity::Descriptor(descriptor.clone()))?;
      let update = request(&inner.router.descriptor_write, descriptor.correlation_key(), || {
        inner.host.write_descriptor_value(&value, &descriptor)
      })
      .await?;
      settle(update, Operation::WriteDescriptor, Entity::Descriptor)
    }
  }

  pub fn open_l2cap_channel(&self, psm: u16) -> impl Future<Output = Result<L2capChannel>> + Send + 'static {
    let inner = self.inner.clone();
    async move {
      log::debug!("Opening L2CAP channel | peripheral={} | psm={}", inner.id, psm);
      let opened = request(&inner.router.channel_open, ChannelPsm(Some(psm)), || {
        inner.host.open_l2cap_channel(psm)
      })
      .await?;
      match (opened.channel, opened.error) {
        (_, Some(cause)) => Err(Error::operation(Operation::OpenChannel, Entity::Peripheral(inner.id), cause)),
        (Some(channel), None) => Ok(channel),
        (None, None) => Err(Error::ChannelOpenFailedWithNoChannelAndNoError {
          peripheral: inner.id,
          psm,
        }),
      }
    }
  }
}

impl PeripheralInner {
  fn ensure_owned(&self, owner: PeripheralId, entity: impl FnOnce() -> Entity) -> Result<()> {
    if owner == self.id {
      Ok(())
    } else {
      Err(Error::WrapperTypeMismatch {
        expected: self.id,
        entity: entity(),
      })
    }
  }
}

impl PartialEq for Peripheral {
  fn eq(&self, other: &Self) -> bool {
    Peripheral::ptr_eq(self, other)
  }
}

impl Eq for Peripheral {}

impl fmt::Debug for Peripheral {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Peripheral")
      .field("id", &self.inner.id)
      .field("delegate_token", &self.inner.delegate_token)
      .finish()
  }
}

fn settle<T>(update: AttributeUpdate<T>, operation: Operation, entity: fn(T) -> Entity) -> Result<T> {
  match update.error {
    None => Ok(update.target),
    Some(cause) => Err(Error::operation(operation, entity(update.target), cause)),
  }
}

enum NotifyPhase {
  Pending,
  Streaming {
    values: Listener<AttributeUpdate<Characteristic>>,
    guard: CancelGuard,
  },
  Finished,
}

async fn advance_notify(
  inner: Arc<PeripheralInner>,
  characteristic: Characteristic,
  phase: NotifyPhase,
) -> Option<(Result<CharacteristicNotification>, NotifyPhase)> {
  let key = characteristic.correlation_key();
  let (mut states, values, mut guard) = match phase {
    NotifyPhase::Finished => return None,
    NotifyPhase::Streaming { mut values, mut guard } => {
      return Some(match values.next().await {
        Ok(AttributeUpdate { target, error: None }) => (
          Ok(CharacteristicNotification::Value(target)),
          NotifyPhase::Streaming { values, guard },
        ),
        Ok(AttributeUpdate {
          target,
          error: Some(cause),
        }) => {
          guard.disarm();
          (
            Err(Error::operation(Operation::ReadCharacteristic, Entity::Characteristic(target), cause)),
            NotifyPhase::Finished,
          )
        }
        Err(err) => {
          guard.disarm();
          (Err(err), NotifyPhase::Finished)
        }
      });
    }
    NotifyPhase::Pending => {
      if let Err(err) = inner.ensure_owned(characteristic.peripheral, || Entity::Characteristic(characteristic.clone())) {
        return Some((Err(err), NotifyPhase::Finished));
      }
      log::debug!(
        "Enabling notifications | peripheral={} | characteristic={}",
        inner.id,
        characteristic.uuid
      );
      let states = inner.router.notification_state.listen(key);
      let values = inner.router.characteristic_value.listen(key);
      inner.host.set_notify_value(true, &characteristic);
      let host = inner.host.clone();
      let target = characteristic.clone();
      let guard = CancelGuard::new(move || {
        log::debug!("Disabling notifications | peripheral={} | characteristic={}", host.id(), target.uuid);
        host.set_notify_value(false, &target);
      });
      if inner.host.is_notifying(&characteristic) {
        return Some((
          Ok(CharacteristicNotification::Enabled(characteristic.with_notifying(true))),
          NotifyPhase::Streaming { values, guard },
        ));
      }
      (states, values, guard)
    }
  };

  loop {
    match states.next().await {
      Ok(AttributeUpdate { target, error: None }) if target.is_notifying => {
        return Some((
          Ok(CharacteristicNotification::Enabled(target)),
          NotifyPhase::Streaming { values, guard },
        ));
      }
      Ok(AttributeUpdate { error: None, .. }) => continue,
      Ok(AttributeUpdate {
        target,
        error: Some(cause),
      }) => {
        guard.disarm();
        return Some((
          Err(Error::operation(
            Operation::UpdateNotificationState,
            Entity::Characteristic(target),
            cause,
          )),
          NotifyPhase::Finished,
        ));
      }
      Err(err) => {
        guard.disarm();
        return Some((Err(err), NotifyPhase::Finished));
      }
    }
  }
}

/// Outcome of an L2CAP open request as the host reported it.
#[derive(Debug, Clone)]
struct ChannelOpened {
  channel: Option<L2capChannel>,
  error: Option<HostError>,
}

impl Correlate for ChannelOpened {
  type Key = ChannelPsm;

  fn correlation_key(&self) -> ChannelPsm {
    ChannelPsm(self.channel.as_ref().map(|channel| channel.psm))
  }
}

/// The PSM an open outcome reports on. An outcome without a channel names no PSM and
/// matches any pending open.
#[derive(Debug, Clone, Copy)]
struct ChannelPsm(Option<u16>);

impl PartialEq for ChannelPsm {
  fn eq(&self, other: &Self) -> bool {
    match (self.0, other.0) {
      (Some(mine), Some(theirs)) => mine == theirs,
      _ => true,
    }
  }
}

/// The delegate installed on the host peripheral. Every entrypoint only packages its
/// arguments and publishes them on the matching channel.
struct PeripheralRouter {
  rssi: EventChannel<Reply<i16>>,
  services: EventChannel<Reply<Vec<Service>>>,
  included_services: EventChannel<Discovery<Service, Service>>,
  characteristics: EventChannel<Discovery<Service, Characteristic>>,
  characteristic_value: EventChannel<AttributeUpdate<Characteristic>>,
  characteristic_write: EventChannel<AttributeUpdate<Characteristic>>,
  notification_state: EventChannel<AttributeUpdate<Characteristic>>,
  descriptors: EventChannel<Discovery<Characteristic, Descriptor>>,
  descriptor_value: EventChannel<AttributeUpdate<Descriptor>>,
  descriptor_write: EventChannel<AttributeUpdate<Descriptor>>,
  write_ready: EventChannel<()>,
  channel_open: EventChannel<ChannelOpened>,
}

impl PeripheralRouter {
  fn new(capacity: usize) -> Self {
    Self {
      rssi: EventChannel::new("rssi", capacity),
      services: EventChannel::new("services", capacity),
      included_services: EventChannel::new("included_services", capacity),
      characteristics: EventChannel::new("characteristics", capacity),
      characteristic_value: EventChannel::new("characteristic_value", capacity),
      characteristic_write: EventChannel::new("characteristic_write", capacity),
      notification_state: EventChannel::new("notification_state", capacity),
      descriptors: EventChannel::new("descriptors", capacity),
      descriptor_value: EventChannel::new("descriptor_value", capacity),
      descriptor_write: EventChannel::new("descriptor_write", capacity),
      write_ready: EventChannel::new("write_ready", capacity),
      channel_open: EventChannel::new("channel_open", capacity),
    }
  }
}

impl PeripheralDelegate for PeripheralRouter {
  fn did_read_rssi(&self, rssi: std::result::Result<i16, HostError>) {
    self.rssi.publish(Reply(rssi));
  }

  fn did_discover_services(&self, services: std::result::Result<Vec<Service>, HostError>) {
    self.services.publish(Reply(services));
  }

  fn did_discover_included_services(&self, service: Service, included: std::result::Result<Vec<Service>, HostError>) {
    self.included_services.publish(Discovery {
      parent: service,
      result: included,
    });
  }

  fn did_discover_characteristics(
    &self,
    service: Service,
    characteristics: std::result::Result<Vec<Characteristic>, HostError>,
  ) {
    self.characteristics.publish(Discovery {
      parent: service,
      result: characteristics,
    });
  }

  fn did_update_value_for_characteristic(&self, characteristic: Characteristic, error: Option<HostError>) {
    self.characteristic_value.publish(AttributeUpdate {
      target: characteristic,
      error,
    });
  }

  fn did_write_value_for_characteristic(&self, characteristic: Characteristic, error: Option<HostError>) {
    self.characteristic_write.publish(AttributeUpdate {
      target: characteristic,
      error,
    });
  }

  fn did_update_notification_state(&self, characteristic: Characteristic, error: Option<HostError>) {
    self.notification_state.publish(AttributeUpdate {
      target: characteristic,
      error,
    });
  }

  fn did_discover_descriptors(
    &self,
    characteristic: Characteristic,
    descriptors: std::result::Result<Vec<Descriptor>, HostError>,
  ) {
    self.descriptors.publish(Discovery {
      parent: characteristic,
      result: descriptors,
    });
  }

  fn did_update_value_for_descriptor(&self, descriptor: Descriptor, error: Option<HostError>) {
    self.descriptor_value.publish(AttributeUpdate {
      target: descriptor,
      error,
    });
  }

  fn did_write_value_for_descriptor(&self, descriptor: Descriptor, error: Option<HostError>) {
    self.descriptor_write.publish(AttributeUpdate {
      target: descriptor,
      error,
    });
  }

  fn is_ready_to_send_write_without_response(&self) {
    self.write_ready.publish(());
  }

  fn did_open_channel(&self, channel: Option<L2capChannel>, error: Option<HostError>) {
    self.channel_open.publish(ChannelOpened { channel, error });
  }
}
