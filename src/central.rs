use std::{fmt, future::Future, sync::Arc};

use futures::{
  future,
  stream::{self, BoxStream, StreamExt},
};
use uuid::Uuid;

use crate::{
  bridge::{ownership_revoked, with_guard, CancelGuard, Supervised},
  cache::PeripheralCache,
  channel::{lossy, EventChannel, ReplayChannel, ScanChannel},
  config::SessionConfig,
  correlation::{Connectivity, Listener},
  host::{CentralDelegate, DelegateToken, HostCentral, HostPeripheralRef, HostRestoredState},
  models::{
    AdvertisementData, AdvertisingPeripheral, CentralState, ConnectOptions, PeripheralConnectionEvent,
    PeripheralId, RestoredState, ScanOptions, StateRestorationEvent,
  },
  peripheral::Peripheral,
  Entity, Error, HostError, Result,
};

/// The local adapter seen as streams.
///
/// A session owns the delegate slot of its [`HostCentral`]. Every state, scan,
/// restoration and connectivity stream it hands out ends with
/// [`Error::DelegateOwnershipLost`] once something else takes that slot.
#[derive(Clone)]
pub struct CentralSession {
  inner: Arc<SessionInner>,
}

struct SessionInner {
  host: Arc<dyn HostCentral>,
  config: SessionConfig,
  router: Arc<CentralRouter>,
  cache: Arc<PeripheralCache>,
  token: DelegateToken,
}

impl CentralSession {
  pub fn new(host: Arc<dyn HostCentral>, config: SessionConfig) -> Self {
    let router = Arc::new(CentralRouter::new(&config, host.state(), host.is_scanning()));
    let token = DelegateToken::next();
    host.delegate_slot().install(token, router.clone());
    log::info!(
      "Central session created | token={:?} | state={:?} | event_capacity={} | scan_capacity={}",
      token,
      host.state(),
      config.event_capacity,
      config.scan_capacity
    );
    Self {
      inner: Arc::new(SessionInner {
        cache: Arc::new(PeripheralCache::new(config.event_capacity)),
        host,
        config,
        router,
        token,
      }),
    }
  }

  pub fn config(&self) -> &SessionConfig {
    &self.inner.config
  }

  /// Whether this session still owns the delegate slot of the central.
  pub fn is_delegate(&self) -> bool {
    self.inner.owns_delegate()
  }

  /// Takes the delegate slot back after it was reassigned and re-reads the host state.
  ///
  /// Streams that already ended with [`Error::DelegateOwnershipLost`] stay ended.
  pub fn restore_delegation(&self) {
    let inner = &self.inner;
    inner.host.delegate_slot().install(inner.token, inner.router.clone());
    inner.router.state.publish(inner.host.state());
    inner.router.scanning.publish(inner.host.is_scanning());
    log::info!("Delegate restored | token={:?}", inner.token);
  }

  pub fn current_state(&self) -> CentralState {
    self.inner.router.state.current()
  }

  /// The latest adapter state, then every change.
  pub fn state(&self) -> BoxStream<'static, Result<CentralState>> {
    self.supervise(self.inner.router.state.stream().map(Ok).boxed())
  }

  pub fn is_scanning(&self) -> BoxStream<'static, Result<bool>> {
    self.supervise(self.inner.router.scanning.stream().map(Ok).boxed())
  }

  pub fn state_restoration(&self) -> BoxStream<'static, Result<StateRestorationEvent>> {
    let cache = self.inner.cache.clone();
    let restored = self
      .inner
      .router
      .restoration
      .stream()
      .map(move |restored| {
        Ok(StateRestorationEvent::WillRestoreState(RestoredState {
          peripherals: restored.peripherals.iter().map(|host| cache.get_or_create(host)).collect(),
          scan_services: restored.scan_services,
          scan_options: restored.scan_options,
        }))
      })
      .boxed();
    self.supervise(restored)
  }

  /// Scans with the filter and options of the session configuration.
  pub fn scan(&self) -> BoxStream<'static, Result<AdvertisingPeripheral>> {
    match self.inner.config.scan_service_uuids() {
      Ok(services) => self.scan_for_peripherals(services, self.inner.config.scan_options()),
      Err(err) => stream::once(future::ready(Err(err))).boxed(),
    }
  }

  /// Starts scanning when first polled and stops when dropped.
  ///
  /// Only one scan is live at a time: polling a newer scan stream ends this one, and
  /// dropping a superseded stream leaves the newer scan running.
  pub fn scan_for_peripherals(
    &self,
    services: Option<Vec<Uuid>>,
    options: ScanOptions,
  ) -> BoxStream<'static, Result<AdvertisingPeripheral>> {
    let inner = self.inner.clone();
    let results = stream::once(async move {
      let (generation, receiver) = inner.router.discoveries.replace();
      log::info!(
        "Starting scan | generation={} | services={:?} | allow_duplicates={}",
        generation,
        services,
        options.allow_duplicates
      );
      inner.host.scan_for_peripherals(services.as_deref(), &options);

      let stopper = inner.clone();
      let guard = CancelGuard::new(move || stopper.stop_scan_if_current(generation));
      let cache = inner.cache.clone();
      let observations = lossy("scan", receiver)
        .map(move |discovered: Discovered| {
          Ok(AdvertisingPeripheral {
            peripheral: cache.get_or_create(&discovered.peripheral),
            advertisement: discovered.advertisement,
            rssi: discovered.rssi,
          })
        })
        .boxed();
      with_guard(observations, guard)
    })
    .flatten()
    .boxed();
    self.supervise(results)
  }

  /// Every connect, disconnect and failed connect of any peripheral.
  pub fn peripheral_connection(&self) -> BoxStream<'static, Result<PeripheralConnectionEvent>> {
    let router = &self.inner.router;
    let connected = self.connectivity(&router.connected, |peripheral, _| {
      PeripheralConnectionEvent::Connected(peripheral)
    });
    let disconnected = self.connectivity(&router.disconnected, |peripheral, error| {
      PeripheralConnectionEvent::Disconnected { peripheral, error }
    });
    let failed = self.connectivity(&router.failed, |peripheral, error| {
      PeripheralConnectionEvent::FailedToConnect { peripheral, error }
    });
    self.supervise(stream::select_all([connected, disconnected, failed]).map(Ok).boxed())
  }

  /// Connects when polled and resolves on the first connectivity event of `peripheral`.
  ///
  /// Dropping the future before that cancels the connection attempt.
  pub fn connect(
    &self,
    peripheral: &Peripheral,
    options: ConnectOptions,
  ) -> impl Future<Output = Result<Peripheral>> + Send + 'static {
    let inner = self.inner.clone();
    let peripheral = peripheral.clone();
    async move {
      let revoked = inner.revoked();
      tokio::select! {
        biased;
        established = inner.establish(&peripheral, &options) => {
          let mut established = established?;
          established.guard.disarm();
          Ok(peripheral)
        }
        _ = revoked => Err(Error::DelegateOwnershipLost),
      }
    }
  }

  /// Connects when polled, yields the connected handle, then fails with
  /// [`Error::LostConnection`] once the link drops. Dropping it disconnects.
  pub fn connection(&self, peripheral: &Peripheral, options: ConnectOptions) -> BoxStream<'static, Result<Peripheral>> {
    let inner = self.inner.clone();
    let peripheral = peripheral.clone();
    let connection = stream::unfold(ConnectionPhase::Pending, move |phase| {
      advance_connection(inner.clone(), peripheral.clone(), options.clone(), phase)
    })
    .boxed();
    self.supervise(connection)
  }

  /// Cancels the connection of `peripheral` right away.
  pub fn disconnect(&self, peripheral: &Peripheral) -> Result<()> {
    self.inner.ensure_cached(peripheral)?;
    log::info!("Cancelling connection | peripheral={}", peripheral.id());
    self.inner.host.cancel_peripheral_connection(peripheral.host());
    Ok(())
  }

  /// The handle already known for `id`, without asking the host.
  pub fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
    self.inner.cache.get(id)
  }

  pub fn retrieve_peripherals(&self, identifiers: &[PeripheralId]) -> Vec<Peripheral> {
    self.canonical(self.inner.host.retrieve_peripherals(identifiers))
  }

  /// Peripherals connected to the system that expose any of `services`.
  pub fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<Peripheral> {
    self.canonical(self.inner.host.retrieve_connected_peripherals(services))
  }

  fn canonical(&self, hosts: Vec<HostPeripheralRef>) -> Vec<Peripheral> {
    hosts.iter().map(|host| self.inner.cache.get_or_create(host)).collect()
  }

  fn connectivity(
    &self,
    channel: &EventChannel<Connectivity>,
    event: fn(Peripheral, Option<HostError>) -> PeripheralConnectionEvent,
  ) -> BoxStream<'static, PeripheralConnectionEvent> {
    let cache = self.inner.cache.clone();
    channel
      .stream()
      .map(move |connectivity| event(cache.get_or_create(&connectivity.peripheral), connectivity.error))
      .boxed()
  }

  fn supervise<T>(&self, stream: BoxStream<'static, Result<T>>) -> BoxStream<'static, Result<T>>
  where
    T: Send + 'static,
  {
    Supervised::new(stream, self.inner.revoked()).boxed()
  }
}

impl fmt::Debug for CentralSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CentralSession")
      .field("token", &self.inner.token)
      .field("state", &self.current_state())
      .field("peripherals", &self.inner.cache.len())
      .finish()
  }
}

struct Established {
  disconnected: Listener<Connectivity>,
  guard: CancelGuard,
}

impl SessionInner {
  fn owns_delegate(&self) -> bool {
    self.host.delegate_slot().is_owned_by(self.token)
  }

  fn revoked(&self) -> futures::future::BoxFuture<'static, ()> {
    ownership_revoked(self.host.delegate_slot().subscribe(), self.token)
  }

  fn ensure_cached(&self, peripheral: &Peripheral) -> Result<()> {
    if self.cache.owns(peripheral) {
      Ok(())
    } else {
      Err(Error::WrapperTypeMismatch {
        expected: peripheral.id(),
        entity: Entity::Peripheral(peripheral.id()),
      })
    }
  }

  fn stop_scan_if_current(&self, generation: u64) {
    if self.router.discoveries.generation() != generation {
      log::debug!("Scan superseded, leaving the newer scan running | generation={}", generation);
      return;
    }
    if !self.owns_delegate() {
      return;
    }
    log::info!("Stopping scan | generation={}", generation);
    self.host.stop_scan();
  }

  /// Issues the connect and waits for the first event about `peripheral`.
  async fn establish(&self, peripheral: &Peripheral, options: &ConnectOptions) -> Result<Established> {
    self.ensure_cached(peripheral)?;
    let id = peripheral.id();
    let mut connected = self.router.connected.listen(id);
    let mut disconnected = self.router.disconnected.listen(id);
    let mut failed = self.router.failed.listen(id);

    log::info!("Connecting | peripheral={} | options={:?}", id, options);
    self.host.connect(peripheral.host(), options);
    let host = self.host.clone();
    let target = peripheral.host().clone();
    let mut guard = CancelGuard::new(move || {
      log::info!("Cancelling connection | peripheral={}", target.id());
      host.cancel_peripheral_connection(&target);
    });

    // A drop queued next to the connect event wins: the link is not stable.
    let outcome = tokio::select! {
      biased;
      event = failed.next() => event.and_then(|event| {
        Err(Error::FailedToConnect {
          peripheral: peripheral.clone(),
          cause: event.error,
        })
      }),
      event = disconnected.next() => event.and_then(|event| {
        Err(Error::LostConnection {
          peripheral: peripheral.clone(),
          cause: event.error,
        })
      }),
      event = connected.next() => event.map(|_| ()),
    };
    match outcome {
      Ok(()) => {
        log::debug!("Connected | peripheral={}", id);
        Ok(Established { disconnected, guard })
      }
      Err(err) => {
        guard.disarm();
        Err(err)
      }
    }
  }
}

impl Drop for SessionInner {
  fn drop(&mut self) {
    if self.owns_delegate() {
      self.host.delegate_slot().clear();
      log::info!("Central session dropped, delegate released | token={:?}", self.token);
    }
  }
}

enum ConnectionPhase {
  Pending,
  Connected(Established),
  Finished,
}

async fn advance_connection(
  inner: Arc<SessionInner>,
  peripheral: Peripheral,
  options: ConnectOptions,
  phase: ConnectionPhase,
) -> Option<(Result<Peripheral>, ConnectionPhase)> {
  match phase {
    ConnectionPhase::Finished => None,
    ConnectionPhase::Pending => Some(match inner.establish(&peripheral, &options).await {
      Ok(established) => (Ok(peripheral), ConnectionPhase::Connected(established)),
      Err(err) => (Err(err), ConnectionPhase::Finished),
    }),
    ConnectionPhase::Connected(Established {
      mut disconnected,
      mut guard,
    }) => {
      let lost = disconnected.next().await;
      guard.disarm();
      let err = match lost {
        Ok(event) => Error::LostConnection {
          peripheral,
          cause: event.error,
        },
        Err(err) => err,
      };
      Some((Err(err), ConnectionPhase::Finished))
    }
  }
}

#[derive(Clone)]
struct Discovered {
  peripheral: HostPeripheralRef,
  advertisement: AdvertisementData,
  rssi: i16,
}

/// The delegate installed on the host central; it only publishes.
struct CentralRouter {
  state: ReplayChannel<CentralState>,
  scanning: ReplayChannel<bool>,
  restoration: EventChannel<HostRestoredState>,
  discoveries: ScanChannel<Discovered>,
  connected: EventChannel<Connectivity>,
  disconnected: EventChannel<Connectivity>,
  failed: EventChannel<Connectivity>,
}

impl CentralRouter {
  fn new(config: &SessionConfig, state: CentralState, is_scanning: bool) -> Self {
    let capacity = config.event_capacity;
    Self {
      state: ReplayChannel::new("central_state", state, capacity),
      scanning: ReplayChannel::new("scanning", is_scanning, capacity),
      restoration: EventChannel::new("restoration", capacity),
      discoveries: ScanChannel::new(config.scan_capacity),
      connected: EventChannel::new("connected", capacity),
      disconnected: EventChannel::new("disconnected", capacity),
      failed: EventChannel::new("failed_to_connect", capacity),
    }
  }
}

impl CentralDelegate for CentralRouter {
  fn did_update_state(&self, state: CentralState) {
    log::trace!("Central state updated | state={:?}", state);
    self.state.publish(state);
  }

  fn did_update_scanning(&self, is_scanning: bool) {
    self.scanning.publish(is_scanning);
  }

  fn will_restore_state(&self, restored: HostRestoredState) {
    log::trace!("Restoring state | peripherals={}", restored.peripherals.len());
    self.restoration.publish(restored);
  }

  fn did_discover(&self, peripheral: HostPeripheralRef, advertisement: AdvertisementData, rssi: i16) {
    self.discoveries.publish(Discovered {
      peripheral,
      advertisement,
      rssi,
    });
  }

  fn did_connect(&self, peripheral: HostPeripheralRef) {
    self.connected.publish(Connectivity { peripheral, error: None });
  }

  fn did_fail_to_connect(&self, peripheral: HostPeripheralRef, error: Option<HostError>) {
    self.failed.publish(Connectivity { peripheral, error });
  }

  fn did_disconnect(&self, peripheral: HostPeripheralRef, error: Option<HostError>) {
    self.disconnected.publish(Connectivity { peripheral, error });
  }
}
