#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use reactive_bluetooth::{
  fake::{FakeCentral, FakePeripheral},
  host::HostPeripheral,
  uuid_from_u16, CentralSession, CentralState, Characteristic, Peripheral, Service, SessionConfig,
};

pub const HEART_RATE: u16 = 0x180d;
pub const BATTERY: u16 = 0x180f;
pub const MEASUREMENT: u16 = 0x2a37;
pub const CONTROL_POINT: u16 = 0x2a39;

pub fn session() -> (Arc<FakeCentral>, CentralSession) {
  let central = FakeCentral::new(CentralState::PoweredOn);
  let session = CentralSession::new(central.clone(), SessionConfig::default());
  (central, session)
}

/// A fake device known to `central` and its canonical handle in `session`.
pub fn device(central: &FakeCentral, session: &CentralSession, name: &str) -> (Arc<FakePeripheral>, Peripheral) {
  let fake = FakePeripheral::new(name);
  central.add_peripheral(fake.clone());
  let peripheral = session
    .retrieve_peripherals(&[fake.id()])
    .pop()
    .expect("fake peripheral is retrievable");
  (fake, peripheral)
}

pub fn heart_rate_service(peripheral: &Peripheral) -> Service {
  Service::new(peripheral.id(), uuid_from_u16(HEART_RATE))
}

pub fn measurement(peripheral: &Peripheral) -> Characteristic {
  Characteristic::new(&heart_rate_service(peripheral), uuid_from_u16(MEASUREMENT))
}

pub fn control_point(peripheral: &Peripheral) -> Characteristic {
  Characteristic::new(&heart_rate_service(peripheral), uuid_from_u16(CONTROL_POINT))
}

/// Hang guard for awaits that should already be satisfied.
pub async fn within<F: Future>(future: F) -> F::Output {
  tokio::time::timeout(Duration::from_secs(1), future)
    .await
    .expect("operation did not complete")
}
