use std::{
  collections::HashMap,
  sync::{Mutex, PoisonError},
};

use crate::{host::HostPeripheralRef, models::PeripheralId, peripheral::Peripheral};

/// One canonical [`Peripheral`] per host identifier, kept for the life of the session.
///
/// A handle owns the delegate of its host peripheral, so building a second handle for
/// the same identifier would steal that delegate and strand the first handle's
/// pending operations. Lookup and construction therefore happen under one lock.
pub(crate) struct PeripheralCache {
  event_capacity: usize,
  peripherals: Mutex<HashMap<PeripheralId, Peripheral>>,
}

impl PeripheralCache {
  pub(crate) fn new(event_capacity: usize) -> Self {
    Self {
      event_capacity,
      peripherals: Mutex::new(HashMap::new()),
    }
  }

  pub(crate) fn get_or_create(&self, host: &HostPeripheralRef) -> Peripheral {
    let id = host.id();
    let mut peripherals = self.peripherals.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(peripheral) = peripherals.get(&id) {
      return peripheral.clone();
    }
    let peripheral = Peripheral::new(host.clone(), self.event_capacity);
    log::debug!("Cached new peripheral | id={} | cached={}", id, peripherals.len() + 1);
    peripherals.insert(id, peripheral.clone());
    peripheral
  }

  pub(crate) fn get(&self, id: &PeripheralId) -> Option<Peripheral> {
    self
      .peripherals
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(id)
      .cloned()
  }

  /// Whether `peripheral` is the exact handle this cache gave out.
  pub(crate) fn owns(&self, peripheral: &Peripheral) -> bool {
    self
      .get(&peripheral.id())
      .map(|cached| Peripheral::ptr_eq(&cached, peripheral))
      .unwrap_or(false)
  }

  pub(crate) fn len(&self) -> usize {
    self.peripherals.lock().unwrap_or_else(PoisonError::into_inner).len()
  }
}
