//! Matching a multiplexed callback back to the request that asked for it.

use std::fmt;

use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::{
  host::HostPeripheralRef,
  models::{Characteristic, Descriptor, PeripheralId, Service},
  Error, HostError, Result,
};

/// Payloads that carry the identifier of the entity they report on.
pub(crate) trait Correlate {
  type Key: PartialEq + fmt::Debug + Send + 'static;

  fn correlation_key(&self) -> Self::Key;
}

impl Correlate for Service {
  type Key = Uuid;

  fn correlation_key(&self) -> Uuid {
    self.uuid
  }
}

impl Correlate for Characteristic {
  type Key = (Uuid, Uuid);

  fn correlation_key(&self) -> (Uuid, Uuid) {
    (self.service, self.uuid)
  }
}

impl Correlate for Descriptor {
  type Key = (Uuid, Uuid, Uuid);

  fn correlation_key(&self) -> (Uuid, Uuid, Uuid) {
    (self.service, self.characteristic, self.uuid)
  }
}

/// A reply that only its own device's channel receives, so every listener matches it.
#[derive(Debug, Clone)]
pub(crate) struct Reply<T>(pub(crate) std::result::Result<T, HostError>);

impl<T> Correlate for Reply<T> {
  type Key = ();

  fn correlation_key(&self) {}
}

/// Children found under `parent`, or the reason discovery failed.
#[derive(Debug, Clone)]
pub(crate) struct Discovery<P, C> {
  pub(crate) parent: P,
  pub(crate) result: std::result::Result<Vec<C>, HostError>,
}

impl<P: Correlate, C> Correlate for Discovery<P, C> {
  type Key = P::Key;

  fn correlation_key(&self) -> P::Key {
    self.parent.correlation_key()
  }
}

/// Completion of a read, write or notification change on one attribute.
#[derive(Debug, Clone)]
pub(crate) struct AttributeUpdate<T> {
  pub(crate) target: T,
  pub(crate) error: Option<HostError>,
}

impl<T: Correlate> Correlate for AttributeUpdate<T> {
  type Key = T::Key;

  fn correlation_key(&self) -> T::Key {
    self.target.correlation_key()
  }
}

/// A connectivity callback of the central, keyed by the device it concerns.
#[derive(Clone)]
pub(crate) struct Connectivity {
  pub(crate) peripheral: HostPeripheralRef,
  pub(crate) error: Option<HostError>,
}

impl Correlate for Connectivity {
  type Key = PeripheralId;

  fn correlation_key(&self) -> PeripheralId {
    self.peripheral.id()
  }
}

/// A pending operation: one subscription to a channel plus the key it waits for.
///
/// Dropping the listener deregisters it.
pub(crate) struct Listener<E: Correlate> {
  channel: &'static str,
  receiver: broadcast::Receiver<E>,
  key: E::Key,
}

impl<E> Listener<E>
where
  E: Correlate + Clone,
{
  pub(crate) fn new(channel: &'static str, receiver: broadcast::Receiver<E>, key: E::Key) -> Self {
    Self {
      channel,
      receiver,
      key,
    }
  }

  /// Waits for the next event addressed to this listener, discarding the rest.
  pub(crate) async fn next(&mut self) -> Result<E> {
    loop {
      match self.receiver.recv().await {
        Ok(event) if event.correlation_key() == self.key => return Ok(event),
        Ok(event) => {
          log::trace!(
            "Discarding uncorrelated event | channel={} | expected={:?} | got={:?}",
            self.channel,
            self.key,
            event.correlation_key()
          );
        }
        Err(RecvError::Lagged(skipped)) => {
          log::warn!(
            "Listener lagged behind | channel={} | key={:?} | skipped={}",
            self.channel,
            self.key,
            skipped
          );
          return Err(Error::EventsLagged {
            channel: self.channel,
            skipped,
          });
        }
        Err(RecvError::Closed) => {
          return Err(Error::SessionClosed {
            channel: self.channel,
          })
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::uuid_from_u16;

  #[derive(Debug, Clone)]
  struct Tagged(u8, &'static str);

  impl Correlate for Tagged {
    type Key = u8;

    fn correlation_key(&self) -> u8 {
      self.0
    }
  }

  #[tokio::test]
  async fn listener_skips_events_for_other_keys() {
    let (sender, receiver) = broadcast::channel(8);
    let mut listener = Listener::new("test", receiver, 2);
    sender.send(Tagged(1, "first device")).unwrap();
    sender.send(Tagged(2, "second device")).unwrap();
    sender.send(Tagged(1, "first again")).unwrap();

    let event = listener.next().await.unwrap();
    assert_eq!(event.1, "second device");
  }

  #[tokio::test]
  async fn closed_channel_fails_the_listener() {
    let (sender, receiver) = broadcast::channel::<Tagged>(8);
    let mut listener = Listener::new("test", receiver, 1);
    drop(sender);
    assert!(matches!(listener.next().await, Err(Error::SessionClosed { channel: "test" })));
  }

  #[tokio::test]
  async fn lagging_listener_reports_skipped_events() {
    let (sender, receiver) = broadcast::channel(2);
    let mut listener = Listener::new("test", receiver, 9);
    for n in 0..5 {
      sender.send(Tagged(n, "noise")).unwrap();
    }
    assert!(matches!(listener.next().await, Err(Error::EventsLagged { skipped: 3, .. })));
  }

  #[test]
  fn characteristic_keys_include_the_service() {
    let peripheral = PeripheralId::new_random();
    let battery = Service::new(peripheral, uuid_from_u16(0x180f));
    let device_info = Service::new(peripheral, uuid_from_u16(0x180a));
    let a = Characteristic::new(&battery, uuid_from_u16(0x2a19));
    let b = Characteristic::new(&device_info, uuid_from_u16(0x2a19));
    assert_ne!(a.correlation_key(), b.correlation_key());
  }
}
