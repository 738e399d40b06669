//! Broadcast channels fed by the delegate entrypoints, one per callback kind.

use std::sync::{Mutex, PoisonError};

use futures::{
  stream::{self, BoxStream},
  StreamExt,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::correlation::{Correlate, Listener};

/// Passthrough channel: subscribers only see events published after they attach.
pub(crate) struct EventChannel<E> {
  name: &'static str,
  sender: broadcast::Sender<E>,
}

impl<E> EventChannel<E>
where
  E: Clone + Send + 'static,
{
  pub(crate) fn new(name: &'static str, capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { name, sender }
  }

  pub(crate) fn publish(&self, event: E) {
    let delivered = self.sender.send(event).unwrap_or(0);
    log::trace!("Published event | channel={} | receivers={}", self.name, delivered);
  }

  pub(crate) fn listen(&self, key: E::Key) -> Listener<E>
  where
    E: Correlate,
  {
    Listener::new(self.name, self.sender.subscribe(), key)
  }

  /// Every event as an endless stream; events missed by a slow reader are logged and skipped.
  pub(crate) fn stream(&self) -> BoxStream<'static, E> {
    lossy(self.name, self.sender.subscribe())
  }
}

/// Channel that replays its latest value to each new subscriber before live updates.
pub(crate) struct ReplayChannel<T> {
  name: &'static str,
  current: Mutex<T>,
  sender: broadcast::Sender<T>,
}

impl<T> ReplayChannel<T>
where
  T: Clone + PartialEq + Send + 'static,
{
  pub(crate) fn new(name: &'static str, initial: T, capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self {
      name,
      current: Mutex::new(initial),
      sender,
    }
  }

  pub(crate) fn current(&self) -> T {
    self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub(crate) fn publish(&self, value: T) {
    let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
    *current = value.clone();
    let _ = self.sender.send(value);
  }

  /// Latest value first, then every later one with consecutive duplicates removed.
  pub(crate) fn stream(&self) -> BoxStream<'static, T> {
    let (seed, receiver) = {
      let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
      (current.clone(), self.sender.subscribe())
    };
    stream::once(async move { seed })
      .chain(lossy(self.name, receiver))
      .scan(None::<T>, |last, value| {
        let repeated = last.as_ref() == Some(&value);
        *last = Some(value.clone());
        futures::future::ready(Some((!repeated).then_some(value)))
      })
      .filter_map(futures::future::ready)
      .boxed()
  }
}

/// Scan result channel. Starting a new scan replaces the sender, which ends every
/// stream attached to the previous one.
pub(crate) struct ScanChannel<E> {
  capacity: usize,
  slot: Mutex<(u64, broadcast::Sender<E>)>,
}

impl<E> ScanChannel<E>
where
  E: Clone + Send + 'static,
{
  pub(crate) fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self {
      capacity: capacity.max(1),
      slot: Mutex::new((0, sender)),
    }
  }

  pub(crate) fn replace(&self) -> (u64, broadcast::Receiver<E>) {
    let (sender, receiver) = broadcast::channel(self.capacity);
    let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
    slot.0 += 1;
    slot.1 = sender;
    (slot.0, receiver)
  }

  pub(crate) fn generation(&self) -> u64 {
    self.slot.lock().unwrap_or_else(PoisonError::into_inner).0
  }

  pub(crate) fn publish(&self, event: E) {
    let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
    let delivered = slot.1.send(event).unwrap_or(0);
    log::trace!("Published scan result | generation={} | receivers={}", slot.0, delivered);
  }
}

pub(crate) fn lossy<E>(name: &'static str, receiver: broadcast::Receiver<E>) -> BoxStream<'static, E>
where
  E: Clone + Send + 'static,
{
  BroadcastStream::new(receiver)
    .filter_map(move |item| {
      futures::future::ready(match item {
        Ok(event) => Some(event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
          log::warn!("Stream lagged behind | channel={} | skipped={}", name, skipped);
          None
        }
      })
    })
    .boxed()
}
