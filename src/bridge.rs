//! Pieces shared by every request/response operation: lazy issue, correlated wait,
//! cancel-on-drop and session supervision.

use std::{
  pin::Pin,
  task::{Context, Poll},
};

use futures::{
  future::BoxFuture,
  stream::{self, BoxStream},
  FutureExt, Stream, StreamExt,
};
use tokio::sync::watch;

use crate::{
  channel::EventChannel,
  correlation::Correlate,
  host::DelegateToken,
  Error, Result,
};

/// Runs its inverse host action once when dropped, unless disarmed first.
pub(crate) struct CancelGuard {
  action: Option<Box<dyn FnOnce() + Send>>,
}

impl CancelGuard {
  pub(crate) fn new(action: impl FnOnce() + Send + 'static) -> Self {
    Self {
      action: Some(Box::new(action)),
    }
  }

  /// The operation finished on its own; nothing is left to cancel.
  pub(crate) fn disarm(&mut self) {
    self.action = None;
  }
}

impl Drop for CancelGuard {
  fn drop(&mut self) {
    if let Some(action) = self.action.take() {
      action();
    }
  }
}

/// Keeps `guard` alive exactly as long as `stream`.
pub(crate) fn with_guard<T>(stream: BoxStream<'static, T>, guard: CancelGuard) -> BoxStream<'static, T>
where
  T: Send + 'static,
{
  stream::unfold((stream, guard), |(mut stream, guard)| async move {
    let item = stream.next().await?;
    Some((item, (stream, guard)))
  })
  .boxed()
}

/// Subscribes to `channel`, then issues the command, then waits for the reply with `key`.
///
/// Subscribing first means a reply raised synchronously by `issue` is not lost.
pub(crate) async fn request<E, F>(channel: &EventChannel<E>, key: E::Key, issue: F) -> Result<E>
where
  E: Correlate + Clone + Send + 'static,
  F: FnOnce(),
{
  let mut listener = channel.listen(key);
  issue();
  listener.next().await
}

/// Flattens a one-shot discovery into one stream element per child.
pub(crate) fn expand<T, F>(discovery: F) -> BoxStream<'static, Result<T>>
where
  T: Send + 'static,
  F: std::future::Future<Output = Result<Vec<T>>> + Send + 'static,
{
  stream::once(discovery)
    .flat_map(|outcome| match outcome {
      Ok(children) => stream::iter(children.into_iter().map(Ok)).boxed(),
      Err(err) => stream::once(async move { Err(err) }).boxed(),
    })
    .boxed()
}

/// Keeps only the entries whose identifier is in `allowed`; `None` keeps all.
pub(crate) fn allow_listed<T, K>(children: Vec<T>, allowed: Option<&[K]>, key: impl Fn(&T) -> K) -> Vec<T>
where
  K: PartialEq,
{
  match allowed {
    Some(allowed) => children.into_iter().filter(|child| allowed.contains(&key(child))).collect(),
    None => children,
  }
}

/// Resolves once `token` no longer owns the delegate slot watched by `owner`.
pub(crate) fn ownership_revoked(
  mut owner: watch::Receiver<Option<DelegateToken>>,
  token: DelegateToken,
) -> BoxFuture<'static, ()> {
  async move {
    loop {
      let owned = *owner.borrow_and_update() == Some(token);
      if !owned {
        return;
      }
      if owner.changed().await.is_err() {
        return;
      }
    }
  }
  .boxed()
}

/// A session stream that ends with [`Error::DelegateOwnershipLost`] when the session
/// loses its delegate slot, and ends after the first error of any kind.
pub(crate) struct Supervised<T> {
  inner: Option<BoxStream<'static, Result<T>>>,
  revoked: Option<BoxFuture<'static, ()>>,
}

impl<T> Supervised<T> {
  pub(crate) fn new(inner: BoxStream<'static, Result<T>>, revoked: BoxFuture<'static, ()>) -> Self {
    Self {
      inner: Some(inner),
      revoked: Some(revoked),
    }
  }

  fn finish(&mut self) {
    self.inner = None;
    self.revoked = None;
  }
}

impl<T> Stream for Supervised<T> {
  type Item = Result<T>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if let Some(revoked) = this.revoked.as_mut() {
      if revoked.poll_unpin(cx).is_ready() {
        log::warn!("Delegate ownership lost, terminating session stream");
        this.finish();
        return Poll::Ready(Some(Err(Error::DelegateOwnershipLost)));
      }
    }
    let Some(inner) = this.inner.as_mut() else {
      return Poll::Ready(None);
    };
    match inner.as_mut().poll_next(cx) {
      Poll::Ready(Some(Err(err))) => {
        this.finish();
        Poll::Ready(Some(Err(err)))
      }
      Poll::Ready(None) => {
        this.finish();
        Poll::Ready(None)
      }
      other => other,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  use super::*;

  #[test]
  fn guard_fires_once_unless_disarmed() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    drop(CancelGuard::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let counter = fired.clone();
    let mut guard = CancelGuard::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    guard.disarm();
    guard.disarm();
    drop(guard);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn guarded_stream_cancels_when_dropped_or_exhausted() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let mut guarded = with_guard(
      stream::iter(vec![1, 2]).boxed(),
      CancelGuard::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
      }),
    );
    assert_eq!(guarded.next().await, Some(1));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    drop(guarded);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn expand_emits_one_element_per_child() {
    let items: Vec<_> = expand(async { Ok(vec![1, 2, 3]) }).collect().await;
    assert_eq!(items.into_iter().map(|item| item.unwrap()).collect::<Vec<_>>(), vec![1, 2, 3]);

    let failed: Vec<Result<u8>> = expand(async { Err(Error::DelegateOwnershipLost) }).collect().await;
    assert_eq!(failed.len(), 1);
  }

  #[test]
  fn allow_list_filters_by_key() {
    let kept = allow_listed(vec![1, 2, 3, 4], Some(&[2, 4][..]), |n| *n);
    assert_eq!(kept, vec![2, 4]);
    assert_eq!(allow_listed(vec![1, 2], None::<&[i32]>, |n| *n), vec![1, 2]);
  }

  #[tokio::test]
  async fn supervised_stream_fails_when_ownership_moves() {
    let mine = DelegateToken::next();
    let (owner, receiver) = watch::channel(Some(mine));
    let inner = stream::pending::<Result<u8>>().boxed();
    let mut supervised = Supervised::new(inner, ownership_revoked(receiver, mine));

    assert!(supervised.next().now_or_never().is_none());
    owner.send_replace(Some(DelegateToken::next()));

    assert!(matches!(supervised.next().await, Some(Err(Error::DelegateOwnershipLost))));
    assert!(supervised.next().await.is_none());
  }

  #[tokio::test]
  async fn supervised_stream_stops_after_first_error() {
    let mine = DelegateToken::next();
    let (_owner, receiver) = watch::channel(Some(mine));
    let inner = stream::iter(vec![Ok(1u8), Err(Error::SessionClosed { channel: "x" }), Ok(2)]).boxed();
    let items: Vec<_> = Supervised::new(inner, ownership_revoked(receiver, mine)).collect().await;
    assert_eq!(items.len(), 2);
    assert!(matches!(items[1], Err(Error::SessionClosed { .. })));
  }
}
