//! Replay-latest broadcast channel.
//!
//! A `ReplayChannel` remembers the last value it emitted and hands it to every
//! new subscriber before forwarding later values. `send` drops a value equal to
//! the current one, so state observers never see the same state twice in a row;
//! `publish` always emits, for feeds that report every mutation.
//! Closing the channel is terminal and distinct from "no value yet": subscribers
//! drain what was already sent and then see the end of the stream.

use futures::Stream;
use std::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::lock::mutex_lock;
use super::resource::Resource;

/// How many emissions a slow subscriber may fall behind before skipping ahead.
const CHANNEL_CAPACITY: usize = 64;

struct ChannelState<T> {
  latest: Option<T>,
  /// `None` once the channel is closed
  sender: Option<broadcast::Sender<T>>,
}

pub struct ReplayChannel<T> {
  state: Mutex<ChannelState<T>>,
}

impl<T: Clone + PartialEq> ReplayChannel<T> {
  /// Create an open channel with no value yet.
  pub fn new() -> Self {
    let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
    Self {
      state: Mutex::new(ChannelState {
        latest: None,
        sender: Some(sender),
      }),
    }
  }

  /// Create an open channel whose first replayed value is `value`.
  pub fn with_value(value: T) -> Self {
    let channel = Self::new();
    channel.send(value);
    channel
  }

  /// Emit `value` to all subscribers.
  ///
  /// Returns `false` when nothing was emitted, either because the value equals
  /// the latest one or because the channel is closed.
  pub fn send(&self, value: T) -> bool {
    self.emit(value, true)
  }

  /// Emit `value` to all subscribers even if it equals the latest one.
  ///
  /// Returns `false` only when the channel is closed.
  pub fn publish(&self, value: T) -> bool {
    self.emit(value, false)
  }

  fn emit(&self, value: T, skip_duplicate: bool) -> bool {
    let mut state = mutex_lock(&self.state, "channel.emit");
    let Some(sender) = state.sender.clone() else {
      return false;
    };
    if skip_duplicate && state.latest.as_ref() == Some(&value) {
      return false;
    }
    state.latest = Some(value.clone());
    // No receivers is fine, late subscribers get the value through replay
    let _ = sender.send(value);
    true
  }

  /// The most recently emitted value.
  pub fn latest(&self) -> Option<T> {
    mutex_lock(&self.state, "channel.latest").latest.clone()
  }

  pub fn has_value(&self) -> bool {
    mutex_lock(&self.state, "channel.has_value").latest.is_some()
  }

  pub fn is_closed(&self) -> bool {
    mutex_lock(&self.state, "channel.is_closed").sender.is_none()
  }

  /// Subscribe to the channel, starting with a replay of the latest value.
  ///
  /// Subscribing to a closed channel yields a subscription that has already ended.
  pub fn subscribe(&self) -> Subscription<T> {
    let state = mutex_lock(&self.state, "channel.subscribe");
    match &state.sender {
      Some(sender) => Subscription {
        replay: state.latest.clone(),
        receiver: Some(sender.subscribe()),
      },
      None => Subscription {
        replay: None,
        receiver: None,
      },
    }
  }

  /// Close the channel. Later sends are dropped.
  pub fn close(&self) {
    mutex_lock(&self.state, "channel.close").sender = None;
  }
}

impl<T: Clone + PartialEq> Default for ReplayChannel<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// One observer's view of a `ReplayChannel`.
pub struct Subscription<T> {
  replay: Option<T>,
  receiver: Option<broadcast::Receiver<T>>,
}

impl<T: Clone> Subscription<T> {
  /// Wait for the next value. Returns `None` once the channel is closed.
  pub async fn recv(&mut self) -> Option<T> {
    if let Some(value) = self.replay.take() {
      return Some(value);
    }
    let receiver = self.receiver.as_mut()?;
    loop {
      match receiver.recv().await {
        Ok(value) => return Some(value),
        Err(RecvError::Lagged(skipped)) => {
          warn!(skipped, "Subscriber fell behind, skipping to newer states");
        }
        Err(RecvError::Closed) => {
          self.receiver = None;
          return None;
        }
      }
    }
  }

  /// Take the next value only if one is ready right now.
  pub fn try_recv(&mut self) -> Option<T> {
    if let Some(value) = self.replay.take() {
      return Some(value);
    }
    let receiver = self.receiver.as_mut()?;
    loop {
      match receiver.try_recv() {
        Ok(value) => return Some(value),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(broadcast::error::TryRecvError::Empty) => return None,
        Err(broadcast::error::TryRecvError::Closed) => {
          self.receiver = None;
          return None;
        }
      }
    }
  }

  pub fn is_ended(&self) -> bool {
    self.replay.is_none() && self.receiver.is_none()
  }

  pub fn into_stream(self) -> impl Stream<Item = T>
  where
    T: Send + 'static,
  {
    futures::stream::unfold(self, |mut subscription| async move {
      subscription
        .recv()
        .await
        .map(|value| (value, subscription))
    })
  }
}

impl<V: Clone> Subscription<Resource<V>> {
  /// Wait for the first state that is not `Loading`.
  pub async fn next_settled(&mut self) -> Option<Resource<V>> {
    while let Some(state) = self.recv().await {
      if !state.is_loading() {
        return Some(state);
      }
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::StreamExt;

  #[tokio::test]
  async fn test_late_subscriber_gets_latest() {
    let channel = ReplayChannel::new();
    channel.send(1);
    channel.send(2);

    let mut subscription = channel.subscribe();
    assert_eq!(subscription.recv().await, Some(2));

    channel.send(3);
    assert_eq!(subscription.recv().await, Some(3));
  }

  #[tokio::test]
  async fn test_consecutive_duplicates_suppressed() {
    let channel = ReplayChannel::new();
    let mut subscription = channel.subscribe();

    assert!(channel.send("a"));
    assert!(!channel.send("a"));
    assert!(channel.send("b"));

    assert_eq!(subscription.recv().await, Some("a"));
    assert_eq!(subscription.recv().await, Some("b"));
    assert_eq!(subscription.try_recv(), None);
  }

  #[tokio::test]
  async fn test_publish_repeats_equal_values() {
    let channel = ReplayChannel::new();
    let mut subscription = channel.subscribe();

    assert!(channel.publish("a"));
    assert!(channel.publish("a"));

    assert_eq!(subscription.recv().await, Some("a"));
    assert_eq!(subscription.recv().await, Some("a"));
    assert_eq!(subscription.try_recv(), None);

    channel.close();
    assert!(!channel.publish("b"));
  }

  #[tokio::test]
  async fn test_close_ends_subscriptions() {
    let channel = ReplayChannel::with_value(1);
    let mut subscription = channel.subscribe();
    channel.send(2);
    channel.close();

    assert!(channel.is_closed());
    assert!(!channel.send(3));

    assert_eq!(subscription.recv().await, Some(1));
    assert_eq!(subscription.recv().await, Some(2));
    assert_eq!(subscription.recv().await, None);
    assert!(subscription.is_ended());
  }

  #[tokio::test]
  async fn test_closed_is_distinct_from_empty() {
    let channel: ReplayChannel<u8> = ReplayChannel::new();
    assert!(!channel.has_value());
    assert!(!channel.is_closed());
    assert!(!channel.subscribe().is_ended());

    channel.close();
    assert!(channel.subscribe().is_ended());
  }

  #[tokio::test]
  async fn test_into_stream() {
    let channel = ReplayChannel::with_value(10);
    let stream = channel.subscribe().into_stream();
    channel.send(11);
    channel.close();

    let values: Vec<i32> = stream.collect().await;
    assert_eq!(values, vec![10, 11]);
  }

  #[tokio::test]
  async fn test_next_settled_skips_loading() {
    let channel = ReplayChannel::new();
    channel.send(Resource::loading(None));
    let mut subscription = channel.subscribe();
    channel.send(Resource::success(Some(5)));

    assert_eq!(
      subscription.next_settled().await,
      Some(Resource::success(Some(5)))
    );
  }
}
