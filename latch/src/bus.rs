//! A publish/subscribe channel shared by every live instance of the application
//!
//! Each instance joins a named channel and receives an endpoint of its own.
//! Messages published through an endpoint reach every other endpoint on the
//! channel, but never the publisher itself, so the publisher must update its
//! own state before publishing.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use tokio::{sync::broadcast, task::JoinHandle};

const CHANNEL_CAPACITY: usize = 64;

/// The literal sent to announce a sign-out
pub const SIGN_OUT: &str = "signOut";

/// A message understood by session managers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMessage {
    /// An instance has signed out; every instance should drop its session
    SignedOut,
    /// A message this version does not understand
    Unrecognized(String),
}

impl AuthMessage {
    /// The wire form of the message
    pub fn as_str(&self) -> &str {
        match self {
            Self::SignedOut => SIGN_OUT,
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl From<&str> for AuthMessage {
    fn from(raw: &str) -> Self {
        match raw {
            SIGN_OUT => Self::SignedOut,
            other => Self::Unrecognized(other.to_owned()),
        }
    }
}

impl fmt::Display for AuthMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
struct Envelope {
    sender: u64,
    payload: Arc<str>,
}

/// The medium shared by all instances
///
/// Cloning yields another handle to the same medium.
#[derive(Clone, Debug, Default)]
pub struct CrossInstanceBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
    next_instance: Arc<AtomicU64>,
}

impl CrossInstanceBus {
    /// Constructs a new bus with no channels
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins a named channel as a new instance
    pub fn channel(&self, name: &str) -> BusEndpoint {
        let tx = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        BusEndpoint {
            instance: self.next_instance.fetch_add(1, Ordering::Relaxed),
            channel: name.into(),
            tx,
        }
    }
}

/// One instance's view of a bus channel
#[derive(Clone, Debug)]
pub struct BusEndpoint {
    instance: u64,
    channel: Arc<str>,
    tx: broadcast::Sender<Envelope>,
}

impl BusEndpoint {
    /// The channel this endpoint belongs to
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publishes a message to every other instance on the channel
    ///
    /// Delivery is best-effort. Returns the number of subscriptions the
    /// message was handed to; the publisher's own subscription, if any, is
    /// counted but ignores the message.
    pub fn publish(&self, message: impl fmt::Display) -> usize {
        let envelope = Envelope {
            sender: self.instance,
            payload: message.to_string().into(),
        };

        match self.tx.send(envelope) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!(channel = %self.channel, "no subscribers on channel");
                0
            }
        }
    }

    /// Runs `handler` for every message published by other instances
    ///
    /// Messages are handled in channel order. Delivery stops when the returned
    /// [`Subscription`] is dropped. Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        let instance = self.instance;
        let channel = self.channel.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) if envelope.sender == instance => {}
                    Ok(envelope) => handler(&envelope.payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            channel = %channel,
                            skipped,
                            "subscriber lagged behind, messages were dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription { task }
    }
}

/// A live subscription to a bus channel
///
/// Dropping the subscription stops delivery.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stops delivery to this subscription
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    fn collect(endpoint: &BusEndpoint) -> (Subscription, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = endpoint.subscribe(move |message| {
            let _ = tx.send(message.to_owned());
        });
        (subscription, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn sign_out_literal_parses() {
        assert_eq!(AuthMessage::from("signOut"), AuthMessage::SignedOut);
        assert_eq!(AuthMessage::SignedOut.to_string(), "signOut");
        assert_eq!(
            AuthMessage::from("refresh"),
            AuthMessage::Unrecognized("refresh".to_owned())
        );
    }

    #[tokio::test]
    async fn other_instances_receive_published_messages() {
        let bus = CrossInstanceBus::new();
        let first = bus.channel("auth");
        let second = bus.channel("auth");
        let (_sub, mut rx) = collect(&second);
        tokio::task::yield_now().await;

        first.publish(AuthMessage::SignedOut);

        assert_eq!(next(&mut rx).await.as_deref(), Some("signOut"));
    }

    #[tokio::test]
    async fn publisher_does_not_receive_its_own_message() {
        let bus = CrossInstanceBus::new();
        let publisher = bus.channel("auth");
        let other = bus.channel("auth");
        let (_own, mut own_rx) = collect(&publisher);
        let (_other, mut other_rx) = collect(&other);
        tokio::task::yield_now().await;

        publisher.publish(AuthMessage::SignedOut);

        assert_eq!(next(&mut other_rx).await.as_deref(), Some("signOut"));
        assert_eq!(next(&mut own_rx).await, None);
    }

    #[tokio::test]
    async fn channels_are_isolated_by_name() {
        let bus = CrossInstanceBus::new();
        let auth = bus.channel("auth");
        let theme = bus.channel("theme");
        let (_sub, mut rx) = collect(&theme);
        tokio::task::yield_now().await;

        auth.publish(AuthMessage::SignedOut);

        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_reaches_no_one() {
        let bus = CrossInstanceBus::new();
        assert_eq!(bus.channel("auth").publish(AuthMessage::SignedOut), 0);
    }

    #[tokio::test]
    async fn unsubscribed_instance_stops_receiving() {
        let bus = CrossInstanceBus::new();
        let publisher = bus.channel("auth");
        let listener = bus.channel("auth");
        let (subscription, mut rx) = collect(&listener);
        tokio::task::yield_now().await;

        subscription.unsubscribe();
        tokio::task::yield_now().await;
        publisher.publish(AuthMessage::SignedOut);

        assert_eq!(next(&mut rx).await, None);
    }
}
