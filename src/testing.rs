//! Test support: an in-process NATS stand-in.
//!
//! [`MockNats`] implements the same connector/connection seam as the real
//! backhaul, delivering messages between subscribers over channels with
//! NATS-style `*`/`>` subject matching. Tests drive both sides of the
//! bridge with it: the bridge connects through the [`NatsConnector`]
//! implementation while the test plays the role of external NATS clients
//! through the inherent methods.

use crate::error::Result;
use crate::nats::{NatsConnection, NatsConnector, NatsMessage, NatsSubscription};
use crate::packet::Credentials;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const MOCK_BUFFER: usize = 64;

struct BusSubscription {
    subject: String,
    sender: mpsc::Sender<NatsMessage>,
}

#[derive(Default)]
struct Bus {
    subscriptions: Mutex<Vec<BusSubscription>>,
    connects: Mutex<Vec<Option<Credentials>>>,
    request_seq: AtomicU64,
}

impl Bus {
    fn deliver(&self, message: &NatsMessage) {
        let mut subscriptions = self.subscriptions.lock().expect("bus lock");
        subscriptions.retain(|sub| {
            if sub.sender.is_closed() {
                return false;
            }
            if subject_matches(&sub.subject, &message.subject) {
                // A full buffer drops the message, like a slow NATS consumer.
                let _ = sub.sender.try_send(message.clone());
            }
            true
        });
    }

    fn subscribe(&self, subject: &str) -> NatsSubscription {
        let (sender, receiver) = mpsc::channel(MOCK_BUFFER);
        self.subscriptions
            .lock()
            .expect("bus lock")
            .push(BusSubscription {
                subject: subject.to_string(),
                sender,
            });
        NatsSubscription::from_channel(subject, receiver)
    }
}

/// NATS-style subject matching: `*` matches one token, a trailing `>`
/// matches one or more.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let subject: Vec<&str> = subject.split('.').collect();
    walk(&pattern, &subject)
}

fn walk(pattern: &[&str], subject: &[&str]) -> bool {
    match (pattern.first(), subject.first()) {
        (None, None) => true,
        (Some(&">"), Some(_)) => pattern.len() == 1,
        (Some(&"*"), Some(_)) => walk(&pattern[1..], &subject[1..]),
        (Some(&token), Some(&actual)) => token == actual && walk(&pattern[1..], &subject[1..]),
        _ => false,
    }
}

/// An in-process message bus with the NATS connector interface.
#[derive(Clone, Default)]
pub struct MockNats {
    bus: Arc<Bus>,
}

impl MockNats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, subject: &str, payload: &[u8]) {
        self.bus.deliver(&NatsMessage {
            subject: subject.to_string(),
            reply: None,
            payload: payload.to_vec(),
        });
    }

    pub async fn publish_with_reply(&self, subject: &str, reply_to: &str, payload: &[u8]) {
        self.bus.deliver(&NatsMessage {
            subject: subject.to_string(),
            reply: Some(reply_to.to_string()),
            payload: payload.to_vec(),
        });
    }

    pub async fn subscribe(&self, subject: &str) -> NatsSubscription {
        self.bus.subscribe(subject)
    }

    /// Publishes a request and waits for the first reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: &[u8],
        wait: Duration,
    ) -> Option<NatsMessage> {
        let seq = self.bus.request_seq.fetch_add(1, Ordering::SeqCst);
        let inbox = format!("_REQ.{seq}");
        let mut subscription = self.subscribe(&inbox).await;
        self.publish_with_reply(subject, &inbox, payload).await;
        timeout(wait, subscription.recv()).await.ok().flatten()
    }

    /// Credentials of every connection opened through the connector, in
    /// order.
    #[must_use]
    pub fn connects(&self) -> Vec<Option<Credentials>> {
        self.bus.connects.lock().expect("bus lock").clone()
    }
}

#[async_trait]
impl NatsConnector for MockNats {
    async fn connect(&self, credentials: Option<&Credentials>) -> Result<Arc<dyn NatsConnection>> {
        self.bus
            .connects
            .lock()
            .expect("bus lock")
            .push(credentials.cloned());
        Ok(Arc::new(MockConnection {
            bus: Arc::clone(&self.bus),
        }))
    }
}

struct MockConnection {
    bus: Arc<Bus>,
}

#[async_trait]
impl NatsConnection for MockConnection {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.bus.deliver(&NatsMessage {
            subject: subject.to_string(),
            reply: None,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: &[u8],
    ) -> Result<()> {
        self.bus.deliver(&NatsMessage {
            subject: subject.to_string(),
            reply: Some(reply_to.to_string()),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<NatsSubscription> {
        Ok(self.bus.subscribe(subject))
    }
}
