//! The NATS backhaul, consumed through a narrow interface.
//!
//! The bridge treats NATS as a black-box publish/subscribe transport with a
//! `{subject, reply, payload}` message shape. [`NatsConnector`] hands out
//! [`NatsConnection`]s scoped to a set of credentials; [`AsyncNatsConnector`]
//! is the production implementation over `async-nats`, and the test suite
//! substitutes an in-process bus (see [`crate::testing`]).

use crate::error::{MqttError, Result};
use crate::packet::Credentials;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connection name reported to the NATS server.
const CONNECTION_NAME: &str = "MQTT Bridge";

/// Buffer between a NATS subscription and its consumer task.
const SUBSCRIPTION_BUFFER: usize = 64;

/// A message delivered by a NATS subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

/// An active NATS subscription, consumed as a stream of messages.
///
/// Dropping the subscription cancels the underlying delivery; the bridge
/// relies on this for `unsubscribe`.
#[derive(Debug)]
pub struct NatsSubscription {
    subject: String,
    receiver: mpsc::Receiver<NatsMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl NatsSubscription {
    /// Wraps a plain channel as a subscription. Used by transports that
    /// deliver straight into a channel.
    #[must_use]
    pub fn from_channel(subject: impl Into<String>, receiver: mpsc::Receiver<NatsMessage>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
            forwarder: None,
        }
    }

    fn with_forwarder(
        subject: impl Into<String>,
        receiver: mpsc::Receiver<NatsMessage>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            subject: subject.into(),
            receiver,
            forwarder: Some(forwarder),
        }
    }

    /// Receives the next message, or `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<NatsMessage> {
        self.receiver.recv().await
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Drop for NatsSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

/// The publish/subscribe surface the bridge consumes.
#[async_trait]
pub trait NatsConnection: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()>;

    /// Publish carrying a reply subject for the responder.
    async fn publish_with_reply(&self, subject: &str, reply_to: &str, payload: &[u8])
        -> Result<()>;

    /// Subscribes to a subject (NATS wildcards allowed).
    async fn subscribe(&self, subject: &str) -> Result<NatsSubscription>;
}

/// Hands out connections scoped to a set of MQTT client credentials.
#[async_trait]
pub trait NatsConnector: Send + Sync {
    async fn connect(&self, credentials: Option<&Credentials>) -> Result<Arc<dyn NatsConnection>>;
}

/// Production connector over the `async-nats` client.
pub struct AsyncNatsConnector {
    /// Comma-separated NATS server URLs.
    urls: String,
    /// Credentials for the bridge's own connection, used when a connection
    /// is requested without client credentials.
    default_credentials: Option<Credentials>,
}

impl AsyncNatsConnector {
    #[must_use]
    pub fn new(urls: impl Into<String>, default_credentials: Option<Credentials>) -> Self {
        Self {
            urls: urls.into(),
            default_credentials,
        }
    }
}

#[async_trait]
impl NatsConnector for AsyncNatsConnector {
    async fn connect(&self, credentials: Option<&Credentials>) -> Result<Arc<dyn NatsConnection>> {
        let mut options = async_nats::ConnectOptions::new().name(CONNECTION_NAME);
        let creds = credentials.or(self.default_credentials.as_ref());
        if let Some(creds) = creds {
            let user = creds.user.clone().unwrap_or_default();
            // Password definitions differ between the two protocols; the
            // opaque MQTT password bytes go over as UTF-8.
            let password = creds
                .password
                .as_deref()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default();
            options = options.user_and_password(user, password);
        }
        let client = options
            .connect(self.urls.as_str())
            .await
            .map_err(|e| MqttError::Nats(e.to_string()))?;
        Ok(Arc::new(AsyncNatsConnection { client }))
    }
}

struct AsyncNatsConnection {
    client: async_nats::Client,
}

#[async_trait]
impl NatsConnection for AsyncNatsConnection {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.client
            .publish(subject.to_string(), Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| MqttError::Nats(e.to_string()))
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: &[u8],
    ) -> Result<()> {
        self.client
            .publish_with_reply(
                subject.to_string(),
                reply_to.to_string(),
                Bytes::copy_from_slice(payload),
            )
            .await
            .map_err(|e| MqttError::Nats(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<NatsSubscription> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| MqttError::Nats(e.to_string()))?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // Dropping the NatsSubscription aborts this task; dropping the
        // subscriber in turn unsubscribes on the server.
        let forwarder = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let converted = NatsMessage {
                    subject: message.subject.to_string(),
                    reply: message.reply.map(|r| r.to_string()),
                    payload: message.payload.to_vec(),
                };
                if tx.send(converted).await.is_err() {
                    break;
                }
            }
        });
        Ok(NatsSubscription::with_forwarder(subject, rx, forwarder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_from_channel() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = NatsSubscription::from_channel("a.b", rx);
        assert_eq!(sub.subject(), "a.b");
        tx.send(NatsMessage {
            subject: "a.b".to_string(),
            reply: None,
            payload: b"x".to_vec(),
        })
        .await
        .unwrap();
        drop(tx);
        assert_eq!(sub.recv().await.unwrap().payload, b"x");
        assert!(sub.recv().await.is_none());
    }
}
