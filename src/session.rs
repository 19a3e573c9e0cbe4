//! Per-client-id session state and the manager that owns it.
//!
//! A session survives the connection that created it unless the client asked
//! for a clean session. It tracks acknowledgments in both directions:
//!
//! - `awaits_ack` (MQTT → NATS): the client published with QoS 1 and the
//!   bridge is waiting for a NATS reply before it sends PUBACK back.
//! - `awaits_client_ack` (NATS → MQTT): the bridge forwarded a NATS message
//!   at QoS 1 and is waiting for the client's PUBACK, which it converts into
//!   a publish on the stored NATS reply subject.

use crate::error::Result;
use crate::nats::NatsConnection;
use crate::packet::{PublishPacket, QoS};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, error};

/// A pending reply-subject subscription registered in `awaits_ack`.
///
/// Cancelling aborts the listener task, which drops the underlying NATS
/// subscription.
#[derive(Debug)]
pub struct AckSubscription {
    subject: String,
    listener: AbortHandle,
}

impl AckSubscription {
    #[must_use]
    pub fn new(subject: impl Into<String>, listener: AbortHandle) -> Self {
        Self {
            subject: subject.into(),
            listener,
        }
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn cancel(self) {
        self.listener.abort();
    }
}

/// The slice of a connection handler that session operations call back into:
/// delivering publishes to the client and opening reply-subject
/// subscriptions. Keeping this a trait breaks the session ↔ handler cycle;
/// sessions never hold a handler.
#[async_trait]
pub trait AckRelay: Send + Sync {
    /// Delivers a publish to the client, recording it in
    /// `awaits_client_ack` first when `qos > 0`.
    async fn publish_response(&self, qos: QoS, publish: PublishPacket);

    /// Opens a subscription on a reply subject whose messages resolve
    /// pending client acks.
    async fn subscribe_ack(&self, reply_subject: &str) -> Result<AckSubscription>;
}

#[derive(Debug, Default)]
struct AckMaps {
    awaits_ack: HashMap<u16, AckSubscription>,
    awaits_client_ack: HashMap<u16, PublishPacket>,
    /// Reply subjects reloaded from a snapshot, waiting for the client to
    /// reconnect so they can be turned into live subscriptions.
    prel_awaits_ack: HashMap<u16, String>,
}

/// Data associated with one MQTT client id.
#[derive(Debug)]
pub struct Session {
    id: String,
    client_id: String,
    acks: RwLock<AckMaps>,
}

/// Snapshot form:
/// `{"id", "cid", "awAck": {"<pid>": "<subject>"}, "awClientAck": {"<pid>": <publish>}}`
/// with both maps omitted when empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub cid: String,
    #[serde(rename = "awAck", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aw_ack: BTreeMap<u16, String>,
    #[serde(
        rename = "awClientAck",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub aw_client_ack: BTreeMap<u16, PublishPacket>,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            acks: RwLock::new(AckMaps::default()),
        }
    }

    /// Identifier unique for this session within the bridge's lifetime.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The client id this session belongs to.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Records a reply-subject subscription awaiting a NATS ack for the
    /// given packet id.
    pub fn ack_requested(&self, packet_id: u16, subscription: AckSubscription) {
        let mut acks = self.acks.write().expect("session lock");
        if let Some(old) = acks.awaits_ack.insert(packet_id, subscription) {
            old.cancel();
        }
    }

    /// Whether a NATS ack is still pending for the given packet id. Used to
    /// suppress duplicate work when a DUP publish arrives.
    #[must_use]
    pub fn awaits_ack(&self, packet_id: u16) -> bool {
        self.acks
            .read()
            .expect("session lock")
            .awaits_ack
            .contains_key(&packet_id)
    }

    /// Removes and returns the pending subscription for the packet id, if
    /// any. The caller cancels it.
    #[must_use]
    pub fn ack_received(&self, packet_id: u16) -> Option<AckSubscription> {
        self.acks
            .write()
            .expect("session lock")
            .awaits_ack
            .remove(&packet_id)
    }

    /// Records a publish forwarded to the client that now awaits the
    /// client's PUBACK.
    pub fn client_ack_requested(&self, publish: PublishPacket) {
        self.acks
            .write()
            .expect("session lock")
            .awaits_client_ack
            .insert(publish.packet_id, publish);
    }

    /// Resolves a client PUBACK: when the packet id was pending, publishes a
    /// single zero byte on the original NATS reply subject and returns true.
    pub async fn client_ack_received(
        &self,
        packet_id: u16,
        nats: &Arc<dyn NatsConnection>,
    ) -> bool {
        let publish = self
            .acks
            .write()
            .expect("session lock")
            .awaits_client_ack
            .remove(&packet_id);
        match publish {
            Some(publish) => {
                if let Some(reply_to) = &publish.nats_reply_to {
                    if let Err(e) = nats.publish(reply_to, &[0]).await {
                        error!(client_id = %self.client_id, "ack propagation failed: {e}");
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Re-sends every publish still awaiting a client ack, dup flag set.
    /// Called when a persistent session is resumed.
    pub async fn resend_client_unack(&self, client: &dyn AckRelay) {
        let pending: Vec<PublishPacket> = {
            let acks = self.acks.read().expect("session lock");
            acks.awaits_client_ack.values().cloned().collect()
        };
        for mut publish in pending {
            publish.set_dup();
            let qos = publish.qos;
            client.publish_response(qos, publish).await;
        }
    }

    /// Turns reply subjects preserved in a snapshot back into live
    /// subscriptions. Called when a client resumes a reloaded session.
    pub async fn restore_ack_subscriptions(&self, client: &dyn AckRelay) {
        let preserved: Vec<(u16, String)> = {
            let mut acks = self.acks.write().expect("session lock");
            acks.prel_awaits_ack.drain().collect()
        };
        for (packet_id, subject) in preserved {
            match client.subscribe_ack(&subject).await {
                Ok(subscription) => self.ack_requested(packet_id, subscription),
                Err(e) => error!(client_id = %self.client_id, "ack subscription restore failed: {e}"),
            }
        }
    }

    /// Cancels every outstanding reply-subject subscription.
    pub fn destroy(&self) {
        let mut acks = self.acks.write().expect("session lock");
        for (_, subscription) in acks.awaits_ack.drain() {
            subscription.cancel();
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        let acks = self.acks.read().expect("session lock");
        let mut aw_ack: BTreeMap<u16, String> = acks
            .awaits_ack
            .iter()
            .map(|(id, sub)| (*id, sub.subject().to_string()))
            .collect();
        // Subjects still waiting for a reconnect survive re-persisting.
        for (id, subject) in &acks.prel_awaits_ack {
            aw_ack.entry(*id).or_insert_with(|| subject.clone());
        }
        SessionState {
            id: self.id.clone(),
            cid: self.client_id.clone(),
            aw_ack,
            aw_client_ack: acks
                .awaits_client_ack
                .iter()
                .map(|(id, p)| (*id, p.clone()))
                .collect(),
        }
    }

    #[must_use]
    pub fn from_state(state: SessionState) -> Self {
        let session = Session::new(state.id, state.cid);
        {
            let mut acks = session.acks.write().expect("session lock");
            acks.prel_awaits_ack = state.aw_ack.into_iter().collect();
            acks.awaits_client_ack = state.aw_client_ack.into_iter().collect();
        }
        session
    }
}

#[derive(Debug, Default)]
struct ManagerInner {
    seed: u32,
    sessions: HashMap<String, Arc<Session>>,
}

/// Maps client ids to sessions. All access goes through a shared lock.
#[derive(Debug, Default)]
pub struct SessionManager {
    inner: RwLock<ManagerInner>,
}

/// Snapshot form: `{"seed": n, "sessions": {"<cid>": <session>}}` with
/// `sessions` omitted when empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManagerState {
    pub seed: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sessions: BTreeMap<String, SessionState>,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh session for the client id, replacing any previous
    /// one. Session ids are `"s"` plus a monotonic counter.
    pub fn create(&self, client_id: &str) -> Arc<Session> {
        let mut inner = self.inner.write().expect("session manager lock");
        inner.seed += 1;
        let session = Arc::new(Session::new(format!("s{}", inner.seed), client_id));
        inner
            .sessions
            .insert(client_id.to_string(), Arc::clone(&session));
        session
    }

    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.inner
            .read()
            .expect("session manager lock")
            .sessions
            .get(client_id)
            .cloned()
    }

    /// Removes and destroys the session for the client id, if present.
    pub fn remove(&self, client_id: &str) {
        let session = self
            .inner
            .write()
            .expect("session manager lock")
            .sessions
            .remove(client_id);
        if let Some(session) = session {
            debug!(client_id, "session removed");
            session.destroy();
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionManagerState {
        let inner = self.inner.read().expect("session manager lock");
        SessionManagerState {
            seed: inner.seed,
            sessions: inner
                .sessions
                .iter()
                .map(|(cid, s)| (cid.clone(), s.snapshot()))
                .collect(),
        }
    }

    /// Merges a reloaded snapshot into the manager, replacing sessions whose
    /// client ids collide.
    pub fn restore(&self, state: SessionManagerState) {
        let mut inner = self.inner.write().expect("session manager lock");
        inner.seed = state.seed;
        for (cid, session_state) in state.sessions {
            inner
                .sessions
                .insert(cid, Arc::new(Session::from_state(session_state)));
        }
    }
}
