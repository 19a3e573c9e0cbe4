//! Republish loop for server-originated QoS-1 messages.
//!
//! When the bridge itself publishes at QoS 1 (currently only a disconnected
//! client's will), the message is tracked here together with the credentials
//! it was published with, and republished as a NATS request every
//! `repeat_rate` milliseconds until some NATS responder replies on the
//! reply subject.

use crate::packet::{Credentials, PublishPacket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// A message which originated from this server and awaits a NATS reply.
#[derive(Debug, Clone, PartialEq)]
pub struct NatsPub {
    pub publish: PublishPacket,
    /// Credentials from the client connection the message originated on.
    pub credentials: Option<Credentials>,
}

/// Tracks pending server-originated publishes, keyed and republished in
/// packet-id order.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Mutex<BTreeMap<u16, NatsPub>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl AckTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a publication to the pending set. The caller is responsible for
    /// making sure the republish task is running (see
    /// [`BridgeServer::track_ack_received`](crate::bridge::BridgeServer)).
    pub fn insert(&self, publication: NatsPub) {
        self.pending
            .lock()
            .expect("ack tracker lock")
            .insert(publication.publish.packet_id, publication);
    }

    /// Removes a publication once its reply arrived.
    pub fn remove(&self, packet_id: u16) {
        self.pending
            .lock()
            .expect("ack tracker lock")
            .remove(&packet_id);
    }

    /// The pending set in ascending packet-id order.
    #[must_use]
    pub fn pending(&self) -> Vec<NatsPub> {
        self.pending
            .lock()
            .expect("ack tracker lock")
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().expect("ack tracker lock").is_empty()
    }

    /// Installs the republish task unless one is already running.
    pub fn ensure_timer(&self, spawn: impl FnOnce() -> JoinHandle<()>) {
        let mut timer = self.timer.lock().expect("ack tracker timer lock");
        let running = timer.as_ref().is_some_and(|t| !t.is_finished());
        if !running {
            *timer = Some(spawn());
        }
    }

    /// Stops the republish task. Pending entries stay for the snapshot.
    pub fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().expect("ack tracker timer lock").take() {
            timer.abort();
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<NatsPubState> {
        self.pending().iter().map(NatsPubState::from).collect()
    }

    pub fn restore(&self, entries: Vec<NatsPubState>) {
        let mut pending = self.pending.lock().expect("ack tracker lock");
        for entry in entries {
            let publication = NatsPub::from(entry);
            pending.insert(publication.publish.packet_id, publication);
        }
    }
}

/// Snapshot form: `{"m": <publish>, "u"?: user, "p"?: base64 password}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatsPubState {
    pub m: PublishPacket,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "ser_base64",
        deserialize_with = "de_base64"
    )]
    pub p: Option<Vec<u8>>,
}

fn ser_base64<S: serde::Serializer>(
    bytes: &Option<Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
        None => serializer.serialize_none(),
    }
}

fn de_base64<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<u8>>, D::Error> {
    let encoded = Option::<String>::deserialize(deserializer)?;
    encoded
        .map(|s| BASE64.decode(s).map_err(D::Error::custom))
        .transpose()
}

impl From<&NatsPub> for NatsPubState {
    fn from(publication: &NatsPub) -> Self {
        let creds = publication.credentials.as_ref();
        Self {
            m: publication.publish.clone(),
            u: creds.and_then(|c| c.user.clone()),
            p: creds.and_then(|c| c.password.clone()),
        }
    }
}

impl From<NatsPubState> for NatsPub {
    fn from(state: NatsPubState) -> Self {
        let credentials = if state.u.is_some() || state.p.is_some() {
            Some(Credentials {
                user: state.u,
                password: state.p,
            })
        } else {
            None
        };
        Self {
            publish: state.m,
            credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::QoS;

    fn publication(id: u16, user: Option<&str>) -> NatsPub {
        NatsPub {
            publish: PublishPacket::new(id, "w/t", b"m".to_vec(), QoS::AtLeastOnce, false, true),
            credentials: user.map(|u| Credentials {
                user: Some(u.to_string()),
                password: Some(b"pw".to_vec()),
            }),
        }
    }

    #[test]
    fn test_pending_sorted_by_packet_id() {
        let tracker = AckTracker::new();
        tracker.insert(publication(9, None));
        tracker.insert(publication(3, None));
        tracker.insert(publication(5, None));
        let ids: Vec<u16> = tracker
            .pending()
            .iter()
            .map(|p| p.publish.packet_id)
            .collect();
        assert_eq!(ids, vec![3, 5, 9]);
        tracker.remove(5);
        assert_eq!(tracker.pending().len(), 2);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let tracker = AckTracker::new();
        tracker.insert(publication(2, Some("bob")));
        tracker.insert(publication(4, None));
        let snapshot = tracker.snapshot();
        let js = serde_json::to_string(&snapshot).unwrap();
        assert!(js.contains(r#""u":"bob""#));
        let back: Vec<NatsPubState> = serde_json::from_str(&js).unwrap();
        assert_eq!(back, snapshot);

        let restored = AckTracker::new();
        restored.restore(back);
        assert_eq!(restored.pending(), tracker.pending());
    }

    #[tokio::test]
    async fn test_ensure_timer_spawns_once() {
        let tracker = AckTracker::new();
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..3 {
            let count = std::sync::Arc::clone(&count);
            tracker.ensure_timer(move || {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(std::future::pending())
            });
        }
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
        tracker.stop_timer();
    }
}
