//! The retained-message index.
//!
//! A topic-keyed map of the most recent retained publish per topic, plus an
//! insertion-order list so that snapshots and matched replay are
//! deterministic. NATS clients can query the store through the
//! retained-request subject; the response encoding lives here too.

use crate::packet::{PublishPacket, QoS, SubscribePacket, TopicFilter};
use crate::session::AckRelay;
use crate::topic::{self, CompiledFilter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Index {
    messages: HashMap<String, PublishPacket>,
    /// Topics in insertion order. Invariant: same key set as `messages`.
    order: Vec<String>,
}

/// Ordered map from topic name to its retained publish.
#[derive(Debug, Default)]
pub struct RetainedStore {
    index: RwLock<Index>,
}

impl RetainedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().expect("retained lock").order.is_empty()
    }

    /// Inserts or overwrites by topic. Returns true when the topic was new.
    pub fn add(&self, publish: PublishPacket) -> bool {
        let mut index = self.index.write().expect("retained lock");
        let topic = publish.topic.clone();
        let new = index.messages.insert(topic.clone(), publish).is_none();
        if new {
            index.order.push(topic);
        }
        new
    }

    /// Removes the topic. Returns true when it was present.
    pub fn drop_topic(&self, topic: &str) -> bool {
        let mut index = self.index.write().expect("retained lock");
        if index.messages.remove(topic).is_none() {
            return false;
        }
        index.order.retain(|t| t != topic);
        true
    }

    /// Returns the retained messages matching the given filters along with
    /// the QoS each should be delivered at: the minimum of the retained QoS
    /// and the desired QoS, with 2 clamped to 1.
    ///
    /// Order: for each input filter in input order, all matching topics in
    /// insertion order.
    #[must_use]
    pub fn matching_messages(&self, filters: &[TopicFilter]) -> Vec<(PublishPacket, QoS)> {
        let compiled: Vec<(CompiledFilter, QoS)> = filters
            .iter()
            .map(|f| (CompiledFilter::new(&f.filter), f.qos))
            .collect();

        let index = self.index.read().expect("retained lock");
        let mut out = Vec::new();
        for (filter, desired) in &compiled {
            for topic in &index.order {
                if filter.matches(topic) {
                    let publish = index.messages[topic].clone();
                    let qos = clamp_qos(publish.qos.min(*desired));
                    out.push((publish, qos));
                }
            }
        }
        out
    }

    /// Forwards every retained message matching the subscription to the
    /// client, each at its clamped QoS.
    pub async fn publish_matching(&self, subscribe: &SubscribePacket, client: &dyn AckRelay) {
        for (mut publish, qos) in self.matching_messages(&subscribe.topics) {
            publish.qos = qos;
            client.publish_response(qos, publish).await;
        }
    }

    /// Answers a retained-request: the body is a comma-separated list of
    /// NATS-form subscriptions, each optionally suffixed `/0`, `/1` or `/2`
    /// to pin the desired QoS.
    #[must_use]
    pub fn messages_matching_retain_request(&self, body: &[u8]) -> Vec<(PublishPacket, QoS)> {
        let body = String::from_utf8_lossy(body);
        let filters: Vec<TopicFilter> = body
            .split(',')
            .map(|nats_filter| {
                let (name, qos) = match nats_filter
                    .rsplit_once('/')
                    .and_then(|(head, tail)| match tail {
                        "0" => Some((head, QoS::AtMostOnce)),
                        "1" => Some((head, QoS::AtLeastOnce)),
                        "2" => Some((head, QoS::ExactlyOnce)),
                        _ => None,
                    }) {
                    Some((head, qos)) if !head.is_empty() => (head, qos),
                    _ => (nats_filter, QoS::AtMostOnce),
                };
                TopicFilter {
                    filter: topic::from_nats_subscription(name),
                    qos,
                }
            })
            .collect();
        self.matching_messages(&filters)
    }

    #[must_use]
    pub fn snapshot(&self) -> RetainedState {
        let index = self.index.read().expect("retained lock");
        RetainedState(
            index
                .order
                .iter()
                .map(|t| (t.clone(), index.messages[t].clone()))
                .collect(),
        )
    }

    pub fn restore(&self, state: RetainedState) {
        let mut index = self.index.write().expect("retained lock");
        index.messages.clear();
        index.order.clear();
        for (topic, publish) in state.0 {
            if index.messages.insert(topic.clone(), publish).is_none() {
                index.order.push(topic);
            }
        }
    }
}

fn clamp_qos(qos: QoS) -> QoS {
    if qos == QoS::ExactlyOnce {
        QoS::AtLeastOnce
    } else {
        qos
    }
}

/// Snapshot form: a JSON object mapping topic to publish, keys in insertion
/// order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetainedState(pub Vec<(String, PublishPacket)>);

impl RetainedState {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for RetainedState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (topic, publish) in &self.0 {
            map.serialize_entry(topic, publish)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RetainedState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = RetainedState;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of topic to retained publish")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((topic, publish)) =
                    access.next_entry::<String, PublishPacket>()?
                {
                    entries.push((topic, publish));
                }
                Ok(RetainedState(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Encodes the retained-request response: a JSON array of
/// `{"subject": .., "payload": ..}` objects, the payload encoded literally
/// when every byte is printable ASCII (32-127) and base64 under
/// `"payloadEnc"` otherwise.
#[must_use]
pub fn encode_retain_response(messages: &[(PublishPacket, QoS)]) -> Vec<u8> {
    #[derive(Serialize)]
    struct Entry<'a> {
        subject: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a str>,
        #[serde(rename = "payloadEnc", skip_serializing_if = "Option::is_none")]
        payload_enc: Option<String>,
    }

    let entries: Vec<Entry<'_>> = messages
        .iter()
        .map(|(publish, _)| {
            let printable = publish
                .payload
                .iter()
                .all(|&b| (32..=127).contains(&b));
            let (payload, payload_enc) = if printable {
                (std::str::from_utf8(&publish.payload).ok(), None)
            } else {
                (None, Some(BASE64.encode(&publish.payload)))
            };
            Entry {
                subject: topic::to_nats(&publish.topic),
                payload,
                payload_enc,
            }
        })
        .collect();

    serde_json::to_vec(&entries).expect("retain response encoding")
}
