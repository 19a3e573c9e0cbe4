//! Per-connection handling: the read loop, the batched write loop, and the
//! state machine between them.
//!
//! Each connection runs two tasks. The read task decodes frames, enforces
//! the keep-alive deadline, and dispatches packets; the write task drains a
//! bounded queue in batches of up to its capacity, serializes each batch
//! into one buffer, and issues a single socket write. A DISCONNECT sentinel
//! in the queue makes the writer flush what precedes it and exit.

use crate::bridge::server::BridgeServer;
use crate::error::{MqttError, Result};
use crate::nats::{NatsConnection, NatsMessage};
use crate::packet::{
    self, ConnAckPacket, ConnectPacket, Packet, PublishPacket, QoS, ReturnCode, SubAckPacket,
    SubscribePacket, TopicFilter, UnsubscribePacket,
};
use crate::reply_topic::ReplyTopic;
use crate::session::{AckRelay, AckSubscription, Session};
use crate::topic;
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, error};

/// Packets queued per connection before the producer blocks.
pub const WRITE_QUEUE_SIZE: usize = 1024;

/// Byte stream a connection runs over; TCP and TLS both qualify.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    /// Created, no CONNECT received yet.
    Infant = 0,
    /// Handshake accepted.
    Connected = 1,
    /// Terminal.
    Disconnected = 2,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Infant,
            1 => ClientState::Connected,
            _ => ClientState::Disconnected,
        }
    }
}

/// One MQTT client connection.
pub struct ConnectionHandler {
    server: Arc<BridgeServer>,
    state: AtomicU8,
    session: RwLock<Option<Arc<Session>>>,
    connect: RwLock<Option<ConnectPacket>>,
    nats: RwLock<Option<Arc<dyn NatsConnection>>>,
    /// NATS subject → forwarding task for each MQTT subscription.
    nats_subs: Mutex<HashMap<String, AbortHandle>>,
    write_tx: mpsc::Sender<Packet>,
    session_present: AtomicBool,
    error: Mutex<Option<MqttError>>,
    /// Signalled by the disconnect transition to unpark a blocked read.
    disconnected: Notify,
}

impl ConnectionHandler {
    /// Runs a connection to completion: spawns the write task, drives the
    /// read loop, then tears the connection down.
    pub async fn serve(server: Arc<BridgeServer>, stream: Box<dyn AsyncStream>) {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let handler = Arc::new(ConnectionHandler {
            server,
            state: AtomicU8::new(ClientState::Infant as u8),
            session: RwLock::new(None),
            connect: RwLock::new(None),
            nats: RwLock::new(None),
            nats_subs: Mutex::new(HashMap::new()),
            write_tx,
            session_present: AtomicBool::new(false),
            error: Mutex::new(None),
            disconnected: Notify::new(),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let writer = tokio::spawn(write_loop(write_rx, write_half, Arc::clone(&handler)));
        handler.read_loop(read_half).await;
        let _ = writer.await;
        handler.teardown();
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the CONNECT handshake resumed an existing session.
    #[must_use]
    pub fn session_present(&self) -> bool {
        self.session_present.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.read().expect("session slot").clone()
    }

    fn nats(&self) -> Option<Arc<dyn NatsConnection>> {
        self.nats.read().expect("nats slot").clone()
    }

    /// Enqueues a packet for the write loop. Dropped unless the connection
    /// is in the Connected state; blocks when the queue is full.
    pub async fn queue_for_write(&self, packet: Packet) {
        if self.state() == ClientState::Connected {
            let _ = self.write_tx.send(packet).await;
        }
    }

    /// Moves the connection to Disconnected. Only the caller that performs
    /// the transition publishes the will, enqueues the write-loop sentinel,
    /// records the error, and unparks a blocked read.
    pub async fn set_disconnected(self: &Arc<Self>, err: Option<MqttError>) {
        let previous = self.state.swap(ClientState::Disconnected as u8, Ordering::SeqCst);
        if previous == ClientState::Disconnected as u8 {
            return;
        }

        let will_and_creds = {
            let connect = self.connect.read().expect("connect slot");
            connect
                .as_ref()
                .and_then(|cp| cp.will.clone().map(|w| (w, cp.credentials.clone())))
        };
        if let Some((will, credentials)) = will_and_creds {
            match self.server.publish_will(&will, credentials.as_ref()).await {
                Ok(()) => debug!(client = %self, "will published to {}", will.topic),
                Err(e) => error!(client = %self, "will publication failed: {e}"),
            }
        }

        // The sentinel is never written to the socket; it terminates the
        // write loop once everything queued before it has been flushed.
        let _ = self.write_tx.send(Packet::Disconnect).await;

        if let Some(e) = err {
            *self.error.lock().expect("error slot") = Some(e);
        }
        self.disconnected.notify_waiters();
    }

    async fn read_loop<R: AsyncRead + Unpin>(self: &Arc<Self>, mut reader: R) {
        let mut max_wait: Option<Duration> = None;
        let mut err: Option<MqttError> = None;

        while self.state() != ClientState::Disconnected {
            let frame = tokio::select! {
                frame = read_with_deadline(&mut reader, max_wait) => frame,
                () = self.disconnected.notified() => break,
            };

            let step = match frame {
                Ok((first, body)) => self.handle_frame(first, body, &mut max_wait).await,
                Err(e) => Err(e),
            };
            match step {
                Ok(true) => {}
                Ok(false) => break, // clean disconnect
                Err(e) => {
                    if let MqttError::ConnectRefused(code) = &e {
                        // Answer with the return code instead of silence.
                        self.set_state(ClientState::Connected);
                        self.queue_for_write(Packet::ConnAck(ConnAckPacket::new(false, *code)))
                            .await;
                    }
                    err = Some(e);
                    break;
                }
            }
        }
        self.set_disconnected(err).await;
    }

    /// Decodes and dispatches one frame. Returns `Ok(false)` on a clean
    /// DISCONNECT.
    async fn handle_frame(
        self: &Arc<Self>,
        first: u8,
        body: bytes::Bytes,
        max_wait: &mut Option<Duration>,
    ) -> Result<bool> {
        // Validate the state/type pairing before the body is even parsed.
        let is_connect = (first >> 4) == u8::from(packet::PacketType::Connect);
        match self.state() {
            ClientState::Connected if is_connect => {
                return Err(MqttError::ProtocolViolation("second connect packet".into()));
            }
            ClientState::Infant if !is_connect => {
                return Err(MqttError::ProtocolViolation("not connected".into()));
            }
            _ => {}
        }

        let packet = Packet::decode(first, body)?;
        debug!(client = %self, "received {packet}");
        match packet {
            Packet::Connect(cp) => {
                *max_wait = self.handle_connect(*cp).await?;
            }
            Packet::Publish(pp) => {
                let pp = self.server.handle_retain(pp);
                self.nats_publish(pp).await?;
            }
            Packet::PubAck(id) => {
                self.server.packet_ids().release(id);
                if let (Some(session), Some(nats)) = (self.session(), self.nats()) {
                    session.client_ack_received(id, &nats).await;
                }
            }
            // QoS 2 is not supported; the rest of its handshake is logged
            // on receipt and otherwise ignored.
            Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_) => {}
            Packet::Subscribe(sp) => self.handle_subscribe(sp).await,
            Packet::Unsubscribe(up) => self.handle_unsubscribe(&up).await,
            Packet::PingReq => self.queue_for_write(Packet::PingResp).await,
            Packet::Disconnect => {
                // Normal disconnect: the will is discarded.
                if let Some(cp) = self.connect.write().expect("connect slot").as_mut() {
                    cp.delete_will();
                }
                return Ok(false);
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                debug!(client = %self, "ignoring server-to-client packet from client");
            }
        }
        Ok(true)
    }

    async fn handle_connect(self: &Arc<Self>, cp: ConnectPacket) -> Result<Option<Duration>> {
        let nats = match self.server.nats_connect(cp.credentials.as_ref()).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(client_id = %cp.client_id, "NATS connect failed: {e}");
                return Err(MqttError::ConnectRefused(ReturnCode::ServerUnavailable));
            }
        };
        *self.nats.write().expect("nats slot") = Some(nats);

        let client_id = cp.client_id.clone();
        let clean_session = cp.clean_session;
        let keep_alive = cp.keep_alive;
        *self.connect.write().expect("connect slot") = Some(cp);

        let sessions = self.server.sessions();
        let (session, session_present) = if clean_session {
            debug!(client = %self, "connected with clean session");
            (sessions.create(&client_id), false)
        } else if let Some(existing) = sessions.get(&client_id) {
            debug!(client = %self, "connected using preexisting session");
            (existing, true)
        } else {
            debug!(client = %self, "connected using new session");
            (sessions.create(&client_id), false)
        };
        *self.session.write().expect("session slot") = Some(Arc::clone(&session));
        self.session_present.store(session_present, Ordering::SeqCst);

        self.server.manage_client(self);
        self.set_state(ClientState::Connected);
        self.queue_for_write(Packet::ConnAck(ConnAckPacket::new(
            session_present,
            ReturnCode::Accepted,
        )))
        .await;
        if session_present {
            session.restore_ack_subscriptions(self).await;
            session.resend_client_unack(self).await;
        }

        // Max wait between control packets is 1.5 times the keep alive value
        Ok((keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500)))
    }

    /// Relays a client publish onto NATS per its QoS.
    async fn nats_publish(self: &Arc<Self>, publish: PublishPacket) -> Result<()> {
        let session = self
            .session()
            .ok_or_else(|| MqttError::ProtocolViolation("not connected".into()))?;
        if publish.dup && session.awaits_ack(publish.packet_id) {
            // Already waiting for this one
            return Ok(());
        }
        let nats = self
            .nats()
            .ok_or_else(|| MqttError::ProtocolViolation("not connected".into()))?;

        let subject = topic::to_nats(&publish.topic);
        match publish.qos {
            QoS::AtMostOnce => nats.publish(&subject, &publish.payload).await,
            QoS::AtLeastOnce => {
                let reply_to = ReplyTopic::new(&session, &publish).to_string();
                let subscription = self.subscribe_ack(&reply_to).await?;
                session.ack_requested(publish.packet_id, subscription);
                nats.publish_with_reply(&subject, &reply_to, &publish.payload)
                    .await
            }
            QoS::ExactlyOnce => Err(MqttError::QoS2NotSupported),
        }
    }

    async fn handle_subscribe(self: &Arc<Self>, subscribe: SubscribePacket) {
        let mut return_codes = Vec::with_capacity(subscribe.topics.len());
        for topic_filter in &subscribe.topics {
            match self.nats_subscribe(topic_filter).await {
                Ok(()) => return_codes.push(u8::from(topic_filter.qos).min(1)),
                Err(e) => {
                    error!(client = %self, filter = %topic_filter.filter, "NATS subscribe failed: {e}");
                    return_codes.push(crate::constants::SUBACK_FAILURE);
                }
            }
        }
        self.queue_for_write(Packet::SubAck(SubAckPacket::new(
            subscribe.packet_id,
            return_codes,
        )))
        .await;
        self.server.publish_matching(&subscribe, self).await;
    }

    /// Opens (or replaces) the NATS subscription backing one topic filter
    /// and spawns the task that forwards its messages to the client.
    async fn nats_subscribe(self: &Arc<Self>, topic_filter: &TopicFilter) -> Result<()> {
        let nats = self
            .nats()
            .ok_or_else(|| MqttError::ProtocolViolation("not connected".into()))?;
        let subject = topic::to_nats_subscription(&topic_filter.filter);
        let mut subscription = nats.subscribe(&subject).await?;

        let desired = topic_filter.qos;
        let handler = Arc::clone(self);
        let forwarder = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                handler.nats_response(desired, message).await;
            }
        });

        let old = self
            .nats_subs
            .lock()
            .expect("subscription map")
            .insert(subject, forwarder.abort_handle());
        if let Some(old) = old {
            old.abort();
        }
        Ok(())
    }

    async fn handle_unsubscribe(&self, unsubscribe: &UnsubscribePacket) {
        let mut cancelled = Vec::new();
        {
            let mut subs = self.nats_subs.lock().expect("subscription map");
            for filter in &unsubscribe.filters {
                let subject = topic::to_nats_subscription(filter);
                if let Some(handle) = subs.remove(&subject) {
                    cancelled.push(handle);
                }
            }
        }
        for handle in cancelled {
            handle.abort();
        }
        self.queue_for_write(Packet::UnsubAck(unsubscribe.packet_id))
            .await;
    }

    /// Turns a NATS delivery into a client publish.
    ///
    /// When the subscription wants QoS > 0 and the message carries a reply
    /// subject, the packet id and flags are taken from the reply subject if
    /// it parses (a peer bridge already encoded MQTT context there) and
    /// freshly allocated otherwise.
    async fn nats_response(self: &Arc<Self>, desired: QoS, message: NatsMessage) {
        let (packet_id, flags) = match &message.reply {
            Some(reply) if desired > QoS::AtMostOnce => match ReplyTopic::parse(reply) {
                Some(parsed) => (parsed.packet_id(), parsed.flags()),
                None => (self.server.packet_ids().allocate(), 0x02), // QoS 1
            },
            _ => (0, 0),
        };
        let publish = match PublishPacket::from_flags(
            packet_id,
            topic::from_nats(&message.subject),
            flags,
            message.payload,
            message.reply,
        ) {
            Ok(publish) => publish,
            Err(e) => {
                error!(client = %self, "dropping NATS message: {e}");
                return;
            }
        };
        let qos = desired.min(publish.qos);
        self.publish_response(qos, publish).await;
    }

    fn teardown(&self) {
        if let Some(e) = self.error.lock().expect("error slot").take() {
            error!(client = %self, "{e}");
        }
        let connect = self.connect.read().expect("connect slot").clone();
        match connect {
            None => debug!("client connection could not be established"),
            Some(cp) => {
                debug!(client_id = %cp.client_id, "disconnected");
                if cp.clean_session {
                    self.server.sessions().remove(&cp.client_id);
                }
            }
        }
        for (_, handle) in self.nats_subs.lock().expect("subscription map").drain() {
            handle.abort();
        }
        *self.nats.write().expect("nats slot") = None;
        self.server.unmanage_client(self);
    }
}

impl ConnectionHandler {
    /// Delivers a publish to the client in response to a subscription,
    /// recording it as awaiting the client's ack first when `qos > 0`.
    pub async fn publish_response(&self, qos: QoS, publish: PublishPacket) {
        if qos > QoS::AtMostOnce {
            if let Some(session) = self.session() {
                session.client_ack_requested(publish.clone());
            }
        }
        self.queue_for_write(Packet::Publish(publish)).await;
    }
}

#[async_trait]
impl AckRelay for Arc<ConnectionHandler> {
    async fn publish_response(&self, qos: QoS, publish: PublishPacket) {
        ConnectionHandler::publish_response(self, qos, publish).await;
    }

    async fn subscribe_ack(&self, reply_subject: &str) -> Result<AckSubscription> {
        let nats = self
            .nats()
            .ok_or_else(|| MqttError::ProtocolViolation("not connected".into()))?;
        let mut subscription = nats.subscribe(reply_subject).await?;

        let handler = Arc::clone(self);
        let listener = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                // The originating client may already be gone, so the session
                // is resolved from the subject, not from this connection.
                let Some(reply) = ReplyTopic::parse(&message.subject) else {
                    continue;
                };
                let Some(session) = handler.server.sessions().get(reply.client_id()) else {
                    continue;
                };
                if session.id() != reply.session_id() {
                    continue;
                }
                let pending = session.ack_received(reply.packet_id());
                handler
                    .queue_for_write(Packet::PubAck(reply.packet_id()))
                    .await;
                if let Some(pending) = pending {
                    // Cancels this listener too; nothing may follow.
                    pending.cancel();
                    break;
                }
            }
        });
        Ok(AckSubscription::new(reply_subject, listener.abort_handle()))
    }
}

impl fmt::Display for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connect.read().expect("connect slot").as_ref() {
            Some(cp) => write!(f, "Client {}", cp.client_id),
            None => f.write_str("Client (not connected)"),
        }
    }
}

async fn read_with_deadline<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_wait: Option<Duration>,
) -> Result<(u8, bytes::Bytes)> {
    match max_wait {
        Some(deadline) => match timeout(deadline, packet::read_frame(reader)).await {
            Ok(result) => result,
            Err(_) => Err(MqttError::KeepAliveTimeout),
        },
        None => packet::read_frame(reader).await,
    }
}

/// Drains the write queue in batches: each wake pulls up to the queue
/// capacity, serializes the batch into one buffer, and issues a single
/// socket write. The DISCONNECT sentinel flushes what was serialized before
/// it and ends the loop.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut rx: mpsc::Receiver<Packet>,
    mut writer: W,
    handler: Arc<ConnectionHandler>,
) {
    let mut bulk: Vec<Packet> = Vec::with_capacity(WRITE_QUEUE_SIZE);
    let mut buf = BytesMut::with_capacity(4096);
    let mut connected = true;

    while connected {
        bulk.clear();
        if rx.recv_many(&mut bulk, WRITE_QUEUE_SIZE).await == 0 {
            break;
        }
        buf.clear();
        for packet in bulk.drain(..) {
            if packet == Packet::Disconnect {
                connected = false;
                break;
            }
            debug!(client = %handler, "sending {packet}");
            if let Err(e) = packet.encode(&mut buf) {
                error!(client = %handler, "dropping unencodable packet: {e}");
            }
        }
        if !buf.is_empty() {
            if let Err(e) = writer.write_all(&buf).await {
                if connected {
                    handler.set_disconnected(Some(e.into())).await;
                } else {
                    // Drain failed. Log the error.
                    error!(client = %handler, "flush on disconnect failed: {e}");
                }
                break;
            }
        }
    }
}
