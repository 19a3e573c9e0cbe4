//! The bridge server: TCP/TLS accept loop, worker-pool dispatch, shutdown,
//! and the glue between connections, sessions, the retained store, and the
//! NATS backhaul.

use crate::bridge::ack_tracker::{AckTracker, NatsPub};
use crate::bridge::config::BridgeConfig;
use crate::bridge::connection::{AsyncStream, ConnectionHandler};
use crate::bridge::persistence::{self, BridgeState};
use crate::bridge::retained::{encode_retain_response, RetainedStore};
use crate::bridge::tls;
use crate::error::{MqttError, Result};
use crate::nats::{AsyncNatsConnector, NatsConnection, NatsConnector};
use crate::packet::{Credentials, PublishPacket, QoS, SubscribePacket, Will};
use crate::packet_id::IdManager;
use crate::reply_topic::ReplyTopic;
use crate::session::{AckRelay, Session, SessionManager};
use crate::topic;
use chrono::Utc;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Initial number of connection workers; also the growth and shrink factor.
const WORKER_GROWTH: usize = 10;

/// Connections queued between accept and worker pickup.
const INCOMING_QUEUE_SIZE: usize = 20;

/// More workers are deployed when fewer than this many are free.
const MIN_FREE_WORKERS: usize = 3;

/// How long a republish waits for its NATS reply.
const ACK_REPLY_WAIT: Duration = Duration::from_secs(2);

/// Grace period between the shutdown signal and completion.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The process-wide bridge state: owns all sessions, retained messages, and
/// in-flight acknowledgment tracking. Constructed once, torn down in
/// shutdown.
pub struct BridgeServer {
    config: BridgeConfig,
    packet_ids: IdManager,
    sessions: SessionManager,
    retained: RetainedStore,
    ack_tracker: AckTracker,
    connector: Arc<dyn NatsConnector>,
    /// The server's own session, the identity for server-originated
    /// publishes such as wills.
    session: RwLock<Arc<Session>>,
    /// Long-lived connection for the bridge's own traffic.
    server_nats: tokio::sync::Mutex<Option<Arc<dyn NatsConnection>>>,
    clients: Mutex<Vec<Arc<ConnectionHandler>>>,
    retained_handler: Mutex<Option<AbortHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    ready: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl BridgeServer {
    /// Creates a bridge using the production NATS connector.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration or an unreadable state
    /// file.
    pub async fn with_config(config: BridgeConfig) -> Result<Arc<Self>> {
        let connector = Arc::new(AsyncNatsConnector::new(
            config.nats_urls.clone(),
            config.nats_credentials.clone(),
        ));
        Self::new(config, connector).await
    }

    /// Creates a bridge over an explicit NATS connector. State is reloaded
    /// from the configured storage path when the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration or an unreadable state
    /// file; a missing file is fine.
    pub async fn new(config: BridgeConfig, connector: Arc<dyn NatsConnector>) -> Result<Arc<Self>> {
        config.validate()?;
        let sessions = SessionManager::new();
        let session = sessions.create(&format!("mqtt-nats-{}", Uuid::new_v4().simple()));
        let server = Arc::new(Self {
            config,
            packet_ids: IdManager::new(),
            sessions,
            retained: RetainedStore::new(),
            ack_tracker: AckTracker::new(),
            connector,
            session: RwLock::new(session),
            server_nats: tokio::sync::Mutex::new(None),
            clients: Mutex::new(Vec::new()),
            retained_handler: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown: watch::channel(false).0,
            ready: watch::channel(false).0,
            done: watch::channel(false).0,
        });
        if let Some(path) = server.config.storage_path.clone() {
            server.load(&path).await?;
        }
        Ok(server)
    }

    #[must_use]
    pub fn packet_ids(&self) -> &IdManager {
        &self.packet_ids
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The server's own session.
    #[must_use]
    pub fn session(&self) -> Arc<Session> {
        self.session.read().expect("server session").clone()
    }

    /// The address the listener is bound to, once serving.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr")
    }

    /// Resolves once the listener is accepting connections.
    pub async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        while !*ready.borrow_and_update() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    /// Opens a NATS connection scoped to the given credentials; without
    /// credentials the bridge's own configuration applies.
    pub async fn nats_connect(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn NatsConnection>> {
        self.connector.connect(credentials).await
    }

    /// The bridge's own long-lived NATS connection, opened on first use.
    async fn server_nats_conn(&self) -> Result<Arc<dyn NatsConnection>> {
        let mut slot = self.server_nats.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }
        let conn = self.nats_connect(None).await?;
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Applies retained semantics to a publish: an empty payload with the
    /// retain bit drops the topic (and clears the bit), anything else with
    /// the bit set is stored.
    pub fn handle_retain(&self, mut publish: PublishPacket) -> PublishPacket {
        if publish.retain {
            if publish.payload.is_empty() {
                if self.retained.drop_topic(&publish.topic) {
                    debug!("deleted retained message {publish}");
                }
                publish.reset_retain();
            } else if self.retained.add(publish.clone()) {
                debug!("added retained message {publish}");
            }
        }
        publish
    }

    /// Forwards retained messages matching the subscription to the client.
    pub async fn publish_matching(&self, subscribe: &SubscribePacket, client: &dyn AckRelay) {
        self.retained.publish_matching(subscribe, client).await;
    }

    /// Publishes a disconnected client's will under that client's
    /// credentials. Retained wills enter the retained store; QoS-1 wills are
    /// tracked and republished until some NATS responder acknowledges them.
    pub async fn publish_will(
        self: &Arc<Self>,
        will: &Will,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let packet_id = if will.qos > QoS::AtMostOnce {
            self.packet_ids.allocate()
        } else {
            0
        };
        let mut publish = PublishPacket::new(
            packet_id,
            &will.topic,
            will.message.clone(),
            will.qos,
            will.retain,
            false,
        );

        // Temporary connection under the client's credentials.
        let nats = self.nats_connect(credentials).await?;
        let subject = topic::to_nats(&will.topic);
        if will.qos == QoS::AtMostOnce {
            nats.publish(&subject, &will.message).await?;
        } else {
            let reply_to = ReplyTopic::new(&self.session(), &publish).to_string();
            nats.publish_with_reply(&subject, &reply_to, &will.message)
                .await?;
        }

        if will.retain {
            self.handle_retain(publish);
        } else if will.qos > QoS::AtMostOnce {
            publish.set_dup();
            self.track_ack_received(publish, credentials.cloned());
        }
        Ok(())
    }

    /// Tracks a server-originated QoS-1 publish until a NATS reply arrives.
    pub fn track_ack_received(
        self: &Arc<Self>,
        publish: PublishPacket,
        credentials: Option<Credentials>,
    ) {
        debug!("track {publish}");
        self.ack_tracker.insert(NatsPub {
            publish,
            credentials,
        });
        self.start_republisher();
    }

    fn start_republisher(self: &Arc<Self>) {
        let server = Arc::downgrade(self);
        let rate = Duration::from_millis(self.config.repeat_rate.max(1));
        self.ack_tracker.ensure_timer(move || {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(rate);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await; // the immediate first tick
                loop {
                    ticker.tick().await;
                    let Some(server) = Weak::upgrade(&server) else {
                        return;
                    };
                    let pending = server.ack_tracker.pending();
                    if pending.is_empty() {
                        return;
                    }
                    for publication in pending {
                        server.republish(&publication).await;
                    }
                }
            })
        });
    }

    async fn republish(self: &Arc<Self>, publication: &NatsPub) {
        if let Err(e) = self.try_republish(publication).await {
            error!("republish failed: {e}");
        }
    }

    async fn try_republish(self: &Arc<Self>, publication: &NatsPub) -> Result<()> {
        // A publication with credentials gets a temporary connection that
        // closes on return; without credentials the server connection is
        // reused.
        let nats = match &publication.credentials {
            None => self.server_nats_conn().await?,
            Some(credentials) => self.nats_connect(Some(credentials)).await?,
        };
        let publish = &publication.publish;
        let reply_to = ReplyTopic::new(&self.session(), publish).to_string();
        let mut subscription = nats.subscribe(&reply_to).await?;
        debug!("republish {publish}");
        nats.publish_with_reply(&topic::to_nats(&publish.topic), &reply_to, &publish.payload)
            .await?;
        match timeout(ACK_REPLY_WAIT, subscription.recv()).await {
            Ok(Some(_)) => {
                debug!("ack {}", publish.packet_id);
                self.ack_tracker.remove(publish.packet_id);
            }
            // No reply yet; the next tick republishes.
            Ok(None) | Err(_) => {}
        }
        Ok(())
    }

    /// Registers a client so shutdown can force-disconnect it.
    pub fn manage_client(&self, client: &Arc<ConnectionHandler>) {
        self.clients
            .lock()
            .expect("client list")
            .push(Arc::clone(client));
    }

    /// Removes a client from the managed list.
    pub fn unmanage_client(&self, client: &ConnectionHandler) {
        self.clients
            .lock()
            .expect("client list")
            .retain(|c| !std::ptr::eq(c.as_ref(), client));
    }

    /// Runs one connection to completion on the calling task.
    pub async fn serve_client(self: &Arc<Self>, stream: Box<dyn AsyncStream>) {
        ConnectionHandler::serve(Arc::clone(self), stream).await;
    }

    async fn serve_tcp_client(self: &Arc<Self>, stream: TcpStream, tls: Option<TlsAcceptor>) {
        match tls {
            None => self.serve_client(Box::new(stream)).await,
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => self.serve_client(Box::new(stream)).await,
                Err(e) => error!("TLS handshake failed: {e}"),
            },
        }
    }

    /// Accepts and serves connections until [`shutdown`](Self::shutdown) is
    /// called, then drains clients, persists state, and returns.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot be bound, the retained
    /// request handler cannot subscribe, or the final persist fails.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        self.config.validate()?;
        self.shutdown.send_replace(false);
        self.done.send_replace(false);

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().expect("local addr") = Some(addr);
        info!("MQTT bridge listening on {addr}");

        let tls_acceptor = match &self.config.tls {
            Some(tls_config) => Some(tls::build_acceptor(tls_config).await?),
            None => None,
        };

        if !self.config.retained_request_topic.is_empty() {
            self.start_retained_request_handler().await?;
        }

        let (incoming_tx, incoming_rx) = mpsc::channel::<TcpStream>(INCOMING_QUEUE_SIZE);
        let incoming_rx = Arc::new(tokio::sync::Mutex::new(incoming_rx));
        let free_workers = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();
        self.deploy_more_workers(&mut workers, &incoming_rx, &free_workers, tls_acceptor.clone());

        self.ready.send_replace(true);
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if free_workers.load(Ordering::SeqCst) < MIN_FREE_WORKERS {
                            // Workers have a hard time keeping up.
                            self.deploy_more_workers(
                                &mut workers,
                                &incoming_rx,
                                &free_workers,
                                tls_acceptor.clone(),
                            );
                        }
                        if incoming_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("accept failed: {e}"),
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        self.ready.send_replace(false);
        drop(listener);
        drop(incoming_tx);
        self.drain_and_shutdown(workers).await
    }

    fn deploy_more_workers(
        self: &Arc<Self>,
        workers: &mut JoinSet<()>,
        incoming: &Arc<tokio::sync::Mutex<mpsc::Receiver<TcpStream>>>,
        free_workers: &Arc<AtomicUsize>,
        tls: Option<TlsAcceptor>,
    ) {
        for _ in 0..WORKER_GROWTH {
            let server = Arc::clone(self);
            let incoming = Arc::clone(incoming);
            let free = Arc::clone(free_workers);
            let tls = tls.clone();
            workers.spawn(async move {
                free.fetch_add(1, Ordering::SeqCst);
                loop {
                    let stream = { incoming.lock().await.recv().await };
                    let Some(stream) = stream else {
                        break;
                    };
                    free.fetch_sub(1, Ordering::SeqCst);
                    server.serve_tcp_client(stream, tls.clone()).await;
                    if free.load(Ordering::SeqCst) > WORKER_GROWTH {
                        // Excess free workers; this one exits.
                        return;
                    }
                    free.fetch_add(1, Ordering::SeqCst);
                }
                free.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn drain_and_shutdown(self: &Arc<Self>, mut workers: JoinSet<()>) -> Result<()> {
        debug!("waiting for clients to drain");
        let clients: Vec<_> = self.clients.lock().expect("client list").drain(..).collect();
        for client in clients {
            client.set_disconnected(None).await;
        }
        while workers.join_next().await.is_some() {}
        debug!("client drain complete");

        self.ack_tracker.stop_timer();
        if let Some(handle) = self.retained_handler.lock().expect("retained handler").take() {
            handle.abort();
        }
        *self.server_nats.lock().await = None;

        let result = match &self.config.storage_path {
            Some(path) => self.persist(path).await,
            None => Ok(()),
        };
        self.done.send_replace(true);
        result
    }

    /// Signals shutdown and waits up to the grace period for completion.
    ///
    /// # Errors
    ///
    /// Returns `MqttError::ShutdownTimeout` when the bridge does not finish
    /// within the grace period.
    pub async fn shutdown(&self) -> Result<()> {
        let mut done = self.done.subscribe();
        self.shutdown.send_replace(true);
        let wait = async {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        };
        timeout(SHUTDOWN_GRACE, wait)
            .await
            .map_err(|_| MqttError::ShutdownTimeout)
    }

    /// Shuts down, reloads persisted state, and serves again.
    ///
    /// # Errors
    ///
    /// Propagates shutdown, reload, and serve failures.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.shutdown().await?;
        if let Some(path) = self.config.storage_path.clone() {
            self.load(&path).await?;
        }
        self.serve().await
    }

    async fn start_retained_request_handler(self: &Arc<Self>) -> Result<()> {
        let nats = self.server_nats_conn().await?;
        let mut subscription = nats.subscribe(&self.config.retained_request_topic).await?;
        let server = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let Some(server) = Weak::upgrade(&server) else {
                    return;
                };
                let Some(reply) = &message.reply else {
                    continue;
                };
                let matched = server
                    .retained
                    .messages_matching_retain_request(&message.payload);
                let body = encode_retain_response(&matched);
                match server.server_nats_conn().await {
                    Ok(nats) => {
                        if let Err(e) = nats.publish(reply, &body).await {
                            error!("NATS publish of retained messages failed: {e}");
                        }
                    }
                    Err(e) => error!("NATS publish of retained messages failed: {e}"),
                }
            }
        });
        *self.retained_handler.lock().expect("retained handler") = Some(task.abort_handle());
        Ok(())
    }

    async fn load(self: &Arc<Self>, path: &Path) -> Result<()> {
        let Some(state) = persistence::load(path).await? else {
            return Ok(());
        };
        self.packet_ids.restore(&state.idm);
        self.sessions.restore(state.sm);
        self.retained.restore(state.retained);
        if !state.id.is_empty() {
            if let Some(session) = self.sessions.get(&state.id) {
                *self.session.write().expect("server session") = session;
            }
        }
        if !state.pubacks.is_empty() {
            self.ack_tracker.restore(state.pubacks);
            self.start_republisher();
        }
        Ok(())
    }

    async fn persist(&self, path: &Path) -> Result<()> {
        let state = BridgeState {
            ts: Utc::now().to_rfc3339(),
            id: self.session().client_id().to_string(),
            idm: self.packet_ids.snapshot(),
            sm: self.sessions.snapshot(),
            retained: self.retained.snapshot(),
            pubacks: self.ack_tracker.snapshot(),
        };
        persistence::save(path, &state).await
    }
}
