//! MQTT 3.1.1 broker (mqtt3d).
//!
//! The broker opens the configured listeners (TCP / TLS / WebSocket /
//! WebSocket over TLS), drives the CONNECT exchange for every accepted
//! connection, applies the session policy including takeover, and routes
//! published messages through the subscription trie.
//!
//! All broker-wide state lives in one [`Shared`] value constructed at
//! startup; there are no module-level globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config::{BrokerConfig, ListenerConfig, ListenerKind};
use crate::error::{Error, Result};
use crate::handler::{ClientHandler, EndReason};
use crate::plugin::{
    AuthContext, BrokerEvent, Plugin, PluginBus, StaticAuthPlugin, TopicAclPlugin, TopicAction,
};
use crate::protocol::{self, v4, Packet};
use crate::session::{CloseReason, ConnectedHandle, SessionStore};
use crate::sys::BrokerMetrics;
use crate::transport::{BoxStream, TlsAcceptorConfig, Transport};
use crate::trie::{RetainedStore, Trie};
use crate::types::{ConnectReturnCode, Message, QoS};

/// Callback type alias.
type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// One subscription edge in the trie.
#[derive(Debug, Clone)]
pub(crate) struct SubscriberEntry {
    pub client_id: String,
    pub max_qos: QoS,
}

/// Broker-wide shared state.
pub(crate) struct Shared {
    pub config: BrokerConfig,
    pub sessions: SessionStore,
    pub subscriptions: Trie<SubscriberEntry>,
    pub retained: RetainedStore,
    pub metrics: BrokerMetrics,
    pub plugins: Arc<PluginBus>,
    pub on_client_connected: Option<Callback>,
    pub on_client_disconnected: Option<Callback>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    /// Insert or replace a subscription; returns the granted QoS.
    pub fn subscribe(&self, client_id: &str, filter: &str, qos: QoS) -> Result<QoS> {
        self.subscriptions.with_mut(|root| {
            root.set(filter, |node| {
                let values = node.values_mut();
                if let Some(entry) = values.iter_mut().find(|e| e.client_id == client_id) {
                    entry.max_qos = qos;
                } else {
                    values.push(SubscriberEntry {
                        client_id: client_id.to_string(),
                        max_qos: qos,
                    });
                }
            })
        })?;
        Ok(qos)
    }

    /// Remove a subscription edge; prunes empty branches.
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        self.subscriptions
            .remove(filter, |e| e.client_id == client_id)
    }

    /// Purge all trie edges of a destroyed session.
    pub fn purge_subscriptions(&self, client_id: &str, filters: &[String]) {
        for filter in filters {
            self.subscriptions
                .remove(filter, |e| e.client_id == client_id);
        }
    }

    /// Route an application message: update the retained store, then fan
    /// out to every matching session at `min(msg.qos, granted)`.
    ///
    /// The retained store is updated before the caller acknowledges the
    /// PUBLISH.
    pub async fn route(&self, source: &str, msg: Message) {
        trace!(source, topic = %msg.topic, qos = ?msg.qos, "routing message");
        if msg.retain {
            // Store (or clear, for an empty payload) before the publish
            // is acknowledged; the clear still reaches live subscribers
            // as a normal message.
            self.retained.update(&msg);
        }

        // A session matched by several filters receives the message once,
        // at the maximum granted QoS.
        let mut targets: HashMap<String, QoS> = HashMap::new();
        for entry in self.subscriptions.collect(&msg.topic) {
            targets
                .entry(entry.client_id)
                .and_modify(|q| *q = (*q).max(entry.max_qos))
                .or_insert(entry.max_qos);
        }

        for (client_id, max_qos) in targets {
            if !self
                .plugins
                .check_topic(&client_id, &msg.topic, TopicAction::Receive)
                .await
            {
                trace!(client_id, topic = %msg.topic, "receive denied by topic filter");
                continue;
            }

            let Some(session) = self.sessions.get(&client_id) else {
                continue;
            };

            let mut delivery = msg.clone();
            delivery.qos = msg.qos.min(max_qos);
            // The retain flag is only set on retained replay, not on
            // live fan-out.
            delivery.retain = false;

            let tx = {
                let guard = session.lock();
                guard.connected.as_ref().map(|h| Arc::clone(&h.tx))
            };

            match tx {
                Some(tx) => {
                    if delivery.qos == QoS::AtMostOnce {
                        // QoS 0 on a full queue is dropped, counted.
                        if tx.try_send(delivery).is_err() {
                            self.metrics.message_dropped();
                            trace!(client_id, source, "queue full, dropped qos 0 delivery");
                        }
                    } else if tx.send(delivery.clone()).await.is_err() {
                        // Handler went away mid-send; fall back to the
                        // offline queue of a persistent session.
                        let mut guard = session.lock();
                        if !guard.clean_session {
                            guard.queue_message(delivery, self.config.max_queued_messages);
                        }
                    }
                }
                None => {
                    let mut guard = session.lock();
                    if !guard.clean_session && delivery.qos > QoS::AtMostOnce {
                        guard.queue_message(delivery, self.config.max_queued_messages);
                    }
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Publish the `$SYS` client connected event.
    /// Topic: `$SYS/broker/clients/{client_id}/connected`
    async fn publish_sys_connected(
        &self,
        client_id: &str,
        username: &str,
        peer: std::net::SocketAddr,
        keepalive: u16,
    ) {
        if self.config.sys_interval == 0 {
            return;
        }

        let event = SysConnectedEvent {
            clientid: client_id,
            username,
            ipaddress: peer.ip().to_string(),
            proto_ver: 4,
            keepalive,
            connected_at: unix_now(),
        };
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(client_id, error = %e, "failed to serialize $SYS connected event");
                return;
            }
        };

        let topic = format!("$SYS/broker/clients/{client_id}/connected");
        self.route("$sys", Message::new(topic, Bytes::from(payload)))
            .await;
    }

    /// Publish the `$SYS` client disconnected event.
    /// Topic: `$SYS/broker/clients/{client_id}/disconnected`
    async fn publish_sys_disconnected(&self, client_id: &str, reason: &str) {
        if self.config.sys_interval == 0 {
            return;
        }

        let event = SysDisconnectedEvent {
            clientid: client_id,
            reason,
            disconnected_at: unix_now(),
        };
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(client_id, error = %e, "failed to serialize $SYS disconnected event");
                return;
            }
        };

        let topic = format!("$SYS/broker/clients/{client_id}/disconnected");
        self.route("$sys", Message::new(topic, Bytes::from(payload)))
            .await;
    }
}

/// `$SYS` client connected event payload.
#[derive(Serialize)]
struct SysConnectedEvent<'a> {
    clientid: &'a str,
    username: &'a str,
    ipaddress: String,
    proto_ver: u8,
    keepalive: u16,
    connected_at: u64,
}

/// `$SYS` client disconnected event payload.
#[derive(Serialize)]
struct SysDisconnectedEvent<'a> {
    clientid: &'a str,
    reason: &'a str,
    disconnected_at: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Builder for [`Broker`].
pub struct BrokerBuilder {
    config: BrokerConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    on_client_connected: Option<Callback>,
    on_client_disconnected: Option<Callback>,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            plugins: Vec::new(),
            on_client_connected: None,
            on_client_disconnected: None,
        }
    }

    /// Register a plugin on the event/filter bus.
    pub fn plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Set a callback invoked when a client connects.
    pub fn on_client_connected<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_client_connected = Some(Arc::new(f));
        self
    }

    /// Set a callback invoked when a client disconnects.
    pub fn on_client_disconnected<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_client_disconnected = Some(Arc::new(f));
        self
    }

    /// Build the broker, registering the packaged plugins the
    /// configuration asks for.
    pub fn build(self) -> Broker {
        let mut bus = PluginBus::new(
            self.config.plugin_call_timeout(),
            self.config.auth.allow_anonymous,
        );

        if !self.config.auth.users.is_empty() || !self.config.auth.allow_anonymous {
            bus.register(Arc::new(StaticAuthPlugin::new(&self.config.auth)));
        }
        if self.config.topic_check.enabled {
            bus.register(Arc::new(TopicAclPlugin::new(&self.config.topic_check)));
        }
        for plugin in self.plugins {
            bus.register(plugin);
        }

        let (shutdown_tx, _) = watch::channel(false);

        Broker {
            shared: Arc::new(Shared {
                config: self.config,
                sessions: SessionStore::new(),
                subscriptions: Trie::new(),
                retained: RetainedStore::new(),
                metrics: BrokerMetrics::new(),
                plugins: Arc::new(bus),
                on_client_connected: self.on_client_connected,
                on_client_disconnected: self.on_client_disconnected,
                running: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }
}

/// MQTT 3.1.1 broker.
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    /// Create a broker with the given config and no extra plugins.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Run the broker: bind every configured listener and accept
    /// connections until [`Broker::shutdown`] is called.
    pub async fn serve(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        if self.shared.config.listeners.is_empty() {
            return Err(Error::InvalidConfig("no listeners configured".to_string()));
        }

        self.shared.plugins.fire(BrokerEvent::BrokerPreStart).await;

        for (name, listener) in &self.shared.config.listeners {
            let acceptor = match &listener.ssl {
                Some(tls) => Some(TlsAcceptorConfig::from_pem_files(
                    &tls.certfile,
                    &tls.keyfile,
                    tls.cafile.as_deref(),
                )?),
                None => None,
            };
            let tcp = TcpListener::bind(&listener.bind).await?;
            info!(
                listener = name.as_str(),
                bind = listener.bind.as_str(),
                kind = ?listener.kind,
                tls = acceptor.is_some(),
                "listening"
            );

            tokio::spawn(accept_loop(
                Arc::clone(&self.shared),
                name.clone(),
                listener.clone(),
                tcp,
                acceptor,
            ));
        }

        if self.shared.config.sys_interval > 0 {
            tokio::spawn(sys_loop(
                Arc::clone(&self.shared),
                Duration::from_secs(self.shared.config.sys_interval),
            ));
        }

        self.shared.plugins.fire(BrokerEvent::BrokerPostStart).await;

        // Park until shutdown.
        let mut shutdown = self.shared.shutdown_rx();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Graceful shutdown: stop accepting, close every handler with
    /// `ServerShutdown`, wait up to the configured grace period for
    /// writer queues to drain, then return.
    pub async fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("broker shutting down");
        self.shared
            .plugins
            .fire(BrokerEvent::BrokerPreShutdown)
            .await;

        let _ = self.shared.shutdown_tx.send(true);

        for session in self.shared.sessions.iter() {
            let close_tx = {
                let guard = session.lock();
                guard.connected.as_ref().map(|h| h.close_tx.clone())
            };
            if let Some(close_tx) = close_tx {
                let _ = close_tx.try_send(CloseReason::ServerShutdown);
            }
        }

        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_grace();
        while self.shared.sessions.connected_count() > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.shared
            .plugins
            .fire(BrokerEvent::BrokerPostShutdown)
            .await;
        info!("broker stopped");
    }

    /// Publish a message originating from the broker itself.
    pub async fn publish(&self, msg: Message) {
        self.shared.route("$broker", msg).await;
    }

    /// Number of known sessions (connected or detached-persistent).
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Number of currently connected clients.
    pub fn connected_count(&self) -> usize {
        self.shared.sessions.connected_count()
    }

    /// Retained message currently stored for a topic.
    pub fn retained(&self, topic: &str) -> Option<Message> {
        self.shared.retained.get(topic)
    }
}

/// Accept connections on one listener until shutdown.
async fn accept_loop(
    shared: Arc<Shared>,
    name: String,
    listener: ListenerConfig,
    tcp: TcpListener,
    acceptor: Option<TlsAcceptorConfig>,
) {
    let open = Arc::new(AtomicUsize::new(0));
    let mut shutdown = shared.shutdown_rx();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => {
                debug!(listener = name.as_str(), "accept loop stopping");
                return;
            }
            accepted = tcp.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(listener = name.as_str(), error = %e, "accept failed");
                    continue;
                }
            },
        };

        if listener.max_connections > 0 && open.load(Ordering::Acquire) >= listener.max_connections
        {
            warn!(
                listener = name.as_str(),
                %peer,
                max = listener.max_connections,
                "connection limit reached, rejecting"
            );
            continue;
        }

        open.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(&shared);
        let open = Arc::clone(&open);
        let kind = listener.kind;
        let acceptor = acceptor.clone();
        let listener_name = name.clone();

        tokio::spawn(async move {
            let result = accept_transport(kind, acceptor, stream, peer).await;
            match result {
                Ok(transport) => {
                    if let Err(e) = handle_connection(shared, transport).await {
                        debug!(listener = listener_name.as_str(), %peer, error = %e, "connection ended");
                    }
                }
                Err(e) => {
                    debug!(listener = listener_name.as_str(), %peer, error = %e, "handshake failed");
                }
            }
            open.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

/// Wrap an accepted TCP stream per the listener kind.
async fn accept_transport(
    kind: ListenerKind,
    acceptor: Option<TlsAcceptorConfig>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) -> Result<Transport> {
    stream.set_nodelay(true)?;
    match (kind, acceptor) {
        (ListenerKind::Tcp, None) => Ok(Transport::tcp(stream, peer)),
        (ListenerKind::Tcp, Some(tls)) => {
            Transport::accept_tls(tls.acceptor(), stream, peer).await
        }
        (ListenerKind::Ws, None) => Transport::accept_ws(Box::new(stream) as BoxStream, peer).await,
        (ListenerKind::Ws, Some(tls)) => {
            let tls_stream = tls.acceptor().accept(stream).await?;
            Transport::accept_ws(Box::new(tls_stream) as BoxStream, peer).await
        }
    }
}

/// Drive one accepted connection: CONNECT exchange, session policy,
/// CONNACK, then the handler's packet pumps until termination.
async fn handle_connection(shared: Arc<Shared>, transport: Transport) -> Result<()> {
    let peer = transport.peer();
    let (mut reader, mut writer) = tokio::io::split(transport);
    let mut read_buf = BytesMut::with_capacity(4096);

    // CONNECT must arrive promptly or the socket is dropped.
    let connect = match tokio::time::timeout(
        shared.config.connect_timeout(),
        protocol::read_packet(&mut reader, &mut read_buf, shared.config.max_packet_size),
    )
    .await
    {
        Err(_) => {
            debug!(%peer, "no CONNECT within timeout");
            return Err(Error::KeepaliveTimeout);
        }
        Ok(Err(Error::UnsupportedVersion(level))) => {
            // [MQTT-3.1.2-2] answer CONNACK code 1, then close.
            send_connack(&mut writer, false, ConnectReturnCode::UnacceptableProtocolVersion)
                .await?;
            return Err(Error::UnsupportedVersion(level));
        }
        Ok(Err(e)) => return Err(e),
        Ok(Ok(Packet::Connect(connect))) => connect,
        Ok(Ok(other)) => {
            return Err(Error::UnexpectedPacket {
                expected: "CONNECT".to_string(),
                got: other.name().to_string(),
            });
        }
    };

    shared.metrics.message_received();

    // [MQTT-3.1.3-8] an empty client id requires a clean session; the
    // broker assigns a random id otherwise.
    let client_id = if connect.client_id.is_empty() {
        if !connect.clean_session {
            send_connack(&mut writer, false, ConnectReturnCode::IdentifierRejected).await?;
            return Err(Error::ProtocolViolation(
                "empty client id with clean_session=0".to_string(),
            ));
        }
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        format!("auto-{suffix}")
    } else {
        connect.client_id.clone()
    };

    // Authentication filter vote.
    let ctx = AuthContext {
        client_id: &client_id,
        username: connect.username.as_deref(),
        password: connect.password.as_deref(),
    };
    if !shared.plugins.authenticate(&ctx).await {
        let code = if connect.username.is_some() {
            ConnectReturnCode::BadUsernameOrPassword
        } else {
            ConnectReturnCode::NotAuthorized
        };
        warn!(client_id, %peer, "authentication refused");
        send_connack(&mut writer, false, code).await?;
        return Err(Error::AuthenticationFailed);
    }

    if !shared.is_running() {
        send_connack(&mut writer, false, ConnectReturnCode::ServerUnavailable).await?;
        return Err(Error::ShuttingDown);
    }

    // Session policy (create / destroy / takeover).
    let outcome = shared.sessions.connect(&client_id, connect.clean_session);
    if !outcome.stale_filters.is_empty() {
        shared.purge_subscriptions(&client_id, &outcome.stale_filters);
    }
    if let Some(displaced) = outcome.displaced {
        info!(client_id, "session takeover, closing previous connection");
        let _ = displaced.close_tx.try_send(CloseReason::SessionTakenOver);
    }

    let (tx, rx) = mpsc::channel::<Message>(shared.config.outbound_queue);
    let (close_tx, close_rx) = mpsc::channel::<CloseReason>(1);
    let tx = Arc::new(tx);

    let will = connect.will.clone();
    {
        let mut session = outcome.session.lock();
        session.keep_alive = connect.keep_alive;
        session.will = connect.will;
        session.attach(ConnectedHandle {
            tx: Arc::clone(&tx),
            close_tx,
        });
    }

    send_connack(&mut writer, outcome.session_present, ConnectReturnCode::Accepted).await?;
    shared.metrics.message_sent();

    info!(
        client_id,
        %peer,
        clean_session = connect.clean_session,
        session_present = outcome.session_present,
        keep_alive = connect.keep_alive,
        "client connected"
    );
    shared.metrics.connection_opened(shared.sessions.connected_count() as u64);
    shared.plugins.dispatch(BrokerEvent::ClientConnected {
        client_id: client_id.clone(),
    });
    if let Some(ref callback) = shared.on_client_connected {
        callback(&client_id);
    }
    shared
        .publish_sys_connected(
            &client_id,
            connect.username.as_deref().unwrap_or(""),
            peer,
            connect.keep_alive,
        )
        .await;

    let handler = ClientHandler::new(
        Arc::clone(&shared),
        Arc::clone(&outcome.session),
        client_id.clone(),
        connect.keep_alive,
    );
    let end = handler.run(reader, writer, read_buf, rx, close_rx).await;

    let release = shared.sessions.release(&client_id, &tx);
    if !release.stale_filters.is_empty() {
        shared.purge_subscriptions(&client_id, &release.stale_filters);
    }

    let clean_disconnect = matches!(end, EndReason::CleanDisconnect);
    match &end {
        EndReason::CleanDisconnect => debug!(client_id, "clean disconnect"),
        EndReason::TakenOver => debug!(client_id, "closed: session taken over"),
        EndReason::Shutdown => debug!(client_id, "closed: server shutdown"),
        EndReason::Error(e) => debug!(client_id, error = %e, "connection lost"),
    }

    // Abnormal termination dispatches the will through the router.
    if !clean_disconnect {
        if let Some(will) = will {
            debug!(client_id, topic = %will.topic, "dispatching will");
            shared.route(&client_id, will.into_message()).await;
        }
    }

    shared.plugins.dispatch(BrokerEvent::ClientDisconnected {
        client_id: client_id.clone(),
    });
    if let Some(ref callback) = shared.on_client_disconnected {
        callback(&client_id);
    }
    let reason = match &end {
        EndReason::CleanDisconnect => "normal",
        EndReason::TakenOver => "session_taken_over",
        EndReason::Shutdown => "server_shutdown",
        EndReason::Error(_) => "connection_lost",
    };
    shared.publish_sys_disconnected(&client_id, reason).await;
    info!(client_id, "client disconnected");

    match end {
        EndReason::Error(e) => Err(e),
        _ => Ok(()),
    }
}

async fn send_connack(
    writer: &mut WriteHalf<Transport>,
    session_present: bool,
    code: ConnectReturnCode,
) -> Result<()> {
    let packet = Packet::ConnAck(v4::ConnAck {
        session_present,
        code,
    });
    protocol::write_packet(writer, &packet).await?;
    if code != ConnectReturnCode::Accepted {
        let _ = writer.shutdown().await;
    }
    Ok(())
}

/// Publish `$SYS/broker/...` metrics at the configured cadence.
async fn sys_loop(shared: Arc<Shared>, interval: Duration) {
    let mut shutdown = shared.shutdown_rx();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }

        let snapshot = shared.metrics.snapshot(
            shared.sessions.len() as u64,
            shared.sessions.connected_count() as u64,
            shared.subscriptions.len() as u64,
            shared.retained.len() as u64,
        );
        for msg in snapshot {
            shared.route("$sys", msg).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    #[test]
    fn test_builder_registers_packaged_plugins() {
        let config = BrokerConfig::new("127.0.0.1:0");
        let broker = Broker::new(config);
        // allow-anonymous with no users: no packaged plugins.
        assert!(broker.shared.plugins.is_empty());

        let mut auth = AuthConfig::default();
        auth.allow_anonymous = false;
        let config = BrokerConfig::new("127.0.0.1:0").with_auth(auth);
        let broker = Broker::new(config);
        assert_eq!(broker.shared.plugins.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let broker = Broker::new(BrokerConfig::new("127.0.0.1:0"));
        let shared = &broker.shared;

        shared.subscribe("c1", "a/+", QoS::AtMostOnce).unwrap();
        shared.subscribe("c1", "a/+", QoS::ExactlyOnce).unwrap();
        assert_eq!(shared.subscriptions.len(), 1);

        let matches = shared.subscriptions.collect("a/b");
        assert_eq!(matches.len(), 1);
        // Resubscription replaced the granted QoS.
        assert_eq!(matches[0].max_qos, QoS::ExactlyOnce);

        assert!(shared.unsubscribe("c1", "a/+"));
        assert!(shared.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_route_queues_for_detached_persistent_session() {
        let broker = Broker::new(BrokerConfig::new("127.0.0.1:0"));
        let shared = &broker.shared;

        let outcome = shared.sessions.connect("c1", false);
        shared.subscribe("c1", "a/#", QoS::AtLeastOnce).unwrap();
        outcome
            .session
            .lock()
            .subscriptions
            .insert("a/#".to_string(), QoS::AtLeastOnce);

        // QoS 1 publish to a detached session is queued.
        let msg = Message::new("a/b", &b"p"[..]).with_qos(QoS::AtLeastOnce);
        shared.route("pub", msg).await;
        assert_eq!(outcome.session.lock().queued_count(), 1);

        // QoS 0 publish to a detached session is dropped.
        let msg = Message::new("a/b", &b"p"[..]);
        shared.route("pub", msg).await;
        assert_eq!(outcome.session.lock().queued_count(), 1);
    }

    #[tokio::test]
    async fn test_route_updates_retained_store() {
        let broker = Broker::new(BrokerConfig::new("127.0.0.1:0"));
        let shared = &broker.shared;

        let msg = Message::new("t", &b"r"[..]).with_retain(true).with_qos(QoS::AtLeastOnce);
        shared.route("pub", msg).await;
        assert_eq!(shared.retained.get("t").unwrap().payload.as_ref(), b"r");

        // Empty retained payload clears the entry.
        let clear = Message::new("t", &b""[..]).with_retain(true);
        shared.route("pub", clear).await;
        assert!(shared.retained.get("t").is_none());
    }
}
