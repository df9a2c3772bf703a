//! MQTT 3.1.1 client (mqtt3c).
//!
//! The public [`Client`] is a thin handle; a background driver task owns
//! the connection, the packet-id pool and both inflight tables. Commands
//! travel over a channel and resolve when their QoS flow completes: a
//! QoS 1 publish returns after PUBACK, a QoS 2 publish after PUBCOMP.
//!
//! With [`ReconnectConfig`] set, a lost connection is re-established with
//! exponential backoff; for `clean_session = false` the inflight state is
//! replayed (PUBRELs first, then PUBLISHes with dup=1) and subscriptions
//! are re-sent when the broker reports `session_present = 0`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, v4, Packet, MAX_PACKET_SIZE};
use crate::session::{OutboundStage, PacketIdAllocator};
use crate::transport::{TlsConfig, Transport};
use crate::types::{ConnectReturnCode, Message, QoS, Will};

/// How long to wait for CONNACK after sending CONNECT.
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First backoff delay.
    pub min_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Give up after this many consecutive failures; `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Broker URI (`mqtt://`, `mqtts://`, `ws://`, `wss://`, or bare
    /// `host:port`).
    pub uri: String,
    /// Client ID.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep alive interval in seconds.
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Will message registered at CONNECT.
    pub will: Option<Will>,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Send PINGREQ automatically at `keep_alive / 2` intervals.
    pub auto_keepalive: bool,
    /// Auto-reconnect policy; `None` disables reconnection.
    pub reconnect: Option<ReconnectConfig>,
    /// TLS settings for `mqtts`/`wss` URIs.
    pub tls: Option<TlsConfig>,
}

impl ClientConfig {
    /// Create a new client config.
    pub fn new(uri: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            will: None,
            max_packet_size: MAX_PACKET_SIZE,
            auto_keepalive: true,
            reconnect: None,
            tls: None,
        }
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval in seconds (0 disables).
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Declare a will message.
    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Enable auto-reconnect.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Set TLS settings.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Enable or disable automatic keep-alive pings.
    pub fn with_auto_keepalive(mut self, enabled: bool) -> Self {
        self.auto_keepalive = enabled;
        self
    }
}

enum Command {
    Publish {
        msg: Message,
        done: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        filters: Vec<(String, QoS)>,
        done: oneshot::Sender<Result<Vec<v4::SubscribeReturnCode>>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        done: oneshot::Sender<Result<()>>,
    },
    Ping {
        done: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// MQTT 3.1.1 client handle.
#[derive(Debug)]
pub struct Client {
    client_id: String,
    cmd_tx: mpsc::Sender<Command>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl Client {
    /// Connect to an MQTT broker. The initial connection must succeed
    /// even when a reconnect policy is configured.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        debug!(
            uri = %config.uri,
            client_id = %config.client_id,
            clean_session = config.clean_session,
            "connecting"
        );

        let (transport, session_present) = establish(&config).await?;
        trace!(session_present, "connected");

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        let client_id = config.client_id.clone();

        let driver = Driver::new(config, cmd_rx, incoming_tx);
        tokio::spawn(driver.run(transport, session_present));

        Ok(Self {
            client_id,
            cmd_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        })
    }

    /// Get the client ID.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Publish with QoS 0 (fire and forget).
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.publish_qos(topic, payload, QoS::AtMostOnce, false).await
    }

    /// Publish at any QoS. Resolves once the flow completes: immediately
    /// for QoS 0, at PUBACK for QoS 1, at PUBCOMP for QoS 2.
    pub async fn publish_qos(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        crate::types::validate_topic_name(topic)?;
        let msg = Message::new(topic, payload.to_vec())
            .with_qos(qos)
            .with_retain(retain);
        let (done, wait) = oneshot::channel();
        self.command(Command::Publish { msg, done }).await?;
        wait.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Subscribe to topic filters; returns the per-filter granted codes.
    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<Vec<v4::SubscribeReturnCode>> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }
        let filters = filters
            .iter()
            .map(|(path, qos)| ((*path).to_string(), *qos))
            .collect();
        let (done, wait) = oneshot::channel();
        self.command(Command::Subscribe { filters, done }).await?;
        wait.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Unsubscribe from topic filters.
    pub async fn unsubscribe(&self, filters: &[&str]) -> Result<()> {
        if filters.is_empty() {
            return Ok(());
        }
        let filters = filters.iter().map(|f| (*f).to_string()).collect();
        let (done, wait) = oneshot::channel();
        self.command(Command::Unsubscribe { filters, done }).await?;
        wait.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Receive the next application message.
    pub async fn recv(&self) -> Result<Message> {
        self.incoming_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    /// Receive with a timeout; `Ok(None)` on expiry.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Send a ping and wait for the response.
    pub async fn ping(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.command(Command::Ping { done }).await?;
        wait.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Send DISCONNECT and stop the driver.
    pub async fn disconnect(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.command(Command::Disconnect { done }).await?;
        let _ = wait.await;
        Ok(())
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Open the transport and run the CONNECT / CONNACK exchange.
async fn establish(config: &ClientConfig) -> Result<(Transport, bool)> {
    let mut transport = Transport::connect(&config.uri, config.tls.as_ref()).await?;

    let connect = Packet::Connect(v4::Connect {
        client_id: config.client_id.clone(),
        keep_alive: config.keep_alive,
        clean_session: config.clean_session,
        username: config.username.clone(),
        password: config.password.clone(),
        will: config.will.clone(),
    });
    protocol::write_packet(&mut transport, &connect).await?;

    let mut buf = BytesMut::with_capacity(64);
    let packet = tokio::time::timeout(
        CONNACK_TIMEOUT,
        protocol::read_packet(&mut transport, &mut buf, config.max_packet_size),
    )
    .await
    .map_err(|_| Error::Timeout("CONNACK".to_string()))??;

    match packet {
        Packet::ConnAck(connack) => {
            if connack.code != ConnectReturnCode::Accepted {
                return Err(Error::ConnectionRefused(connack.code));
            }
            Ok((transport, connack.session_present))
        }
        other => Err(Error::UnexpectedPacket {
            expected: "CONNACK".to_string(),
            got: other.name().to_string(),
        }),
    }
}

struct Inflight {
    pid: u16,
    msg: Message,
    stage: OutboundStage,
    done: Option<oneshot::Sender<Result<()>>>,
}

struct Driver {
    config: ClientConfig,
    cmd_rx: mpsc::Receiver<Command>,
    incoming_tx: mpsc::Sender<Message>,

    pid_alloc: PacketIdAllocator,
    outbound: VecDeque<Inflight>,
    inbound_qos2: HashSet<u16>,
    subscriptions: HashMap<String, QoS>,
    pending_sub: HashMap<
        u16,
        (
            Vec<(String, QoS)>,
            Option<oneshot::Sender<Result<Vec<v4::SubscribeReturnCode>>>>,
        ),
    >,
    pending_unsub: HashMap<u16, (Vec<String>, oneshot::Sender<Result<()>>)>,
    pending_ping: Vec<oneshot::Sender<Result<()>>>,
}

enum LoopEnd {
    /// User called disconnect, or the handle was dropped.
    Stopped,
    /// Transport failed.
    ConnectionLost(Error),
}

impl Driver {
    fn new(
        config: ClientConfig,
        cmd_rx: mpsc::Receiver<Command>,
        incoming_tx: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            config,
            cmd_rx,
            incoming_tx,
            pid_alloc: PacketIdAllocator::new(),
            outbound: VecDeque::new(),
            inbound_qos2: HashSet::new(),
            subscriptions: HashMap::new(),
            pending_sub: HashMap::new(),
            pending_unsub: HashMap::new(),
            pending_ping: Vec::new(),
        }
    }

    async fn run(mut self, mut transport: Transport, mut session_present: bool) {
        loop {
            let (reader, writer) = tokio::io::split(transport);
            let end = self.connection_loop(reader, writer, session_present).await;

            match end {
                LoopEnd::Stopped => return,
                LoopEnd::ConnectionLost(e) => {
                    warn!(client_id = %self.config.client_id, error = %e, "connection lost");
                    if self.config.reconnect.is_none() {
                        self.fail_all(&e);
                        return;
                    }
                    if self.config.clean_session {
                        // No session state survives: pending flows fail
                        // and the QoS 2 dedupe set resets with the
                        // session, so the fresh broker session may reuse
                        // packet ids the old connection had seen.
                        self.fail_all(&e);
                        self.inbound_qos2.clear();
                    }
                    match self.reconnect().await {
                        Some((new_transport, present)) => {
                            transport = new_transport;
                            session_present = present;
                        }
                        None => {
                            self.fail_all(&Error::ConnectionClosed);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Exponential backoff reconnect; `None` when attempts run out or
    /// the command channel is gone.
    async fn reconnect(&mut self) -> Option<(Transport, bool)> {
        let policy = self.config.reconnect.clone()?;
        let mut delay = policy.min_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if policy.max_attempts.is_some_and(|max| attempt > max) {
                warn!(client_id = %self.config.client_id, attempt, "giving up reconnecting");
                return None;
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..200));
            debug!(
                client_id = %self.config.client_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::time::sleep(delay + jitter).await;

            match establish(&self.config).await {
                Ok(pair) => {
                    debug!(client_id = %self.config.client_id, "reconnected");
                    return Some(pair);
                }
                Err(e) => {
                    warn!(client_id = %self.config.client_id, error = %e, "reconnect failed");
                    delay = (delay * 2).min(policy.max_backoff);
                }
            }
        }
    }

    async fn connection_loop(
        &mut self,
        mut reader: ReadHalf<Transport>,
        mut writer: WriteHalf<Transport>,
        session_present: bool,
    ) -> LoopEnd {
        if let Err(e) = self.on_connected(&mut writer, session_present).await {
            return LoopEnd::ConnectionLost(e);
        }

        let mut read_buf = BytesMut::with_capacity(4096);
        let keepalive_enabled = self.config.auto_keepalive && self.config.keep_alive > 0;
        let mut keepalive = tokio::time::interval(Duration::from_secs(
            (self.config.keep_alive / 2).max(1) as u64,
        ));
        keepalive.reset(); // the first tick should not fire immediately

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    let Some(command) = command else {
                        // Handle dropped: best-effort DISCONNECT.
                        let _ = protocol::write_packet(&mut writer, &Packet::Disconnect).await;
                        return LoopEnd::Stopped;
                    };
                    match self.handle_command(&mut writer, command).await {
                        Ok(true) => return LoopEnd::Stopped,
                        Ok(false) => {}
                        Err(e) => return LoopEnd::ConnectionLost(e),
                    }
                }

                result = protocol::read_packet(&mut reader, &mut read_buf, self.config.max_packet_size) => {
                    let packet = match result {
                        Ok(packet) => packet,
                        Err(e) => return LoopEnd::ConnectionLost(e),
                    };
                    if let Err(e) = self.handle_packet(&mut writer, packet).await {
                        return LoopEnd::ConnectionLost(e);
                    }
                }

                _ = keepalive.tick(), if keepalive_enabled => {
                    trace!("keepalive ping");
                    if let Err(e) = protocol::write_packet(&mut writer, &Packet::PingReq).await {
                        return LoopEnd::ConnectionLost(e);
                    }
                }
            }
        }
    }

    /// Replay state after (re)connecting: PUBRELs first, then dup
    /// PUBLISHes, then re-subscribe when the broker kept no session.
    async fn on_connected(
        &mut self,
        writer: &mut WriteHalf<Transport>,
        session_present: bool,
    ) -> Result<()> {
        for inflight in &self.outbound {
            match inflight.stage {
                OutboundStage::WaitPubcomp => {
                    protocol::write_packet(
                        writer,
                        &Packet::PubRel(v4::PubRel { pkid: inflight.pid }),
                    )
                    .await?;
                }
                _ => {}
            }
        }
        for inflight in &self.outbound {
            if inflight.stage != OutboundStage::WaitPubcomp {
                protocol::write_packet(
                    writer,
                    &Packet::Publish(v4::Publish {
                        topic: inflight.msg.topic.clone(),
                        payload: inflight.msg.payload.clone(),
                        qos: inflight.msg.qos,
                        retain: inflight.msg.retain,
                        dup: true,
                        pkid: inflight.pid,
                    }),
                )
                .await?;
            }
        }

        // Re-issue SUBSCRIBE / UNSUBSCRIBE exchanges whose acks never
        // arrived; pings from the old connection cannot complete.
        let pending_subs: Vec<(u16, Vec<(String, QoS)>)> = self
            .pending_sub
            .iter()
            .map(|(pid, (filters, _))| (*pid, filters.clone()))
            .collect();
        for (pid, filters) in pending_subs {
            protocol::write_packet(
                writer,
                &Packet::Subscribe(v4::Subscribe {
                    pkid: pid,
                    filters: filters
                        .into_iter()
                        .map(|(path, qos)| v4::SubscribeFilter { path, qos })
                        .collect(),
                }),
            )
            .await?;
        }
        let pending_unsubs: Vec<(u16, Vec<String>)> = self
            .pending_unsub
            .iter()
            .map(|(pid, (filters, _))| (*pid, filters.clone()))
            .collect();
        for (pid, topics) in pending_unsubs {
            protocol::write_packet(
                writer,
                &Packet::Unsubscribe(v4::Unsubscribe { pkid: pid, topics }),
            )
            .await?;
        }
        for done in self.pending_ping.drain(..) {
            let _ = done.send(Err(Error::ConnectionClosed));
        }

        if !session_present && !self.subscriptions.is_empty() {
            debug!(
                count = self.subscriptions.len(),
                "session not present, re-subscribing"
            );
            let filters: Vec<(String, QoS)> = self
                .subscriptions
                .iter()
                .map(|(f, q)| (f.clone(), *q))
                .collect();
            let pid = self.pid_alloc.allocate().ok_or(Error::QueueOverflow)?;
            self.pending_sub.insert(pid, (filters.clone(), None));
            protocol::write_packet(
                writer,
                &Packet::Subscribe(v4::Subscribe {
                    pkid: pid,
                    filters: filters
                        .into_iter()
                        .map(|(path, qos)| v4::SubscribeFilter { path, qos })
                        .collect(),
                }),
            )
            .await?;
        }
        Ok(())
    }

    /// Returns `Ok(true)` when the driver should stop.
    async fn handle_command(
        &mut self,
        writer: &mut WriteHalf<Transport>,
        command: Command,
    ) -> Result<bool> {
        match command {
            Command::Publish { msg, done } => {
                if msg.qos == QoS::AtMostOnce {
                    let result = protocol::write_packet(
                        writer,
                        &Packet::Publish(v4::Publish {
                            topic: msg.topic.clone(),
                            payload: msg.payload.clone(),
                            qos: msg.qos,
                            retain: msg.retain,
                            dup: false,
                            pkid: 0,
                        }),
                    )
                    .await;
                    let failed = result.is_err();
                    let _ = done.send(result);
                    if failed {
                        return Err(Error::ConnectionClosed);
                    }
                    return Ok(false);
                }

                let Some(pid) = self.pid_alloc.allocate() else {
                    let _ = done.send(Err(Error::QueueOverflow));
                    return Ok(false);
                };
                let stage = match msg.qos {
                    QoS::AtLeastOnce => OutboundStage::WaitPuback,
                    QoS::ExactlyOnce => OutboundStage::WaitPubrec,
                    QoS::AtMostOnce => unreachable!(),
                };
                self.outbound.push_back(Inflight {
                    pid,
                    msg: msg.clone(),
                    stage,
                    done: Some(done),
                });
                protocol::write_packet(
                    writer,
                    &Packet::Publish(v4::Publish {
                        topic: msg.topic,
                        payload: msg.payload,
                        qos: msg.qos,
                        retain: msg.retain,
                        dup: false,
                        pkid: pid,
                    }),
                )
                .await?;
            }

            Command::Subscribe { filters, done } => {
                let Some(pid) = self.pid_alloc.allocate() else {
                    let _ = done.send(Err(Error::QueueOverflow));
                    return Ok(false);
                };
                self.pending_sub.insert(pid, (filters.clone(), Some(done)));
                protocol::write_packet(
                    writer,
                    &Packet::Subscribe(v4::Subscribe {
                        pkid: pid,
                        filters: filters
                            .into_iter()
                            .map(|(path, qos)| v4::SubscribeFilter { path, qos })
                            .collect(),
                    }),
                )
                .await?;
            }

            Command::Unsubscribe { filters, done } => {
                let Some(pid) = self.pid_alloc.allocate() else {
                    let _ = done.send(Err(Error::QueueOverflow));
                    return Ok(false);
                };
                self.pending_unsub.insert(pid, (filters.clone(), done));
                protocol::write_packet(
                    writer,
                    &Packet::Unsubscribe(v4::Unsubscribe {
                        pkid: pid,
                        topics: filters,
                    }),
                )
                .await?;
            }

            Command::Ping { done } => {
                self.pending_ping.push(done);
                protocol::write_packet(writer, &Packet::PingReq).await?;
            }

            Command::Disconnect { done } => {
                let _ = protocol::write_packet(writer, &Packet::Disconnect).await;
                let _ = done.send(());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle_packet(
        &mut self,
        writer: &mut WriteHalf<Transport>,
        packet: Packet,
    ) -> Result<()> {
        match packet {
            Packet::Publish(publish) => {
                let msg = Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                };
                match publish.qos {
                    QoS::AtMostOnce => {
                        let _ = self.incoming_tx.send(msg).await;
                    }
                    QoS::AtLeastOnce => {
                        let _ = self.incoming_tx.send(msg).await;
                        protocol::write_packet(
                            writer,
                            &Packet::PubAck(v4::PubAck { pkid: publish.pkid }),
                        )
                        .await?;
                    }
                    QoS::ExactlyOnce => {
                        if self.inbound_qos2.insert(publish.pkid) {
                            let _ = self.incoming_tx.send(msg).await;
                        } else {
                            trace!(pid = publish.pkid, "duplicate qos 2 publish");
                        }
                        protocol::write_packet(
                            writer,
                            &Packet::PubRec(v4::PubRec { pkid: publish.pkid }),
                        )
                        .await?;
                    }
                }
            }

            Packet::PubAck(ack) => {
                self.complete_outbound(ack.pkid, OutboundStage::WaitPuback);
            }

            Packet::PubRec(rec) => {
                if let Some(inflight) = self.outbound.iter_mut().find(|i| i.pid == rec.pkid) {
                    if inflight.stage == OutboundStage::WaitPubrec
                        || inflight.stage == OutboundStage::WaitPubcomp
                    {
                        inflight.stage = OutboundStage::WaitPubcomp;
                        protocol::write_packet(
                            writer,
                            &Packet::PubRel(v4::PubRel { pkid: rec.pkid }),
                        )
                        .await?;
                    }
                } else {
                    warn!(pid = rec.pkid, "PUBREC for unknown pid");
                }
            }

            Packet::PubComp(comp) => {
                self.complete_outbound(comp.pkid, OutboundStage::WaitPubcomp);
            }

            Packet::PubRel(rel) => {
                self.inbound_qos2.remove(&rel.pkid);
                protocol::write_packet(writer, &Packet::PubComp(v4::PubComp { pkid: rel.pkid }))
                    .await?;
            }

            Packet::SubAck(suback) => {
                if let Some((filters, done)) = self.pending_sub.remove(&suback.pkid) {
                    self.pid_alloc.release(suback.pkid);
                    for (i, (filter, qos)) in filters.into_iter().enumerate() {
                        match suback.return_codes.get(i) {
                            Some(v4::SubscribeReturnCode::Success(granted)) => {
                                self.subscriptions.insert(filter, (*granted).min(qos));
                            }
                            _ => {
                                self.subscriptions.remove(&filter);
                            }
                        }
                    }
                    if let Some(done) = done {
                        let _ = done.send(Ok(suback.return_codes));
                    }
                } else {
                    warn!(pid = suback.pkid, "SUBACK for unknown pid");
                }
            }

            Packet::UnsubAck(unsuback) => {
                if let Some((filters, done)) = self.pending_unsub.remove(&unsuback.pkid) {
                    self.pid_alloc.release(unsuback.pkid);
                    for filter in filters {
                        self.subscriptions.remove(&filter);
                    }
                    let _ = done.send(Ok(()));
                } else {
                    warn!(pid = unsuback.pkid, "UNSUBACK for unknown pid");
                }
            }

            Packet::PingResp => {
                trace!("pong");
                if let Some(done) = self.pending_ping.pop() {
                    let _ = done.send(Ok(()));
                }
            }

            other => {
                return Err(Error::UnexpectedPacket {
                    expected: "server packet".to_string(),
                    got: other.name().to_string(),
                });
            }
        }
        Ok(())
    }

    fn complete_outbound(&mut self, pid: u16, expected: OutboundStage) {
        let Some(pos) = self
            .outbound
            .iter()
            .position(|i| i.pid == pid && i.stage == expected)
        else {
            warn!(pid, "acknowledgment for unknown pid");
            return;
        };
        let Some(mut inflight) = self.outbound.remove(pos) else {
            return;
        };
        self.pid_alloc.release(pid);
        if let Some(done) = inflight.done.take() {
            let _ = done.send(Ok(()));
        }
    }

    /// Resolve every pending flow with an error after a terminal failure.
    fn fail_all(&mut self, error: &Error) {
        let message = error.to_string();
        for mut inflight in self.outbound.drain(..) {
            self.pid_alloc.release(inflight.pid);
            if let Some(done) = inflight.done.take() {
                let _ = done.send(Err(Error::Internal(message.clone())));
            }
        }
        for (pid, (_, done)) in self.pending_sub.drain() {
            self.pid_alloc.release(pid);
            if let Some(done) = done {
                let _ = done.send(Err(Error::Internal(message.clone())));
            }
        }
        for (pid, (_, done)) in self.pending_unsub.drain() {
            self.pid_alloc.release(pid);
            let _ = done.send(Err(Error::Internal(message.clone())));
        }
        for done in self.pending_ping.drain(..) {
            let _ = done.send(Err(Error::Internal(message.clone())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("mqtt://127.0.0.1:1883", "test-client")
            .with_credentials("user", b"pass".to_vec())
            .with_keep_alive(30)
            .with_clean_session(false)
            .with_will(Will::new("bye", &b"gone"[..], QoS::AtLeastOnce, false));

        assert_eq!(config.uri, "mqtt://127.0.0.1:1883");
        assert_eq!(config.client_id, "test-client");
        assert_eq!(config.username, Some("user".to_string()));
        assert_eq!(config.password, Some(b"pass".to_vec()));
        assert_eq!(config.keep_alive, 30);
        assert!(!config.clean_session);
        assert_eq!(config.will.as_ref().unwrap().topic, "bye");
        assert!(config.reconnect.is_none());
    }

    #[test]
    fn test_reconnect_defaults() {
        let policy = ReconnectConfig::default();
        assert!(policy.min_backoff < policy.max_backoff);
        assert!(policy.max_attempts.is_none());
    }
}
