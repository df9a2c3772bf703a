//! Per-connection protocol handler (broker side).
//!
//! One handler owns one connected peer. Its single task multiplexes the
//! two pumps over a `select!` loop:
//!
//! - inbound: decode one packet at a time and dispatch by type;
//! - outbound: pull deliveries from the bounded per-session queue,
//!   allocate packet ids, serialize and write. Writes are strictly
//!   sequential on the stream, which preserves per-subscriber ordering.
//!
//! A keepalive deadline is re-armed on every inbound packet; if nothing
//! arrives within `1.5 x keepalive` the connection is closed.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::broker::Shared;
use crate::error::{Error, Result};
use crate::plugin::{BrokerEvent, TopicAction};
use crate::protocol::{self, v4, Packet};
use crate::session::{CloseReason, Resend, Session};
use crate::transport::Transport;
use crate::types::{Message, QoS};

/// Why a handler terminated.
pub(crate) enum EndReason {
    /// The client sent DISCONNECT; the will is discarded.
    CleanDisconnect,
    /// A newer CONNECT with the same client id displaced this one.
    TakenOver,
    /// Broker shutdown.
    Shutdown,
    /// Transport or protocol failure.
    Error(Error),
}

enum Flow {
    Continue,
    CleanDisconnect,
}

pub(crate) struct ClientHandler {
    shared: Arc<Shared>,
    session: Arc<Mutex<Session>>,
    client_id: String,
    keep_alive: u16,
}

impl ClientHandler {
    pub fn new(
        shared: Arc<Shared>,
        session: Arc<Mutex<Session>>,
        client_id: String,
        keep_alive: u16,
    ) -> Self {
        Self {
            shared,
            session,
            client_id,
            keep_alive,
        }
    }

    /// Run until disconnect. Replays inflight and queued state first,
    /// then enters the packet pumps. Deliveries still sitting in the
    /// queue at termination are parked back into a persistent session.
    pub async fn run(
        self,
        reader: ReadHalf<Transport>,
        writer: WriteHalf<Transport>,
        read_buf: BytesMut,
        mut rx: mpsc::Receiver<Message>,
        close_rx: mpsc::Receiver<CloseReason>,
    ) -> EndReason {
        let end = self
            .run_inner(reader, writer, read_buf, &mut rx, close_rx)
            .await;

        let mut session = self.session.lock();
        if !session.clean_session {
            let cap = self.shared.config.max_queued_messages;
            while let Ok(msg) = rx.try_recv() {
                if msg.qos > QoS::AtMostOnce {
                    session.queue_message(msg, cap);
                }
            }
        }
        end
    }

    async fn run_inner(
        &self,
        mut reader: ReadHalf<Transport>,
        mut writer: WriteHalf<Transport>,
        mut read_buf: BytesMut,
        rx: &mut mpsc::Receiver<Message>,
        mut close_rx: mpsc::Receiver<CloseReason>,
    ) -> EndReason {
        if let Err(e) = self.replay(&mut writer).await {
            return EndReason::Error(e);
        }

        // [MQTT-3.1.2-24] close after 1.5 x keepalive of inbound silence.
        let keepalive_enabled = self.keep_alive > 0;
        let window = Duration::from_millis(self.keep_alive as u64 * 1500);
        let mut deadline = tokio::time::Instant::now() + window;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline), if keepalive_enabled => {
                    warn!(
                        client_id = %self.client_id,
                        keep_alive = self.keep_alive,
                        "keepalive timeout"
                    );
                    return EndReason::Error(Error::KeepaliveTimeout);
                }

                reason = close_rx.recv() => {
                    return match reason {
                        Some(CloseReason::SessionTakenOver) => EndReason::TakenOver,
                        Some(CloseReason::ServerShutdown) | None => EndReason::Shutdown,
                    };
                }

                delivery = rx.recv() => {
                    let Some(msg) = delivery else {
                        return EndReason::Error(Error::ConnectionClosed);
                    };
                    if let Err(e) = self.deliver(&mut writer, msg).await {
                        return EndReason::Error(e);
                    }
                }

                result = protocol::read_packet(
                    &mut reader,
                    &mut read_buf,
                    self.shared.config.max_packet_size,
                ) => {
                    let packet = match result {
                        Ok(packet) => packet,
                        Err(e) => return EndReason::Error(e),
                    };
                    deadline = tokio::time::Instant::now() + window;
                    self.shared.metrics.message_received();

                    match self.handle_packet(&mut writer, packet).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::CleanDisconnect) => return EndReason::CleanDisconnect,
                        Err(e) => return EndReason::Error(e),
                    }
                }
            }
        }
    }

    /// Retransmit inflight state and drain the offline queue, in that
    /// order: PUBRELs first, then PUBLISHes with dup=1, then queued
    /// messages.
    async fn replay(&self, writer: &mut WriteHalf<Transport>) -> Result<()> {
        let plan = self.session.lock().resend_plan();
        if !plan.is_empty() {
            debug!(
                client_id = %self.client_id,
                inflight = plan.len(),
                "replaying inflight state"
            );
        }
        for resend in plan {
            match resend {
                Resend::PubRel { pid } => {
                    self.send(writer, &Packet::PubRel(v4::PubRel { pkid: pid })).await?;
                }
                Resend::Publish { pid, msg, dup } => {
                    self.send(
                        writer,
                        &Packet::Publish(v4::Publish {
                            topic: msg.topic.clone(),
                            payload: msg.payload.clone(),
                            qos: msg.qos,
                            retain: msg.retain,
                            dup,
                            pkid: pid,
                        }),
                    )
                    .await?;
                }
            }
        }

        let queued = self.session.lock().drain_queued();
        for msg in queued {
            self.deliver(writer, msg).await?;
        }
        Ok(())
    }

    /// Write one application message to the peer, entering it into the
    /// inflight table when its QoS calls for it.
    async fn deliver(&self, writer: &mut WriteHalf<Transport>, msg: Message) -> Result<()> {
        let pid = self.session.lock().begin_publish(&msg)?;

        let packet = Packet::Publish(v4::Publish {
            topic: msg.topic.clone(),
            payload: msg.payload.clone(),
            qos: msg.qos,
            retain: msg.retain,
            dup: false,
            pkid: pid.unwrap_or(0),
        });
        self.send(writer, &packet).await?;

        self.shared.plugins.dispatch(BrokerEvent::MessageSent {
            client_id: self.client_id.clone(),
            topic: msg.topic,
        });
        Ok(())
    }

    async fn send(&self, writer: &mut WriteHalf<Transport>, packet: &Packet) -> Result<()> {
        protocol::write_packet(writer, packet).await?;
        self.shared.metrics.message_sent();
        Ok(())
    }

    async fn handle_packet(
        &self,
        writer: &mut WriteHalf<Transport>,
        packet: Packet,
    ) -> Result<Flow> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(writer, publish).await?,
            Packet::PubAck(ack) => {
                if !self.session.lock().on_puback(ack.pkid) {
                    warn!(client_id = %self.client_id, pid = ack.pkid, "PUBACK for unknown pid");
                }
            }
            Packet::PubRec(rec) => {
                if self.session.lock().on_pubrec(rec.pkid) {
                    self.send(writer, &Packet::PubRel(v4::PubRel { pkid: rec.pkid }))
                        .await?;
                } else {
                    warn!(client_id = %self.client_id, pid = rec.pkid, "PUBREC for unknown pid");
                }
            }
            Packet::PubComp(comp) => {
                if !self.session.lock().on_pubcomp(comp.pkid) {
                    warn!(client_id = %self.client_id, pid = comp.pkid, "PUBCOMP for unknown pid");
                }
            }
            Packet::PubRel(rel) => {
                // Inbound QoS 2 step 3: forget the pid, always answer
                // PUBCOMP (the PUBREL may itself be a retransmission).
                self.session.lock().release_inbound(rel.pkid);
                self.send(writer, &Packet::PubComp(v4::PubComp { pkid: rel.pkid }))
                    .await?;
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(writer, subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => {
                for filter in &unsubscribe.topics {
                    let removed = self.shared.unsubscribe(&self.client_id, filter);
                    self.session.lock().subscriptions.remove(filter);
                    debug!(
                        client_id = %self.client_id,
                        filter = filter.as_str(),
                        removed,
                        "unsubscribe"
                    );
                }
                self.send(
                    writer,
                    &Packet::UnsubAck(v4::UnsubAck {
                        pkid: unsubscribe.pkid,
                    }),
                )
                .await?;
            }
            Packet::PingReq => {
                self.send(writer, &Packet::PingResp).await?;
            }
            Packet::Disconnect => {
                return Ok(Flow::CleanDisconnect);
            }
            other => {
                // CONNECT after the handshake, or a packet only a broker
                // may send.
                return Err(Error::ProtocolViolation(format!(
                    "unexpected {} from client",
                    other.name()
                )));
            }
        }
        Ok(Flow::Continue)
    }

    /// Inbound publish: QoS 0 routes immediately; QoS 1 routes then acks;
    /// QoS 2 routes exactly once per packet id and always re-emits PUBREC.
    async fn handle_publish(
        &self,
        writer: &mut WriteHalf<Transport>,
        publish: v4::Publish,
    ) -> Result<()> {
        let allowed = self
            .shared
            .plugins
            .check_topic(&self.client_id, &publish.topic, TopicAction::Publish)
            .await;
        if !allowed {
            warn!(
                client_id = %self.client_id,
                topic = %publish.topic,
                "publish denied by topic filter"
            );
        }

        self.shared.plugins.dispatch(BrokerEvent::MessageReceived {
            client_id: self.client_id.clone(),
            topic: publish.topic.clone(),
        });

        let msg = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        };

        match publish.qos {
            QoS::AtMostOnce => {
                if allowed {
                    self.shared.route(&self.client_id, msg).await;
                }
            }
            QoS::AtLeastOnce => {
                // Retained store and fan-out run before the ack.
                if allowed {
                    self.shared.route(&self.client_id, msg).await;
                }
                self.send(writer, &Packet::PubAck(v4::PubAck { pkid: publish.pkid }))
                    .await?;
            }
            QoS::ExactlyOnce => {
                let first = self.session.lock().register_inbound(publish.pkid);
                if first {
                    if allowed {
                        self.shared.route(&self.client_id, msg).await;
                    }
                } else {
                    trace!(
                        client_id = %self.client_id,
                        pid = publish.pkid,
                        "duplicate qos 2 publish, re-emitting PUBREC"
                    );
                }
                self.send(writer, &Packet::PubRec(v4::PubRec { pkid: publish.pkid }))
                    .await?;
            }
        }
        Ok(())
    }

    /// SUBSCRIBE: validate each filter, collect filter votes, insert into
    /// the trie, acknowledge, then replay matching retained messages.
    async fn handle_subscribe(
        &self,
        writer: &mut WriteHalf<Transport>,
        subscribe: v4::Subscribe,
    ) -> Result<()> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted: Vec<(String, QoS)> = Vec::new();

        for filter in &subscribe.filters {
            if crate::types::validate_topic_filter(&filter.path).is_err() {
                warn!(
                    client_id = %self.client_id,
                    filter = %filter.path,
                    "invalid topic filter"
                );
                return_codes.push(v4::SubscribeReturnCode::Failure);
                continue;
            }

            if !self
                .shared
                .plugins
                .check_topic(&self.client_id, &filter.path, TopicAction::Subscribe)
                .await
            {
                warn!(
                    client_id = %self.client_id,
                    filter = %filter.path,
                    "subscribe denied by topic filter"
                );
                return_codes.push(v4::SubscribeReturnCode::Failure);
                continue;
            }

            let qos = self.shared.subscribe(&self.client_id, &filter.path, filter.qos)?;
            self.session
                .lock()
                .subscriptions
                .insert(filter.path.clone(), qos);
            debug!(
                client_id = %self.client_id,
                filter = %filter.path,
                granted = ?qos,
                "subscribed"
            );
            granted.push((filter.path.clone(), qos));
            return_codes.push(v4::SubscribeReturnCode::Success(qos));
        }

        self.send(
            writer,
            &Packet::SubAck(v4::SubAck {
                pkid: subscribe.pkid,
                return_codes,
            }),
        )
        .await?;

        // Retained replay: each matching retained message once, with
        // retain=1 and QoS capped at the granted maximum, ahead of any
        // live traffic for this subscription.
        for (filter, max_qos) in granted {
            for retained in self.shared.retained.matching(&filter) {
                let mut msg = retained;
                msg.qos = msg.qos.min(max_qos);
                msg.retain = true;
                self.deliver(writer, msg).await?;
            }
        }
        Ok(())
    }
}
