//! Session state and the broker-side session store.
//!
//! A [`Session`] carries everything that must survive a reconnect of a
//! persistent (`clean_session = false`) client: subscriptions, the will,
//! the packet-id pool, both inflight tables and the offline queue. The
//! [`SessionStore`] maps client ids to sessions and implements the CONNECT
//! policy, including takeover.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{Message, QoS, Will};

/// Reason a connected handler is asked to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer CONNECT with the same client id replaced this connection.
    SessionTakenOver,
    /// The broker is shutting down.
    ServerShutdown,
}

/// Delivery and close channels of a connected handler.
///
/// `tx` is wrapped in `Arc` so detach can compare sender identity and
/// never clobber a newer connection that reused the client id.
pub(crate) struct ConnectedHandle {
    pub tx: Arc<mpsc::Sender<Message>>,
    pub close_tx: mpsc::Sender<CloseReason>,
}

/// Packet identifier allocator.
///
/// Ids are 16-bit non-zero values, handed out monotonically with
/// wrap-around and never reused while still in flight
/// ([MQTT-2.3.1-2]).
#[derive(Debug, Default)]
pub struct PacketIdAllocator {
    next_id: u16,
    in_use: HashSet<u16>,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: HashSet::new(),
        }
    }

    /// Allocate an unused packet identifier.
    ///
    /// Returns `None` only when all 65535 ids are in flight.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let start = self.next_id;
        loop {
            let candidate = self.next_id;
            self.advance();
            if !self.in_use.contains(&candidate) {
                self.in_use.insert(candidate);
                return Some(candidate);
            }
            if self.next_id == start {
                return None;
            }
        }
    }

    /// Release an identifier once its flow reaches a terminal state.
    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    fn advance(&mut self) {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
    }
}

/// Outbound delivery stage for QoS > 0 messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStage {
    /// QoS 1: PUBLISH sent, awaiting PUBACK.
    WaitPuback,
    /// QoS 2: PUBLISH sent, awaiting PUBREC.
    WaitPubrec,
    /// QoS 2: PUBREC received, PUBREL sent, awaiting PUBCOMP.
    WaitPubcomp,
}

/// A QoS 1/2 message in transit to this session's client.
#[derive(Debug, Clone)]
pub struct OutboundInflight {
    pub pid: u16,
    pub msg: Message,
    pub stage: OutboundStage,
    pub sent_at: Instant,
    pub resend_count: u32,
}

/// A packet to retransmit on reattach.
#[derive(Debug, Clone)]
pub enum Resend {
    Publish { pid: u16, msg: Message, dup: bool },
    PubRel { pid: u16 },
}

/// Per-client session state.
pub struct Session {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<Will>,
    /// Active subscriptions, `filter -> granted max QoS`.
    pub subscriptions: HashMap<String, QoS>,
    pub last_seen: Instant,

    pid_alloc: PacketIdAllocator,
    /// Outbound QoS > 0 inflight, in original send order.
    outbound: VecDeque<OutboundInflight>,
    /// Inbound QoS 2 packet ids in RECEIVED state (deduplication).
    inbound_qos2: HashSet<u16>,
    /// Messages queued while the session was detached.
    queued: VecDeque<Message>,
    queued_dropped: u64,

    pub(crate) connected: Option<ConnectedHandle>,
}

impl Session {
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            keep_alive: 0,
            will: None,
            subscriptions: HashMap::new(),
            last_seen: Instant::now(),
            pid_alloc: PacketIdAllocator::new(),
            outbound: VecDeque::new(),
            inbound_qos2: HashSet::new(),
            queued: VecDeque::new(),
            queued_dropped: 0,
            connected: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    pub(crate) fn attach(&mut self, handle: ConnectedHandle) {
        self.connected = Some(handle);
        self.last_seen = Instant::now();
    }

    pub(crate) fn detach(&mut self) {
        self.connected = None;
        self.last_seen = Instant::now();
    }

    /// Start an outbound QoS > 0 flow; returns the allocated packet id,
    /// or `None` for QoS 0 (no state retained).
    pub fn begin_publish(&mut self, msg: &Message) -> Result<Option<u16>> {
        if msg.qos == QoS::AtMostOnce {
            return Ok(None);
        }
        let pid = self
            .pid_alloc
            .allocate()
            .ok_or(Error::QueueOverflow)?;
        let stage = match msg.qos {
            QoS::AtLeastOnce => OutboundStage::WaitPuback,
            QoS::ExactlyOnce => OutboundStage::WaitPubrec,
            QoS::AtMostOnce => unreachable!(),
        };
        self.outbound.push_back(OutboundInflight {
            pid,
            msg: msg.clone(),
            stage,
            sent_at: Instant::now(),
            resend_count: 0,
        });
        Ok(Some(pid))
    }

    /// PUBACK received: complete a QoS 1 flow. Returns false for an
    /// unknown packet id.
    pub fn on_puback(&mut self, pid: u16) -> bool {
        let Some(pos) = self
            .outbound
            .iter()
            .position(|i| i.pid == pid && i.stage == OutboundStage::WaitPuback)
        else {
            return false;
        };
        self.outbound.remove(pos);
        self.pid_alloc.release(pid);
        true
    }

    /// PUBREC received: advance a QoS 2 flow to PUBREL. Returns true when
    /// a PUBREL should be sent (also for a duplicate PUBREC).
    pub fn on_pubrec(&mut self, pid: u16) -> bool {
        match self.outbound.iter_mut().find(|i| i.pid == pid) {
            Some(inflight) if inflight.stage == OutboundStage::WaitPubrec => {
                inflight.stage = OutboundStage::WaitPubcomp;
                inflight.sent_at = Instant::now();
                true
            }
            // Duplicate PUBREC while awaiting PUBCOMP: re-send PUBREL.
            Some(inflight) if inflight.stage == OutboundStage::WaitPubcomp => true,
            _ => false,
        }
    }

    /// PUBCOMP received: complete a QoS 2 flow.
    pub fn on_pubcomp(&mut self, pid: u16) -> bool {
        let Some(pos) = self
            .outbound
            .iter()
            .position(|i| i.pid == pid && i.stage == OutboundStage::WaitPubcomp)
        else {
            return false;
        };
        self.outbound.remove(pos);
        self.pid_alloc.release(pid);
        true
    }

    /// Retransmission plan on reattach: PUBRELs first (draining
    /// half-completed QoS 2 flows), then PUBLISHes with dup=1, each group
    /// in original send order.
    pub fn resend_plan(&mut self) -> Vec<Resend> {
        let mut plan = Vec::with_capacity(self.outbound.len());
        for inflight in &self.outbound {
            if inflight.stage == OutboundStage::WaitPubcomp {
                plan.push(Resend::PubRel { pid: inflight.pid });
            }
        }
        for inflight in &mut self.outbound {
            if inflight.stage != OutboundStage::WaitPubcomp {
                inflight.resend_count += 1;
                inflight.sent_at = Instant::now();
                plan.push(Resend::Publish {
                    pid: inflight.pid,
                    msg: inflight.msg.clone(),
                    dup: true,
                });
            }
        }
        plan
    }

    pub fn inflight_count(&self) -> usize {
        self.outbound.len()
    }

    /// Inbound QoS 2 PUBLISH: returns true when this packet id is new and
    /// the message must be routed (exactly once); false for a duplicate.
    pub fn register_inbound(&mut self, pid: u16) -> bool {
        self.inbound_qos2.insert(pid)
    }

    /// Inbound PUBREL: forget the packet id. Returns whether it was known.
    pub fn release_inbound(&mut self, pid: u16) -> bool {
        self.inbound_qos2.remove(&pid)
    }

    /// Queue a message for a detached persistent session, bounded by
    /// `cap`; the oldest message is dropped on overflow.
    pub fn queue_message(&mut self, msg: Message, cap: usize) {
        if cap > 0 && self.queued.len() >= cap {
            self.queued.pop_front();
            self.queued_dropped += 1;
            debug!(
                client_id = %self.client_id,
                dropped = self.queued_dropped,
                "offline queue full, dropped oldest"
            );
        }
        self.queued.push_back(msg);
    }

    /// Take all queued messages for replay.
    pub fn drain_queued(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.queued)
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    pub fn queued_dropped(&self) -> u64 {
        self.queued_dropped
    }
}

/// Outcome of applying the CONNECT policy.
pub(crate) struct ConnectOutcome {
    pub session: Arc<Mutex<Session>>,
    pub session_present: bool,
    /// Handle of a previous connection that must be closed with
    /// [`CloseReason::SessionTakenOver`].
    pub displaced: Option<ConnectedHandle>,
    /// Subscription filters of a destroyed predecessor session; the
    /// caller purges them from the subscription trie.
    pub stale_filters: Vec<String>,
}

/// Outcome of releasing a session at handler termination.
pub(crate) struct ReleaseOutcome {
    /// Whether the releasing handler still owned the connection (false
    /// after a takeover).
    pub owned: bool,
    /// Subscription filters of a destroyed clean session; the caller
    /// purges them from the subscription trie.
    pub stale_filters: Vec<String>,
}

/// Mapping from client id to session.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.inner.read().get(client_id).cloned()
    }

    /// Snapshot of all sessions.
    pub fn iter(&self) -> Vec<Arc<Mutex<Session>>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|s| s.lock().is_connected())
            .count()
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.inner.write().remove(client_id)
    }

    /// Apply the CONNECT session policy:
    ///
    /// | existing | existing.clean | incoming.clean | action |
    /// |----------|----------------|----------------|--------|
    /// | no       | -              | any            | create fresh |
    /// | yes      | true           | any            | destroy, create fresh |
    /// | yes      | false          | true           | destroy, create fresh |
    /// | yes      | false          | false          | takeover, reattach |
    pub(crate) fn connect(&self, client_id: &str, clean: bool) -> ConnectOutcome {
        let mut inner = self.inner.write();

        let (session, session_present, displaced, stale_filters) = match inner.get(client_id) {
            None => (
                Arc::new(Mutex::new(Session::new(client_id, clean))),
                false,
                None,
                Vec::new(),
            ),
            Some(existing) => {
                let mut guard = existing.lock();
                let displaced = guard.connected.take();
                if guard.clean_session || clean {
                    let stale = guard.subscriptions.keys().cloned().collect();
                    drop(guard);
                    (
                        Arc::new(Mutex::new(Session::new(client_id, clean))),
                        false,
                        displaced,
                        stale,
                    )
                } else {
                    guard.last_seen = Instant::now();
                    drop(guard);
                    (Arc::clone(existing), true, displaced, Vec::new())
                }
            }
        };

        inner.insert(client_id.to_string(), Arc::clone(&session));
        ConnectOutcome {
            session,
            session_present,
            displaced,
            stale_filters,
        }
    }

    /// Detach the session owned by `tx`, preserving or destroying state
    /// per the clean-session flag.
    ///
    /// Sender identity is compared so a stale handler cannot detach the
    /// connection that replaced it.
    pub(crate) fn release(
        &self,
        client_id: &str,
        tx: &Arc<mpsc::Sender<Message>>,
    ) -> ReleaseOutcome {
        let mut inner = self.inner.write();
        let Some(session) = inner.get(client_id) else {
            return ReleaseOutcome {
                owned: false,
                stale_filters: Vec::new(),
            };
        };

        let mut guard = session.lock();
        let owned = guard
            .connected
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(&h.tx, tx));
        if owned {
            guard.detach();
        }
        let clean = guard.clean_session;
        let stale_filters = if owned && clean {
            guard.subscriptions.keys().cloned().collect()
        } else {
            Vec::new()
        };
        drop(guard);

        if owned && clean {
            inner.remove(client_id);
        }

        ReleaseOutcome {
            owned,
            stale_filters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(qos: QoS) -> Message {
        Message {
            topic: "t".to_string(),
            payload: Bytes::from_static(b"p"),
            qos,
            retain: false,
        }
    }

    #[test]
    fn test_pid_allocator_sequential() {
        let mut alloc = PacketIdAllocator::new();
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), Some(2));
        assert_eq!(alloc.allocate(), Some(3));
        assert_eq!(alloc.in_use_count(), 3);
    }

    #[test]
    fn test_pid_allocator_skips_inflight_and_zero() {
        let mut alloc = PacketIdAllocator::new();
        alloc.next_id = 65535;
        assert_eq!(alloc.allocate(), Some(65535));
        // Wraps past 0.
        assert_eq!(alloc.allocate(), Some(1));

        alloc.release(65535);
        alloc.next_id = 65535;
        assert_eq!(alloc.allocate(), Some(65535));
        // 1 still in flight; next allocation skips it.
        alloc.next_id = 1;
        assert_eq!(alloc.allocate(), Some(2));
    }

    #[test]
    fn test_qos1_flow() {
        let mut session = Session::new("c1", false);
        let pid = session.begin_publish(&msg(QoS::AtLeastOnce)).unwrap().unwrap();
        assert_eq!(session.inflight_count(), 1);

        assert!(!session.on_puback(pid + 1));
        assert!(session.on_puback(pid));
        assert!(!session.on_puback(pid));
        assert_eq!(session.inflight_count(), 0);
    }

    #[test]
    fn test_qos2_flow() {
        let mut session = Session::new("c1", false);
        let pid = session.begin_publish(&msg(QoS::ExactlyOnce)).unwrap().unwrap();

        // PUBACK must not complete a QoS 2 flow.
        assert!(!session.on_puback(pid));

        assert!(session.on_pubrec(pid));
        // Duplicate PUBREC still asks for a PUBREL.
        assert!(session.on_pubrec(pid));

        assert!(session.on_pubcomp(pid));
        assert!(!session.on_pubcomp(pid));
        assert_eq!(session.inflight_count(), 0);
    }

    #[test]
    fn test_qos0_no_state() {
        let mut session = Session::new("c1", true);
        assert!(session.begin_publish(&msg(QoS::AtMostOnce)).unwrap().is_none());
        assert_eq!(session.inflight_count(), 0);
    }

    #[test]
    fn test_resend_plan_pubrels_first() {
        let mut session = Session::new("c1", false);
        let p1 = session.begin_publish(&msg(QoS::AtLeastOnce)).unwrap().unwrap();
        let p2 = session.begin_publish(&msg(QoS::ExactlyOnce)).unwrap().unwrap();
        let p3 = session.begin_publish(&msg(QoS::ExactlyOnce)).unwrap().unwrap();
        // p3 got its PUBREC; PUBREL is outstanding.
        assert!(session.on_pubrec(p3));

        let plan = session.resend_plan();
        assert_eq!(plan.len(), 3);
        assert!(matches!(plan[0], Resend::PubRel { pid } if pid == p3));
        assert!(matches!(plan[1], Resend::Publish { pid, dup: true, .. } if pid == p1));
        assert!(matches!(plan[2], Resend::Publish { pid, dup: true, .. } if pid == p2));

        // Replayed PUBLISHes count as retransmissions; PUBRELs do not.
        for inflight in &session.outbound {
            if inflight.stage == OutboundStage::WaitPubcomp {
                assert_eq!(inflight.resend_count, 0);
            } else {
                assert_eq!(inflight.resend_count, 1);
                assert!(inflight.sent_at.elapsed().as_secs() < 1);
            }
        }
    }

    #[test]
    fn test_inbound_qos2_dedup() {
        let mut session = Session::new("c1", false);
        assert!(session.register_inbound(10));
        assert!(!session.register_inbound(10));
        assert!(session.release_inbound(10));
        assert!(!session.release_inbound(10));
        // After release the pid may be reused.
        assert!(session.register_inbound(10));
    }

    #[test]
    fn test_offline_queue_drops_oldest() {
        let mut session = Session::new("c1", false);
        for i in 0..5 {
            let mut m = msg(QoS::AtLeastOnce);
            m.payload = Bytes::from(format!("{i}"));
            session.queue_message(m, 3);
        }
        assert_eq!(session.queued_count(), 3);
        assert_eq!(session.queued_dropped(), 2);
        let drained: Vec<_> = session.drain_queued().into_iter().collect();
        assert_eq!(drained[0].payload.as_ref(), b"2");
        assert_eq!(drained[2].payload.as_ref(), b"4");
        assert_eq!(session.queued_count(), 0);
    }

    #[test]
    fn test_store_policy_fresh_and_clean() {
        let store = SessionStore::new();

        let outcome = store.connect("c1", true);
        assert!(!outcome.session_present);
        assert!(outcome.displaced.is_none());
        assert!(outcome.session.lock().will.is_none());

        // Existing clean session is always destroyed.
        outcome.session.lock().subscriptions.insert("a/#".to_string(), QoS::AtMostOnce);
        let outcome = store.connect("c1", false);
        assert!(!outcome.session_present);
        assert!(outcome.session.lock().subscriptions.is_empty());
    }

    #[test]
    fn test_store_policy_persistent_reattach() {
        let store = SessionStore::new();

        let outcome = store.connect("c1", false);
        {
            let mut session = outcome.session.lock();
            session.subscriptions.insert("a/#".to_string(), QoS::AtLeastOnce);
            session.keep_alive = 30;
        }

        // Reconnect with clean=0 reattaches state.
        let outcome = store.connect("c1", false);
        assert!(outcome.session_present);
        assert_eq!(outcome.session.lock().subscriptions.len(), 1);
        assert_eq!(outcome.session.lock().keep_alive, 30);
        assert!(outcome.session.lock().last_seen.elapsed().as_secs() < 1);

        // Reconnect with clean=1 destroys it.
        let outcome = store.connect("c1", true);
        assert!(!outcome.session_present);
        assert!(outcome.session.lock().subscriptions.is_empty());
    }

    #[test]
    fn test_store_release_clean_destroys() {
        let store = SessionStore::new();
        let (tx, _rx) = mpsc::channel::<Message>(1);
        let (close_tx, _close_rx) = mpsc::channel(1);
        let tx = Arc::new(tx);

        let outcome = store.connect("c1", true);
        outcome.session.lock().attach(ConnectedHandle {
            tx: Arc::clone(&tx),
            close_tx,
        });

        let outcome = store.release("c1", &tx);
        assert!(outcome.owned);
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn test_store_release_ignores_stale_handler() {
        let store = SessionStore::new();
        let (old_tx, _old_rx) = mpsc::channel::<Message>(1);
        let old_tx = Arc::new(old_tx);

        let outcome = store.connect("c1", false);
        {
            let (close_tx, _close_rx) = mpsc::channel(1);
            outcome.session.lock().attach(ConnectedHandle {
                tx: Arc::clone(&old_tx),
                close_tx,
            });
        }

        // Takeover displaces the old handle and attaches a new one.
        let outcome = store.connect("c1", false);
        assert!(outcome.session_present);
        assert!(outcome.displaced.is_some());
        let (new_tx, _new_rx) = mpsc::channel::<Message>(1);
        let new_tx = Arc::new(new_tx);
        {
            let (close_tx, _close_rx) = mpsc::channel(1);
            outcome.session.lock().attach(ConnectedHandle {
                tx: Arc::clone(&new_tx),
                close_tx,
            });
        }

        // The stale handler releases; the new attachment must survive.
        assert!(!store.release("c1", &old_tx).owned);
        assert!(store.get("c1").unwrap().lock().is_connected());
    }
}
