//! Reliable pub/sub channel for sensor readings.
//!
//! The channel sits on top of a broadcast `Transport` and provides:
//! - Fan-out of each published reading to the peers that are Alive at publish time
//! - Bounded, drop-oldest buffering of received readings per producer
//! - Per-producer FIFO delivery (stale and duplicate frames are discarded)
//! - Implicit discovery: every received frame refreshes the membership table
//!
//! One task may publish while another polls; all state is internally
//! synchronized and no lock is held across an await point.

use crate::buffer::ReceiveBuffer;
use crate::membership::{
    ConfigError, Member, Membership, MembershipConfig, MembershipEvent, PeerState, SeenOutcome,
};
use crate::message::BusMessage;
use crate::peer_id::{InstanceId, PeerId};
use crate::reading::Reading;
use crate::transport::{Transport, TransportError};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default number of unconsumed readings kept per producer.
pub const DEFAULT_HISTORY_DEPTH: usize = 100;

/// Most already-arrived frames processed per drain.
const DRAIN_LIMIT: usize = 4096;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid channel configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<TransportError> for ChannelError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => ChannelError::Closed,
            other => ChannelError::Transport(other),
        }
    }
}

/// Channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Unconsumed readings kept per producer before the oldest is dropped
    pub history_depth: usize,
    pub membership: MembershipConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            history_depth: DEFAULT_HISTORY_DEPTH,
            membership: MembershipConfig::default(),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_depth == 0 {
            return Err(ConfigError::Zero("history depth"));
        }
        self.membership.validate()
    }
}

/// Delivery acknowledgement for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Sequence number stamped on the reading
    pub seq: u64,
    /// Alive peers the reading was addressed to (zero is valid)
    pub recipients: usize,
}

/// Counters describing channel activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub published: u64,
    /// Readings accepted into the buffer
    pub received: u64,
    /// Readings dropped from a full buffer
    pub evicted: u64,
    /// Data frames with a sequence number at or below one already accepted
    pub duplicates_dropped: u64,
    /// Data frames not addressed to us
    pub foreign_dropped: u64,
    /// Our own frames, or readings carrying our own sensor id
    pub self_dropped: u64,
    /// Frames that did not parse as bus messages
    pub malformed: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    received: AtomicU64,
    evicted: AtomicU64,
    duplicates_dropped: AtomicU64,
    foreign_dropped: AtomicU64,
    self_dropped: AtomicU64,
    malformed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            foreign_dropped: self.foreign_dropped.load(Ordering::Relaxed),
            self_dropped: self.self_dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Reader-side state: buffered readings and per-producer sequence tracking.
struct Inbox {
    buffer: ReceiveBuffer,
    /// Highest sequence accepted per producer, tagged with the producer's instance
    last_seq: HashMap<PeerId, (InstanceId, u64)>,
}

/// Outcome of waiting for one frame.
enum Frame {
    Data(Vec<u8>),
    TimedOut,
    Failed,
}

pub struct Channel {
    local: PeerId,
    instance: InstanceId,
    transport: Arc<dyn Transport>,
    membership: RwLock<Membership>,
    inbox: Mutex<Inbox>,
    next_seq: AtomicU64,
    counters: Counters,
    closed: AtomicBool,
    started: Instant,
}

impl Channel {
    /// Open a channel on `transport` and announce ourselves.
    ///
    /// Fails if the configuration is invalid or the first announce cannot be sent.
    pub async fn open(
        local: PeerId,
        transport: Arc<dyn Transport>,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        config.validate()?;

        let instance = InstanceId::generate();
        let channel = Self {
            local: local.clone(),
            instance,
            membership: RwLock::new(Membership::new(local, instance, config.membership)),
            inbox: Mutex::new(Inbox {
                buffer: ReceiveBuffer::new(config.history_depth),
                last_seq: HashMap::new(),
            }),
            transport,
            next_seq: AtomicU64::new(0),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            started: Instant::now(),
        };

        channel.announce().await?;
        info!(
            "Channel open for {} (instance {}) on {}",
            channel.local,
            channel.instance,
            channel.transport.describe()
        );
        Ok(channel)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Broadcast a presence announcement.
    pub async fn announce(&self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let msg = self.read_membership().announce();
        self.send(&msg).await
    }

    /// Publish a reading to every peer currently Alive.
    ///
    /// Having no peers is not an error: the reading is still broadcast (it
    /// doubles as a heartbeat) and the ack reports zero recipients.
    pub async fn publish(&self, reading: &Reading) -> Result<Ack, ChannelError> {
        self.ensure_open()?;

        let recipients: Vec<PeerId> = self.alive_peers().into_iter().collect();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let count = recipients.len();

        let msg = BusMessage::Data {
            from: self.local.clone(),
            instance: self.instance,
            seq,
            recipients,
            reading: reading.clone(),
        };
        self.send(&msg).await?;
        Counters::bump(&self.counters.published);

        Ok(Ack {
            seq,
            recipients: count,
        })
    }

    /// Take the next reading, waiting up to `timeout` for one to arrive.
    ///
    /// Frames that have already arrived are processed first, so a slow
    /// consumer sees the newest `history_depth` readings per producer and
    /// older ones are evicted. If nothing is buffered after that, incoming
    /// frames are processed until a reading is buffered or the timeout
    /// elapses, in which case `Ok(None)` is returned. A zero timeout never
    /// waits.
    pub async fn poll_receive(&self, timeout: Duration) -> Result<Option<Reading>, ChannelError> {
        self.ensure_open()?;
        self.drain_ready().await?;
        self.expire_stale();

        if let Some(reading) = self.pop_buffered() {
            return Ok(Some(reading));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.next_frame(deadline).await? {
                Frame::Data(frame) => {
                    self.handle_frame(&frame).await;
                    self.drain_ready().await?;
                    if let Some(reading) = self.pop_buffered() {
                        return Ok(Some(reading));
                    }
                }
                Frame::TimedOut | Frame::Failed => {
                    self.expire_stale();
                    return Ok(self.pop_buffered());
                }
            }
        }
    }

    /// Process incoming frames for `timeout` without consuming readings.
    ///
    /// Returns the number of frames processed. Used while waiting for
    /// discovery to settle; readings that arrive stay buffered.
    pub async fn pump(&self, timeout: Duration) -> Result<usize, ChannelError> {
        self.ensure_open()?;

        let deadline = Instant::now() + timeout;
        let mut processed = 0;
        loop {
            match self.next_frame(deadline).await? {
                Frame::Data(frame) => {
                    self.handle_frame(&frame).await;
                    processed += 1;
                }
                Frame::TimedOut | Frame::Failed => break,
            }
        }
        self.expire_stale();
        Ok(processed)
    }

    /// Leave the bus: broadcast a departure and release the transport.
    ///
    /// Idempotent. Further publishes and polls fail with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let leave = BusMessage::leave(self.local.clone(), self.instance);
        match leave.to_json() {
            Ok(frame) => {
                if let Err(e) = self.transport.broadcast(&frame).await {
                    debug!("Failed to send leave for {}: {}", self.local, e);
                }
            }
            Err(e) => debug!("Failed to encode leave for {}: {}", self.local, e),
        }
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close transport for {}: {}", self.local, e);
        }

        self.inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .buffer
            .clear();
        info!("Channel closed for {}", self.local);
    }

    /// Snapshot of peers currently Alive.
    pub fn alive_peers(&self) -> BTreeSet<PeerId> {
        self.read_membership().list_alive_peers()
    }

    /// Snapshot of the membership table, sorted by peer id.
    pub fn membership_snapshot(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.read_membership().members().cloned().collect();
        members.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        members
    }

    /// Liveness state of one peer, if known.
    pub fn peer_state(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.read_membership().state_of(peer_id)
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }

    /// Readings buffered and not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).buffer.len()
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn read_membership(&self) -> std::sync::RwLockReadGuard<'_, Membership> {
        self.membership.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_membership(&self) -> std::sync::RwLockWriteGuard<'_, Membership> {
        self.membership.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn send(&self, msg: &BusMessage) -> Result<(), ChannelError> {
        let frame = msg.to_json()?;
        self.transport.broadcast(&frame).await?;
        Ok(())
    }

    fn pop_buffered(&self) -> Option<Reading> {
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).buffer.pop()
    }

    /// Process frames the transport already holds, without waiting.
    async fn drain_ready(&self) -> Result<usize, ChannelError> {
        let mut processed = 0;
        while processed < DRAIN_LIMIT {
            match self.transport.try_recv() {
                Ok(Some(frame)) => {
                    self.handle_frame(&frame).await;
                    processed += 1;
                }
                Ok(None) => break,
                Err(_) if self.is_closed() => return Err(ChannelError::Closed),
                Err(e) => {
                    warn!("Receive failed for {}: {}", self.local, e);
                    break;
                }
            }
        }
        Ok(processed)
    }

    async fn next_frame(&self, deadline: Instant) -> Result<Frame, ChannelError> {
        match tokio::time::timeout_at(deadline, self.transport.recv()).await {
            Ok(Ok(frame)) => Ok(Frame::Data(frame)),
            Err(_) => Ok(Frame::TimedOut),
            Ok(Err(_)) if self.is_closed() => Err(ChannelError::Closed),
            Ok(Err(e)) => {
                warn!("Receive failed for {}: {}", self.local, e);
                // Keep the caller's cadence instead of spinning on a broken medium
                tokio::time::sleep_until(deadline).await;
                Ok(Frame::Failed)
            }
        }
    }

    fn expire_stale(&self) {
        let now = self.now_ms();
        let events = self.write_membership().expire_stale(now);
        if events.is_empty() {
            return;
        }

        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            match event {
                MembershipEvent::PeerLost { peer_id, last_seen } => {
                    info!(
                        "Peer lost: {} (silent for {} ms)",
                        peer_id,
                        now.saturating_sub(last_seen)
                    );
                }
                MembershipEvent::PeerRemoved { peer_id, .. } => {
                    inbox.last_seq.remove(&peer_id);
                    debug!("Peer removed from membership: {}", peer_id);
                }
            }
        }
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let Some(msg) = BusMessage::from_json(frame) else {
            Counters::bump(&self.counters.malformed);
            debug!("Dropping malformed frame ({} bytes)", frame.len());
            return;
        };

        let from = msg.from().clone();
        let instance = msg.instance();

        // Our own frame looped back by the medium
        if from == self.local && instance == self.instance {
            Counters::bump(&self.counters.self_dropped);
            return;
        }

        let now = self.now_ms();
        let outcome = {
            let mut membership = self.write_membership();
            match &msg {
                BusMessage::Leave { .. } => {
                    if membership.on_peer_left(&from, instance, now) {
                        info!("Peer left: {}", from);
                    }
                    None
                }
                _ => Some(membership.on_peer_seen(&from, instance, now)),
            }
        };

        match outcome {
            Some(SeenOutcome::Discovered) => {
                info!("Discovered peer: {}", from);
                // Reply right away so the new peer can confirm us without waiting a heartbeat
                if let Err(e) = self.announce().await {
                    debug!("Failed to answer discovery of {}: {}", from, e);
                }
            }
            Some(SeenOutcome::Promoted) => info!("Peer alive: {}", from),
            Some(SeenOutcome::Revived) => info!("Peer back: {}", from),
            _ => {}
        }

        let BusMessage::Data {
            seq,
            recipients,
            reading,
            ..
        } = msg
        else {
            return;
        };

        // Another process using our id, or a reading claiming to be ours
        if from == self.local || *reading.sensor_id() == self.local {
            Counters::bump(&self.counters.self_dropped);
            return;
        }

        if !recipients.contains(&self.local) {
            Counters::bump(&self.counters.foreign_dropped);
            return;
        }

        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((last_instance, last_seq)) = inbox.last_seq.get(&from)
            && *last_instance == instance
            && seq <= *last_seq
        {
            Counters::bump(&self.counters.duplicates_dropped);
            debug!("Dropping stale frame from {} (seq {} <= {})", from, seq, last_seq);
            return;
        }
        inbox.last_seq.insert(from.clone(), (instance, seq));

        if let Some(evicted) = inbox.buffer.push(&from, reading) {
            Counters::bump(&self.counters.evicted);
            debug!("Receive buffer full for {}, dropped oldest ({})", from, evicted);
        }
        Counters::bump(&self.counters.received);
    }
}
