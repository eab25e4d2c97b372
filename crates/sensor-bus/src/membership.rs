//! Membership table for discovered peers.
//!
//! Discovery is implicit: every frame received from a peer counts as a
//! liveness signal. The table tracks, per peer:
//! - When it was first and last heard from
//! - Its liveness state (Discovering, Alive, Lost)
//! - The process instance it last spoke with (duplicate-id detection)
//!
//! Time is passed in explicitly as milliseconds so the state machine can be
//! driven deterministically from tests.

use crate::message::BusMessage;
use crate::peer_id::{InstanceId, PeerId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("removal grace ({removal_grace:?}) is shorter than liveness timeout ({liveness_timeout:?})")]
    GraceShorterThanTimeout {
        liveness_timeout: Duration,
        removal_grace: Duration,
    },
}

/// Timing parameters for liveness tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipConfig {
    /// No contact for this long → Lost (default: 6s)
    pub liveness_timeout: Duration,
    /// No contact for this long → removed from the table (default: 30s)
    pub removal_grace: Duration,
    /// How often a node re-announces itself (default: 1s)
    pub announce_interval: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(6),
            removal_grace: Duration::from_secs(30),
            announce_interval: Duration::from_secs(1),
        }
    }
}

impl MembershipConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_timeout.is_zero() {
            return Err(ConfigError::Zero("liveness timeout"));
        }
        if self.announce_interval.is_zero() {
            return Err(ConfigError::Zero("announce interval"));
        }
        if self.removal_grace < self.liveness_timeout {
            return Err(ConfigError::GraceShorterThanTimeout {
                liveness_timeout: self.liveness_timeout,
                removal_grace: self.removal_grace,
            });
        }
        Ok(())
    }
}

/// Liveness state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Heard from once; not yet a fan-out target
    Discovering,
    /// Heard from repeatedly and recently
    Alive,
    /// No contact within the liveness timeout, or announced departure
    Lost,
}

/// A record in the membership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub peer_id: PeerId,
    /// Process instance we last heard from under this id
    pub instance: InstanceId,
    pub state: PeerState,
    /// First contact (milliseconds)
    pub first_seen: u64,
    /// Most recent contact (milliseconds)
    pub last_seen: u64,
    /// Set once two different processes have spoken under this id
    pub conflict: bool,
}

/// Result of recording contact with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenOutcome {
    /// Our own frame (same id, same instance)
    Ignored,
    /// First contact (or first contact from a restarted instance); Discovering
    Discovered,
    /// Discovering → Alive
    Promoted,
    /// Lost → Alive
    Revived,
    /// Already alive; last_seen refreshed
    Refreshed,
    /// Two processes share this id (misconfiguration)
    Conflict,
}

/// State change reported by `expire_stale`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    PeerLost { peer_id: PeerId, last_seen: u64 },
    PeerRemoved { peer_id: PeerId, last_seen: u64 },
}

/// Membership table tracking all known peers.
pub struct Membership {
    local_peer_id: PeerId,
    local_instance: InstanceId,
    config: MembershipConfig,
    members: HashMap<PeerId, Member>,
    /// Frames from other processes using our own id
    local_conflicts: u64,
    /// Instances of those processes, each reported once
    foreign_instances: HashSet<InstanceId>,
}

impl Membership {
    pub fn new(local_peer_id: PeerId, local_instance: InstanceId, config: MembershipConfig) -> Self {
        Self {
            local_peer_id,
            local_instance,
            config,
            members: HashMap::new(),
            local_conflicts: 0,
            foreign_instances: HashSet::new(),
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn local_instance(&self) -> InstanceId {
        self.local_instance
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Presence announcement for this node.
    pub fn announce(&self) -> BusMessage {
        BusMessage::announce(self.local_peer_id.clone(), self.local_instance)
    }

    /// Record contact with a peer.
    pub fn on_peer_seen(&mut self, peer_id: &PeerId, instance: InstanceId, now_ms: u64) -> SeenOutcome {
        if *peer_id == self.local_peer_id {
            if instance == self.local_instance {
                return SeenOutcome::Ignored;
            }
            // Another process is running under our name
            self.local_conflicts += 1;
            if self.foreign_instances.insert(instance) {
                tracing::warn!(
                    "Configuration error: another node (instance {}) is using our id {}",
                    instance,
                    peer_id
                );
            }
            return SeenOutcome::Conflict;
        }

        let Some(member) = self.members.get_mut(peer_id) else {
            self.members.insert(
                peer_id.clone(),
                Member {
                    peer_id: peer_id.clone(),
                    instance,
                    state: PeerState::Discovering,
                    first_seen: now_ms,
                    last_seen: now_ms,
                    conflict: false,
                },
            );
            return SeenOutcome::Discovered;
        };

        // Last writer wins for last_seen, even across instances
        member.last_seen = member.last_seen.max(now_ms);

        if member.instance != instance && member.state == PeerState::Lost {
            // Restarted after leaving or timing out
            member.instance = instance;
            member.state = PeerState::Discovering;
            member.first_seen = now_ms;
            return SeenOutcome::Discovered;
        }

        if member.instance != instance {
            if !member.conflict {
                tracing::warn!(
                    "Configuration error: peer id {} used by two processes ({} and {})",
                    peer_id,
                    member.instance,
                    instance
                );
            }
            member.instance = instance;
            member.conflict = true;
            member.state = PeerState::Alive;
            return SeenOutcome::Conflict;
        }

        match member.state {
            PeerState::Discovering => {
                member.state = PeerState::Alive;
                SeenOutcome::Promoted
            }
            PeerState::Lost => {
                member.state = PeerState::Alive;
                SeenOutcome::Revived
            }
            PeerState::Alive => SeenOutcome::Refreshed,
        }
    }

    /// Record a graceful departure. Returns true if the peer was known and not yet lost.
    pub fn on_peer_left(&mut self, peer_id: &PeerId, instance: InstanceId, now_ms: u64) -> bool {
        if let Some(member) = self.members.get_mut(peer_id)
            && member.instance == instance
            && member.state != PeerState::Lost
        {
            member.state = PeerState::Lost;
            member.last_seen = member.last_seen.max(now_ms);
            return true;
        }
        false
    }

    /// Peers currently eligible for fan-out.
    pub fn list_alive_peers(&self) -> BTreeSet<PeerId> {
        self.members
            .values()
            .filter(|m| m.state == PeerState::Alive)
            .map(|m| m.peer_id.clone())
            .collect()
    }

    /// Age out peers that have gone quiet.
    ///
    /// Peers silent for longer than the liveness timeout become Lost; peers
    /// silent for longer than the removal grace are dropped from the table.
    pub fn expire_stale(&mut self, now_ms: u64) -> Vec<MembershipEvent> {
        let timeout_ms = self.config.liveness_timeout.as_millis() as u64;
        let grace_ms = self.config.removal_grace.as_millis() as u64;
        let mut events = Vec::new();

        self.members.retain(|peer_id, member| {
            let silent_for = now_ms.saturating_sub(member.last_seen);
            if silent_for > grace_ms {
                events.push(MembershipEvent::PeerRemoved {
                    peer_id: peer_id.clone(),
                    last_seen: member.last_seen,
                });
                return false;
            }
            if silent_for > timeout_ms && member.state != PeerState::Lost {
                member.state = PeerState::Lost;
                events.push(MembershipEvent::PeerLost {
                    peer_id: peer_id.clone(),
                    last_seen: member.last_seen,
                });
            }
            true
        });

        events
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Member> {
        self.members.get(peer_id)
    }

    pub fn state_of(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.members.get(peer_id).map(|m| m.state)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Number of known peers (excluding ourselves).
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// How many frames from other processes claiming our own id were seen.
    pub fn local_conflicts(&self) -> u64 {
        self.local_conflicts
    }

    /// How many distinct processes were seen using our own id.
    pub fn conflicting_instances(&self) -> usize {
        self.foreign_instances.len()
    }
}
