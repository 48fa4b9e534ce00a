//! Peer registry, the local view of cluster membership.
//!
//! Keyed on peer id. Populated by merging announcements and read by
//! callers as ordered snapshots. Entries are never expired on silence;
//! staleness shows up only as a rising suspicion score on the peer's
//! liveness handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use disco_core::wire::PeerInfo;

use crate::liveness::{LivenessFactory, LivenessHandle};

/// One member of the cluster as seen from here.
#[derive(Debug, Clone)]
pub struct Peer {
    id: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub info: Option<Value>,
    liveness: LivenessHandle,
    /// Registry insertion order. Assigned on insert.
    seq: u64,
}

impl Peer {
    /// Build a peer. The id is mandatory.
    pub fn new(id: impl Into<String>, liveness: LivenessHandle) -> Result<Self, PeerError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PeerError::MissingId);
        }
        Ok(Self {
            id,
            host: None,
            port: None,
            info: None,
            liveness,
            seq: 0,
        })
    }

    /// Build a peer from an announcement's sender fields.
    pub fn from_info(info: &PeerInfo, liveness: LivenessHandle) -> Result<Self, PeerError> {
        let mut peer = Self::new(info.id.clone(), liveness)?;
        peer.host = info.host.clone();
        peer.port = info.port;
        peer.info = info.info.clone();
        Ok(peer)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The sender fields this peer would announce.
    pub fn to_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            info: self.info.clone(),
        }
    }

    pub fn liveness(&self) -> &LivenessHandle {
        &self.liveness
    }

    pub fn report_heartbeat(&self) {
        self.liveness.report_heartbeat();
    }

    pub fn suspicion_score(&self) -> f64 {
        self.liveness.suspicion_score()
    }

    /// Overwrite the mutable fields from a newer announcement and record a heartbeat.
    fn merge_from(&mut self, observed: &PeerInfo) {
        self.host = observed.host.clone();
        self.port = observed.port;
        self.info = observed.info.clone();
        self.liveness.report_heartbeat();
    }
}

/// What `PeerRegistry::merge` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First time this id was seen.
    Joined,
    /// Existing entry updated in place.
    Updated,
}

/// Shared between the coordinator's dispatcher and callers.
///
/// Cloning is cheap and yields a handle to the same registry.
/// DashMap gives per-entry locking: a reader never sees a half-merged peer
/// and two merges for one id cannot both insert.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<DashMap<String, Peer>>,
    next_seq: Arc<AtomicU64>,
    liveness: Arc<dyn LivenessFactory>,
}

impl PeerRegistry {
    /// Create a registry holding only `local`.
    pub fn with_self(local: Peer, liveness: Arc<dyn LivenessFactory>) -> Self {
        let registry = Self {
            peers: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
            liveness,
        };
        registry.add(local);
        registry
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn find(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Insert-or-update from an observed announcement.
    ///
    /// Unknown id: a new peer joins with a fresh liveness handle.
    /// Known id: host/port/info are replaced in place and a heartbeat is reported.
    /// A heartbeat is recorded on join as well so the detector has a baseline.
    pub fn merge(&self, observed: &PeerInfo) -> Result<MergeOutcome, PeerError> {
        if observed.id.is_empty() {
            return Err(PeerError::MissingId);
        }

        match self.peers.entry(observed.id.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().merge_from(observed);
                Ok(MergeOutcome::Updated)
            }
            Entry::Vacant(entry) => {
                let mut peer = Peer::from_info(observed, self.liveness.create())?;
                peer.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                peer.report_heartbeat();
                entry.insert(peer);
                Ok(MergeOutcome::Joined)
            }
        }
    }

    /// Insert or replace a peer as-is, bypassing merge semantics.
    pub fn add(&self, mut peer: Peer) {
        peer.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.peers.insert(peer.id.clone(), peer);
    }

    /// Insert a peer only if its id is unknown. An existing entry, and its
    /// liveness history, is left untouched. Returns whether it was inserted.
    pub fn insert_new(&self, info: &PeerInfo) -> Result<bool, PeerError> {
        if info.id.is_empty() {
            return Err(PeerError::MissingId);
        }
        match self.peers.entry(info.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                let mut peer = Peer::from_info(info, self.liveness.create())?;
                peer.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                entry.insert(peer);
                Ok(true)
            }
        }
    }

    /// Remove a peer. Returns the removed entry.
    pub fn remove(&self, id: &str) -> Option<Peer> {
        self.peers.remove(id).map(|(_, peer)| peer)
    }

    /// All peers in insertion order.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by_key(|p| p.seq);
        peers
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.peers.len())
            .finish()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer id is required")]
    MissingId,
}
