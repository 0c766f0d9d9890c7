//! Shared data model for the catalog coordination protocol.
//!
//! These types are intentionally thin: every field here is either placed on
//! the wire inside a bus envelope or persisted in the catalog file, so
//! changing one has cluster-wide consequences.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, stable identifier for a peer. Assigned by the storage layer on
/// process start (its own peer identity); never generated locally.
pub type PeerId = String;

/// Raft-style election term. Monotonically increasing, never reused.
pub type Term = u64;

/// The three states a node can be in with respect to the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState::Follower
    }
}

/// A single document admitted to the catalog: its content CID, the CID of
/// its embedding vector, and provenance metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub cid: String,
    pub filename: String,
    pub added_at: DateTime<Utc>,
    pub embedding_cid: String,
    /// Path, relative to the node's embeddings directory, of the local
    /// embedding file keyed by `cid`. Derivable from `cid` alone, but kept
    /// explicit per the data model so a rebuilt index has no other source
    /// of truth to consult.
    pub local_embedding_path: String,
}

/// The replicated, versioned catalog of confirmed documents. Persisted to
/// disk as a single JSON file and replaced atomically on commit adoption.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Catalog {
    pub version_confirmed: u64,
    pub documents_confirmed: Vec<CatalogEntry>,
    pub last_updated: DateTime<Utc>,
}

impl Catalog {
    pub fn contains_cid(&self, cid: &str) -> bool {
        self.documents_confirmed.iter().any(|e| e.cid == cid)
    }
}

/// Outcome of a document's approval vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingStatus {
    PendingApproval,
    Approved,
    Rejected,
}

/// A per-document approval session, owned by the leader but mirrored (votes
/// only, no terminal transitions) on every follower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingSession {
    pub doc_id: Uuid,
    pub filename: String,
    pub status: VotingStatus,
    /// Live cluster size observed when this session was created; the
    /// quorum threshold is frozen at creation so it cannot shift underfoot
    /// while votes are in flight.
    pub cluster_size_snapshot: usize,
    pub required_votes: usize,
    pub votes_approve: HashSet<PeerId>,
    pub votes_reject: HashSet<PeerId>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl VotingSession {
    pub fn new(doc_id: Uuid, filename: String, cluster_size_snapshot: usize) -> Self {
        Self {
            doc_id,
            filename,
            status: VotingStatus::PendingApproval,
            cluster_size_snapshot,
            required_votes: cluster_size_snapshot / 2 + 1,
            votes_approve: HashSet::new(),
            votes_reject: HashSet::new(),
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    /// Idempotent, last-writer-wins vote merge: a voter can appear in at
    /// most one of `votes_approve`/`votes_reject`, so a flapping or
    /// redelivered vote cannot be counted twice or counted on both sides.
    pub fn add_vote(&mut self, voter: PeerId, approve: bool) {
        self.votes_approve.remove(&voter);
        self.votes_reject.remove(&voter);
        if approve {
            self.votes_approve.insert(voter);
        } else {
            self.votes_reject.insert(voter);
        }
    }

    pub fn is_decided(&self) -> bool {
        self.status != VotingStatus::PendingApproval
    }
}

/// A catalog version proposed by the leader but not yet adopted, staged
/// in-memory on each peer (including the leader itself) awaiting a matching
/// `vector_commit`. Keyed by the just-added document's file CID.
#[derive(Debug, Clone)]
pub struct StagedCommit {
    pub version: u64,
    pub hash: String,
    pub documents: Vec<CatalogEntry>,
    pub embedding_cid: String,
    pub staged_at: DateTime<Utc>,
}

/// The leader's accumulating set of per-peer hash confirmations for a
/// proposed version, used to detect when a majority agree on the same hash.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationAggregate {
    /// (peer_id, hash) pairs, in arrival order. A peer may appear more than
    /// once if it redelivers; counting is done per distinct peer.
    pub entries: Vec<(PeerId, String)>,
    pub created_at: DateTime<Utc>,
}

impl ConfirmationAggregate {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Count of distinct peers that reported `hash`.
    pub fn agreeing_peers(&self, hash: &str) -> usize {
        self.entries
            .iter()
            .filter(|(_, h)| h == hash)
            .map(|(peer, _)| peer)
            .collect::<HashSet<_>>()
            .len()
    }

    /// The hash with the most distinct agreeing peers, if any confirmations
    /// have arrived yet.
    pub fn majority_hash(&self) -> Option<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (_, hash) in &self.entries {
            *counts.entry(hash.as_str()).or_default() += 1;
        }
        counts.into_iter().max_by_key(|(_, count)| *count).map(|(hash, _)| hash.to_string())
    }
}

/// A leader-brokered similarity search request: who is assigned to execute
/// it and the token gating subsequent polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub search_id: Uuid,
    pub token: Uuid,
    pub target_peer: PeerId,
    pub prompt: String,
    pub top_k: usize,
    pub created_at: DateTime<Utc>,
}

/// A single similarity hit, ranked nearest-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub rank: usize,
    pub distance: f32,
    pub cid: String,
    pub filename: String,
    pub added_at: DateTime<Utc>,
}

/// The result of a search request, mirrored from the executing peer to the
/// leader over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub search_id: Uuid,
    pub origin_peer: PeerId,
    pub hits: Vec<SearchHit>,
}
