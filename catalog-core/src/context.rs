//! The single shared node context.
//!
//! Every mutable piece of coordination state lives behind one
//! `parking_lot::Mutex`. Callers take the lock, mutate in-memory fields,
//! and drop it before doing anything that can suspend (bus publish,
//! storage HTTP calls, disk I/O) — `parking_lot::Mutex` has no async API,
//! so holding it across an `.await` is a compile error, not a code-review
//! finding.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::embed::Embedder;
use crate::index::VectorIndex;
use crate::registry::PeerRegistry;
use crate::types::{
    Catalog, ConfirmationAggregate, NodeState, PeerId, SearchRequest, SearchResult, StagedCommit, Term,
    VotingSession,
};

/// Everything that changes as the protocol runs, guarded by one lock.
pub struct NodeInner {
    pub state: NodeState,
    pub term: Term,
    pub voted_for: Option<PeerId>,
    pub leader_id: Option<PeerId>,
    pub last_leader_heartbeat: Option<Instant>,
    /// Term of the election this node is currently running as candidate,
    /// kept separate from `term` so a late vote-response addressed to a
    /// stale election is rejected even if `term` has not moved since.
    pub election_term: Option<Term>,
    pub votes_received: HashSet<PeerId>,
    pub catalog: Catalog,
    pub voting_sessions: HashMap<Uuid, VotingSession>,
    pub staged_commits: HashMap<String, StagedCommit>,
    pub confirmations: HashMap<u64, ConfirmationAggregate>,
    pub search_requests: HashMap<Uuid, SearchRequest>,
    pub search_results: HashMap<Uuid, SearchResult>,
    pub round_robin_cursor: usize,
    /// Set while this node is leader and the HTTP surface is running;
    /// sending on it tells the server to shut down.
    pub http_shutdown: Option<oneshot::Sender<()>>,
    /// The serving task spawned on leader transition, joined with a bounded
    /// grace period when this node is demoted or the process shuts down.
    pub http_server_handle: Option<JoinHandle<()>>,
    /// Current confirmed-document similarity index. Replaced wholesale (never
    /// mutated in place) by catalog-commit whenever a new version is adopted.
    pub similarity_index: Arc<VectorIndex>,
}

impl NodeInner {
    fn new(catalog: Catalog) -> Self {
        Self {
            state: NodeState::Follower,
            term: 0,
            voted_for: None,
            leader_id: None,
            last_leader_heartbeat: None,
            election_term: None,
            votes_received: HashSet::new(),
            catalog,
            voting_sessions: HashMap::new(),
            staged_commits: HashMap::new(),
            confirmations: HashMap::new(),
            search_requests: HashMap::new(),
            search_results: HashMap::new(),
            round_robin_cursor: 0,
            http_shutdown: None,
            http_server_handle: None,
            similarity_index: Arc::new(VectorIndex::empty()),
        }
    }
}

/// Handle shared across every background task and HTTP handler. Cheap to
/// clone (wraps `Arc` internally via its callers holding `Arc<NodeContext>`).
pub struct NodeContext {
    pub self_id: PeerId,
    pub started_at: Instant,
    pub peers: PeerRegistry,
    /// The embedding function collaborator (spec.md §1, §6). Immutable for
    /// the life of the node, so it lives outside the mutex.
    pub embedder: Arc<dyn Embedder>,
    /// Cleared on graceful shutdown so background loops can wind down
    /// without tearing down the process out from under an in-flight I/O
    /// call. Plain `AtomicBool`, not mutex-guarded state — it is only ever
    /// read-then-stop, never part of a read-modify-write sequence.
    running: AtomicBool,
    inner: Mutex<NodeInner>,
}

impl NodeContext {
    pub fn new(self_id: PeerId, catalog: Catalog, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            peers: PeerRegistry::new(self_id.clone()),
            self_id,
            started_at: Instant::now(),
            embedder,
            running: AtomicBool::new(true),
            inner: Mutex::new(NodeInner::new(catalog)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Run `f` with exclusive access to the coordination state. `f` must
    /// not perform I/O or hold the guard across an await point — the
    /// borrow checker enforces the latter since `MutexGuard` is `!Send`.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut NodeInner) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    pub fn state(&self) -> NodeState {
        self.with_lock(|inner| inner.state)
    }

    pub fn term(&self) -> Term {
        self.with_lock(|inner| inner.term)
    }

    pub fn is_leader(&self) -> bool {
        self.state() == NodeState::Leader
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.with_lock(|inner| inner.leader_id.clone())
    }

    pub fn similarity_index(&self) -> Arc<VectorIndex> {
        self.with_lock(|inner| Arc::clone(&inner.similarity_index))
    }

    pub fn replace_similarity_index(&self, index: VectorIndex) {
        self.with_lock(|inner| inner.similarity_index = Arc::new(index));
    }
}
