//! The tagged envelope set carried on the bus's single topic.
//!
//! Every coordination message — election, voting, commit, search — is one
//! variant here, discriminated on the wire by a `type` field. Unknown
//! variants and malformed JSON are dropped by the caller (see
//! [`crate::BusGateway::subscribe`]); this enum only has to describe what
//! we understand.

use chrono::{DateTime, Utc};
use catalog_core::{CatalogEntry, NodeState, PeerId, SearchHit, Term};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "peer_heartbeat")]
    PeerHeartbeat {
        peer_id: PeerId,
        state: NodeState,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "leader_heartbeat")]
    LeaderHeartbeat {
        leader_id: PeerId,
        term: Term,
        timestamp: DateTime<Utc>,
        pending_proposals: Vec<PendingProposalSummary>,
        total_confirmed: usize,
        total_peers: usize,
    },

    #[serde(rename = "request_vote")]
    RequestVote {
        candidate_id: PeerId,
        term: Term,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "vote_response")]
    VoteResponse {
        voter_id: PeerId,
        candidate_id: PeerId,
        term: Term,
        vote_granted: bool,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "document_proposal")]
    DocumentProposal {
        doc_id: Uuid,
        filename: String,
        total_peers: usize,
        required_votes: usize,
        timestamp: DateTime<Utc>,
        from_peer: PeerId,
    },

    #[serde(rename = "peer_vote")]
    PeerVote {
        doc_id: Uuid,
        vote: VoteKind,
        peer_id: PeerId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "document_approved")]
    DocumentApproved {
        doc_id: Uuid,
        filename: String,
        cid: String,
        embedding_cid: String,
        version: u64,
        votes_approve: usize,
        votes_reject: usize,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "document_rejected")]
    DocumentRejected {
        doc_id: Uuid,
        filename: String,
        votes_approve: usize,
        votes_reject: usize,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "version_confirmation_request")]
    VersionConfirmationRequest {
        version: u64,
        documents: Vec<CatalogEntry>,
        cid: String,
        embedding_cid: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "version_confirmation")]
    VersionConfirmation {
        peer_id: PeerId,
        version: u64,
        hash: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "vector_commit")]
    VectorCommit {
        version: u64,
        hash: String,
        timestamp: DateTime<Utc>,
        leader_id: PeerId,
    },

    #[serde(rename = "search_request")]
    SearchRequest {
        search_id: Uuid,
        token: Uuid,
        prompt: String,
        top_k: usize,
        target_peer: PeerId,
        leader_id: PeerId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "search_result_ready")]
    SearchResultReady {
        search_id: Uuid,
        peer_id: PeerId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "search_result_request")]
    SearchResultRequest {
        search_id: Uuid,
        from_leader: PeerId,
        target_peer: PeerId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "search_result_response")]
    SearchResultResponse {
        search_id: Uuid,
        peer_id: PeerId,
        results: Vec<SearchHit>,
        timestamp: DateTime<Utc>,
    },
}

/// One row of the leader heartbeat's `pending_proposals` list: enough for a
/// follower to display cluster progress without holding the full session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingProposalSummary {
    pub doc_id: Uuid,
    pub filename: String,
    pub votes_approve: usize,
    pub required_votes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Approve,
    Reject,
}

impl Envelope {
    /// The `type` discriminator this envelope serializes under, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::PeerHeartbeat { .. } => "peer_heartbeat",
            Envelope::LeaderHeartbeat { .. } => "leader_heartbeat",
            Envelope::RequestVote { .. } => "request_vote",
            Envelope::VoteResponse { .. } => "vote_response",
            Envelope::DocumentProposal { .. } => "document_proposal",
            Envelope::PeerVote { .. } => "peer_vote",
            Envelope::DocumentApproved { .. } => "document_approved",
            Envelope::DocumentRejected { .. } => "document_rejected",
            Envelope::VersionConfirmationRequest { .. } => "version_confirmation_request",
            Envelope::VersionConfirmation { .. } => "version_confirmation",
            Envelope::VectorCommit { .. } => "vector_commit",
            Envelope::SearchRequest { .. } => "search_request",
            Envelope::SearchResultReady { .. } => "search_result_ready",
            Envelope::SearchResultRequest { .. } => "search_result_request",
            Envelope::SearchResultResponse { .. } => "search_result_response",
        }
    }
}
