//! Voting Core: the per-document approval session (spec.md §4.5).
//!
//! Session creation and auto-voting run the same code path on every node,
//! including the leader: a `document_proposal` echo to its own sender is
//! one of the envelope types explicitly allowed to round-trip (spec.md
//! §6.1), so there is no separate "I am the leader, skip the envelope"
//! branch. Only [`VotingCore::try_resolve`] is leader-only — it is the one
//! place a terminal transition (Approved/Rejected) is made.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use catalog_bus::{BusGateway, Envelope, VoteKind};
use catalog_commit::CommitCore;
use catalog_core::{CatalogResult, NodeContext, PeerId, TimingSettings, VotingSession, VotingStatus};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

/// What an HTTP upload handler needs to build its response body.
#[derive(Debug, Clone)]
pub struct UploadAck {
    pub doc_id: Uuid,
    pub filename: String,
    pub required_votes: usize,
    pub total_peers: usize,
}

pub struct VotingCore {
    ctx: Arc<NodeContext>,
    bus: Arc<BusGateway>,
    commit: Arc<CommitCore>,
    timing: TimingSettings,
    pending_uploads_dir: String,
}

impl VotingCore {
    pub fn new(
        ctx: Arc<NodeContext>,
        bus: Arc<BusGateway>,
        commit: Arc<CommitCore>,
        timing: TimingSettings,
        pending_uploads_dir: String,
    ) -> Self {
        Self { ctx, bus, commit, timing, pending_uploads_dir }
    }

    /// Leader-facing entry point for `POST /upload`. Persists the raw bytes
    /// and broadcasts the proposal; the session itself is created uniformly
    /// by [`Self::on_document_proposal`] once this node observes its own
    /// broadcast come back off the bus.
    pub async fn submit_upload(&self, filename: String, bytes: Vec<u8>) -> CatalogResult<UploadAck> {
        if !self.ctx.is_leader() {
            return Err(catalog_core::CatalogError::PolicyFailure("not leader".into()));
        }

        let doc_id = Uuid::new_v4();
        let total_peers = self.ctx.peers.size();
        let required_votes = total_peers / 2 + 1;

        tokio::fs::create_dir_all(&self.pending_uploads_dir).await.map_err(catalog_core::CatalogError::Io)?;
        let path = Path::new(&self.pending_uploads_dir).join(doc_id.to_string());
        tokio::fs::write(&path, &bytes).await.map_err(catalog_core::CatalogError::Io)?;

        self.bus
            .publish(&Envelope::DocumentProposal {
                doc_id,
                filename: filename.clone(),
                total_peers,
                required_votes,
                timestamp: Utc::now(),
                from_peer: self.ctx.self_id.clone(),
            })
            .await;

        Ok(UploadAck { doc_id, filename, required_votes, total_peers })
    }

    /// Create the session (idempotently) and schedule this node's auto-vote.
    pub fn on_document_proposal(self: &Arc<Self>, doc_id: Uuid, filename: String, total_peers: usize, from_peer: PeerId) {
        let created = self.ctx.with_lock(|inner| {
            if inner.voting_sessions.contains_key(&doc_id) {
                false
            } else {
                inner.voting_sessions.insert(doc_id, VotingSession::new(doc_id, filename, total_peers));
                true
            }
        });
        if !created {
            return;
        }

        let delay = if from_peer == self.ctx.self_id {
            Duration::from_millis(self.timing.auto_vote_leader_delay_millis)
        } else {
            Duration::from_millis(self.timing.auto_vote_follower_delay_millis)
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.cast_local_vote(doc_id, true).await;
        });
    }

    /// Apply this node's own vote and publish it, same as an inbound vote.
    async fn cast_local_vote(&self, doc_id: Uuid, approve: bool) {
        self.apply_vote(doc_id, self.ctx.self_id.clone(), approve);
        self.bus
            .publish(&Envelope::PeerVote {
                doc_id,
                vote: if approve { VoteKind::Approve } else { VoteKind::Reject },
                peer_id: self.ctx.self_id.clone(),
                timestamp: Utc::now(),
            })
            .await;
        if self.ctx.is_leader() {
            self.try_resolve(doc_id).await;
        }
    }

    /// Mirror an inbound vote locally; only the leader attempts resolution.
    pub async fn on_peer_vote(&self, doc_id: Uuid, peer_id: PeerId, approve: bool) {
        self.apply_vote(doc_id, peer_id, approve);
        if self.ctx.is_leader() {
            self.try_resolve(doc_id).await;
        }
    }

    fn apply_vote(&self, doc_id: Uuid, peer_id: PeerId, approve: bool) -> bool {
        self.ctx.with_lock(|inner| match inner.voting_sessions.get_mut(&doc_id) {
            Some(session) => {
                session.add_vote(peer_id, approve);
                true
            }
            None => false,
        })
    }

    /// Leader-only: check whether `doc_id`'s session has reached quorum in
    /// either direction, and drive the terminal transition if so.
    async fn try_resolve(&self, doc_id: Uuid) {
        enum Outcome {
            None,
            Approved { filename: String, votes_approve: usize, votes_reject: usize },
            Rejected { filename: String, votes_approve: usize, votes_reject: usize },
        }

        let outcome = self.ctx.with_lock(|inner| {
            let Some(session) = inner.voting_sessions.get_mut(&doc_id) else { return Outcome::None };
            if session.is_decided() {
                return Outcome::None;
            }
            if session.votes_approve.len() >= session.required_votes {
                session.status = VotingStatus::Approved;
                session.decided_at = Some(Utc::now());
                Outcome::Approved {
                    filename: session.filename.clone(),
                    votes_approve: session.votes_approve.len(),
                    votes_reject: session.votes_reject.len(),
                }
            } else if session.votes_reject.len() >= session.required_votes {
                session.status = VotingStatus::Rejected;
                session.decided_at = Some(Utc::now());
                Outcome::Rejected {
                    filename: session.filename.clone(),
                    votes_approve: session.votes_approve.len(),
                    votes_reject: session.votes_reject.len(),
                }
            } else {
                Outcome::None
            }
        });

        match outcome {
            Outcome::None => {}
            Outcome::Approved { filename, votes_approve, votes_reject } => {
                self.ctx.with_lock(|inner| {
                    inner.voting_sessions.remove(&doc_id);
                });
                self.finish_approval(doc_id, filename, votes_approve, votes_reject).await;
            }
            Outcome::Rejected { filename, votes_approve, votes_reject } => {
                self.ctx.with_lock(|inner| {
                    inner.voting_sessions.remove(&doc_id);
                });
                self.finish_rejection(doc_id, filename, votes_approve, votes_reject).await;
            }
        }
    }

    async fn finish_approval(&self, doc_id: Uuid, filename: String, votes_approve: usize, votes_reject: usize) {
        let path = Path::new(&self.pending_uploads_dir).join(doc_id.to_string());
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(doc_id = %doc_id, error = %err, "pending upload missing on approval");
                return;
            }
        };

        match self.commit.ingest_and_propose(&filename, bytes).await {
            Ok(outcome) => {
                let _ = tokio::fs::remove_file(&path).await;
                info!(doc_id = %doc_id, version = outcome.version, "document approved and ingested");
                self.bus
                    .publish(&Envelope::DocumentApproved {
                        doc_id,
                        filename,
                        cid: outcome.cid,
                        embedding_cid: outcome.embedding_cid,
                        version: outcome.version,
                        votes_approve,
                        votes_reject,
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            Err(err) => {
                warn!(doc_id = %doc_id, error = %err, "ingestion failed after approval");
            }
        }
    }

    async fn finish_rejection(&self, doc_id: Uuid, filename: String, votes_approve: usize, votes_reject: usize) {
        let path = Path::new(&self.pending_uploads_dir).join(doc_id.to_string());
        let _ = tokio::fs::remove_file(&path).await;
        self.bus
            .publish(&Envelope::DocumentRejected { doc_id, filename, votes_approve, votes_reject, timestamp: Utc::now() })
            .await;
    }

    /// Every node drops its mirrored session once the outcome is announced,
    /// rather than waiting out the full GC horizon.
    pub fn on_document_decided(&self, doc_id: Uuid) {
        self.ctx.with_lock(|inner| {
            inner.voting_sessions.remove(&doc_id);
        });
    }

    /// Drop sessions that were never decided within SESSION_TIMEOUT.
    pub fn gc_sessions(&self, timeout: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(300));
        self.ctx.with_lock(|inner| {
            inner.voting_sessions.retain(|_, session| session.created_at >= cutoff);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{Catalog, HashingEmbedder};
    use catalog_storage::{StorageClient, StorageClientConfig};

    fn test_storage() -> StorageClient {
        StorageClient::new(StorageClientConfig {
            base_url: "http://127.0.0.1:1/api/v0".to_string(),
            request_timeout: Duration::from_millis(50),
            retry_attempts: 1,
            retry_backoff: Duration::from_millis(1),
        })
    }

    fn test_voting(dir: &std::path::Path) -> Arc<VotingCore> {
        let ctx = Arc::new(NodeContext::new("self".into(), Catalog::default(), Arc::new(HashingEmbedder::default())));
        let bus = Arc::new(BusGateway::new(test_storage(), "test-topic"));
        let commit = Arc::new(catalog_commit::CommitCore::new(
            Arc::clone(&ctx),
            Arc::clone(&bus),
            test_storage(),
            catalog_commit::CommitPaths {
                catalog_path: dir.join("catalog.json").to_str().unwrap().to_string(),
                embeddings_dir: dir.join("embeddings").to_str().unwrap().to_string(),
                temp_embeddings_dir: dir.join("temp_embeddings").to_str().unwrap().to_string(),
                index_path: dir.join("index.json").to_str().unwrap().to_string(),
            },
        ));
        let timing = catalog_core::CatalogConfig::default().timing;
        Arc::new(VotingCore::new(ctx, bus, commit, timing, dir.join("pending_uploads").to_str().unwrap().to_string()))
    }

    #[tokio::test]
    async fn single_node_cluster_requires_one_vote() {
        let dir = tempfile::tempdir().unwrap();
        let voting = test_voting(dir.path());
        voting.ctx.with_lock(|i| i.state = catalog_core::NodeState::Leader);

        let doc_id = Uuid::new_v4();
        voting.ctx.with_lock(|inner| {
            inner.voting_sessions.insert(doc_id, VotingSession::new(doc_id, "a.txt".into(), 1));
        });

        voting.on_peer_vote(doc_id, "self".into(), true).await;

        assert!(voting.ctx.with_lock(|inner| !inner.voting_sessions.contains_key(&doc_id)));
    }

    #[tokio::test]
    async fn duplicate_vote_from_same_peer_does_not_double_count() {
        let dir = tempfile::tempdir().unwrap();
        let voting = test_voting(dir.path());
        let doc_id = Uuid::new_v4();
        voting.ctx.with_lock(|inner| {
            inner.voting_sessions.insert(doc_id, VotingSession::new(doc_id, "a.txt".into(), 3));
        });

        voting.on_peer_vote(doc_id, "peer-a".into(), true).await;
        voting.on_peer_vote(doc_id, "peer-a".into(), true).await;

        assert_eq!(voting.ctx.with_lock(|inner| inner.voting_sessions.get(&doc_id).unwrap().votes_approve.len()), 1);
    }

    #[tokio::test]
    async fn reject_quorum_removes_session_without_committing() {
        let dir = tempfile::tempdir().unwrap();
        let voting = test_voting(dir.path());
        voting.ctx.with_lock(|i| i.state = catalog_core::NodeState::Leader);

        let doc_id = Uuid::new_v4();
        voting.ctx.with_lock(|inner| {
            inner.voting_sessions.insert(doc_id, VotingSession::new(doc_id, "c.txt".into(), 3));
        });

        voting.on_peer_vote(doc_id, "peer-a".into(), false).await;
        voting.on_peer_vote(doc_id, "peer-b".into(), false).await;

        assert!(voting.ctx.with_lock(|inner| !inner.voting_sessions.contains_key(&doc_id)));
        assert_eq!(voting.ctx.with_lock(|inner| inner.catalog.version_confirmed), 0);
    }

    #[tokio::test]
    async fn non_leader_never_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let voting = test_voting(dir.path());
        let doc_id = Uuid::new_v4();
        voting.ctx.with_lock(|inner| {
            inner.voting_sessions.insert(doc_id, VotingSession::new(doc_id, "a.txt".into(), 1));
        });

        voting.on_peer_vote(doc_id, "self".into(), true).await;

        assert!(voting.ctx.with_lock(|inner| inner.voting_sessions.contains_key(&doc_id)));
    }

    #[tokio::test]
    async fn document_proposal_creates_session_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let voting = test_voting(dir.path());
        let doc_id = Uuid::new_v4();

        voting.on_document_proposal(doc_id, "a.txt".into(), 1, "self".into());
        voting.on_document_proposal(doc_id, "a.txt".into(), 1, "self".into());

        assert_eq!(voting.ctx.with_lock(|inner| inner.voting_sessions.len()), 1);
    }
}
