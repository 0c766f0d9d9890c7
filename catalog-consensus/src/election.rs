use std::sync::Arc;
use std::time::{Duration, Instant};

use catalog_bus::{BusGateway, Envelope};
use catalog_core::{NodeContext, NodeState, PeerId, Term, TimingSettings};
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::info;

/// Emitted whenever this node wins or loses leadership, so the binary crate
/// can start/stop the HTTP surface without this crate depending on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEvent {
    Elected { term: Term },
    Demoted,
}

/// Owns the election and heartbeat background tasks for one node.
pub struct ElectionCore {
    ctx: Arc<NodeContext>,
    bus: Arc<BusGateway>,
    timing: TimingSettings,
    leadership_tx: UnboundedSender<LeadershipEvent>,
}

impl ElectionCore {
    pub fn new(
        ctx: Arc<NodeContext>,
        bus: Arc<BusGateway>,
        timing: TimingSettings,
        leadership_tx: UnboundedSender<LeadershipEvent>,
    ) -> Self {
        Self { ctx, bus, timing, leadership_tx }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.ctx.self_id
    }

    /// Spawn the election-liveness task and the heartbeat task. Returns
    /// their join handles so the caller can await them at shutdown.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let election = Arc::clone(&self);
        let heartbeat = Arc::clone(&self);
        vec![
            tokio::spawn(async move { election.run_election_loop().await }),
            tokio::spawn(async move { heartbeat.run_heartbeat_loop().await }),
        ]
    }

    fn random_election_delay(&self) -> Duration {
        let min = self.timing.election_timeout_min_secs;
        let max = self.timing.election_timeout_max_secs.max(min + 1);
        let secs = rand::thread_rng().gen_range(min..=max);
        Duration::from_secs(secs)
    }

    /// Startup grace, then repeatedly: if we're a follower who hasn't heard
    /// from a leader within LEADER_TIMEOUT, run one election round.
    async fn run_election_loop(self: Arc<Self>) {
        tokio::time::sleep(self.random_election_delay()).await;

        loop {
            if self.ctx.state() != NodeState::Follower {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            let elapsed = self.ctx.with_lock(|inner| inner.last_leader_heartbeat.map(|t| t.elapsed()));
            let should_trigger = match elapsed {
                None => true,
                Some(e) => e >= self.timing.leader_timeout(),
            };

            if should_trigger {
                self.run_election_round().await;
                tokio::time::sleep(self.random_election_delay()).await;
            } else {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    async fn run_election_round(self: &Arc<Self>) {
        let term = self.ctx.with_lock(|inner| {
            inner.term += 1;
            inner.state = NodeState::Candidate;
            inner.voted_for = Some(self.ctx.self_id.clone());
            inner.votes_received.clear();
            inner.votes_received.insert(self.ctx.self_id.clone());
            inner.election_term = Some(inner.term);
            inner.term
        });

        info!(term, "starting election");
        self.bus
            .publish(&Envelope::RequestVote {
                candidate_id: self.ctx.self_id.clone(),
                term,
                timestamp: Utc::now(),
            })
            .await;

        let deadline = Instant::now() + self.timing.election_response_wait();
        loop {
            let (votes, quorum, still_candidate) = self.ctx.with_lock(|inner| {
                (
                    inner.votes_received.len(),
                    self.ctx.peers.quorum_size(),
                    inner.state == NodeState::Candidate && inner.election_term == Some(term),
                )
            });

            if !still_candidate {
                // A higher term pre-empted this election elsewhere.
                return;
            }
            if votes >= quorum {
                self.become_leader(term);
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!(term, "election timed out without a majority");
        self.ctx.with_lock(|inner| {
            if inner.state == NodeState::Candidate && inner.election_term == Some(term) {
                inner.state = NodeState::Follower;
                inner.voted_for = None;
                inner.election_term = None;
            }
        });
    }

    fn become_leader(self: &Arc<Self>, term: Term) {
        self.ctx.with_lock(|inner| {
            inner.state = NodeState::Leader;
            inner.leader_id = Some(self.ctx.self_id.clone());
            inner.election_term = None;
        });
        info!(term, "elected leader");
        let _ = self.leadership_tx.send(LeadershipEvent::Elected { term });
    }

    /// Grant or deny a vote request, per spec.md §4.3's vote semantics.
    pub async fn on_request_vote(&self, candidate_id: PeerId, term: Term, _timestamp: DateTime<Utc>) {
        self.ctx.peers.mark(&candidate_id);

        let (demoted_from_leader, should_grant) = self.ctx.with_lock(|inner| {
            if term > inner.term {
                let was_leader = inner.state == NodeState::Leader;
                inner.term = term;
                inner.state = NodeState::Follower;
                inner.voted_for = None;
                inner.leader_id = None;
                inner.election_term = None;
                (was_leader, true)
            } else if term < inner.term {
                (false, false)
            } else {
                let grant = match &inner.voted_for {
                    None => true,
                    Some(existing) => existing == &candidate_id,
                };
                if grant {
                    inner.voted_for = Some(candidate_id.clone());
                }
                (false, grant)
            }
        });

        if demoted_from_leader {
            let _ = self.leadership_tx.send(LeadershipEvent::Demoted);
        }

        if should_grant {
            self.bus
                .publish(&Envelope::VoteResponse {
                    voter_id: self.ctx.self_id.clone(),
                    candidate_id,
                    term,
                    vote_granted: true,
                    timestamp: Utc::now(),
                })
                .await;
        }
    }

    /// Tally a vote response addressed to us, if we are still the
    /// candidate of record for its term.
    pub fn on_vote_response(&self, voter_id: PeerId, candidate_id: &str, term: Term, vote_granted: bool) {
        if candidate_id != self.ctx.self_id || !vote_granted {
            return;
        }
        self.ctx.peers.mark(&voter_id);
        self.ctx.with_lock(|inner| {
            if inner.state == NodeState::Candidate && inner.election_term == Some(term) {
                inner.votes_received.insert(voter_id);
            }
        });
    }

    /// Observe a leader's heartbeat: track liveness, and demote ourselves
    /// if someone else is leading at a term at least as high as ours.
    pub async fn on_leader_heartbeat(&self, leader_id: PeerId, term: Term) {
        self.ctx.peers.mark(&leader_id);

        let demoted_from_leader = self.ctx.with_lock(|inner| {
            if term < inner.term {
                return false;
            }
            let was_leader = inner.state == NodeState::Leader && leader_id != self.ctx.self_id;
            if term > inner.term {
                inner.term = term;
            }
            if leader_id != self.ctx.self_id {
                inner.state = NodeState::Follower;
                inner.leader_id = Some(leader_id.clone());
                inner.last_leader_heartbeat = Some(Instant::now());
                inner.voted_for = None;
            }
            was_leader
        });

        if demoted_from_leader {
            info!(term, "observed a competing leader, stepping down");
            let _ = self.leadership_tx.send(LeadershipEvent::Demoted);
        }
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.timing.leader_heartbeat_interval());
        loop {
            interval.tick().await;
            self.ctx.peers.mark(&self.ctx.self_id);
            self.emit_heartbeat().await;
        }
    }

    async fn emit_heartbeat(&self) {
        let state = self.ctx.state();
        let envelope = if state == NodeState::Leader {
            let (term, pending, total_confirmed) = self.ctx.with_lock(|inner| {
                let pending = inner
                    .voting_sessions
                    .values()
                    .filter(|s| !s.is_decided())
                    .map(|s| catalog_bus::PendingProposalSummary {
                        doc_id: s.doc_id,
                        filename: s.filename.clone(),
                        votes_approve: s.votes_approve.len(),
                        required_votes: s.required_votes,
                    })
                    .collect();
                (inner.term, pending, inner.catalog.documents_confirmed.len())
            });
            Envelope::LeaderHeartbeat {
                leader_id: self.ctx.self_id.clone(),
                term,
                timestamp: Utc::now(),
                pending_proposals: pending,
                total_confirmed,
                total_peers: self.ctx.peers.size(),
            }
        } else {
            Envelope::PeerHeartbeat {
                peer_id: self.ctx.self_id.clone(),
                state,
                timestamp: Utc::now(),
            }
        };
        self.bus.publish(&envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::Catalog;
    use catalog_storage::{StorageClient, StorageClientConfig};
    use tokio::sync::mpsc;

    fn test_core(self_id: &str) -> (Arc<ElectionCore>, mpsc::UnboundedReceiver<LeadershipEvent>) {
        let storage = StorageClient::new(StorageClientConfig {
            base_url: "http://127.0.0.1:1/api/v0".to_string(),
            request_timeout: Duration::from_millis(50),
            retry_attempts: 1,
            retry_backoff: Duration::from_millis(1),
        });
        let bus = Arc::new(BusGateway::new(storage, "test-topic"));
        let ctx = Arc::new(NodeContext::new(
            self_id.to_string(),
            Catalog::default(),
            Arc::new(catalog_core::HashingEmbedder::default()),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let timing = catalog_core::CatalogConfig::default().timing;
        (Arc::new(ElectionCore::new(ctx, bus, timing, tx)), rx)
    }

    #[tokio::test]
    async fn grants_one_vote_per_term() {
        let (core, _rx) = test_core("self");
        core.on_request_vote("peer-a".into(), 1, Utc::now()).await;
        assert_eq!(core.ctx.with_lock(|i| i.voted_for.clone()), Some("peer-a".to_string()));

        core.on_request_vote("peer-b".into(), 1, Utc::now()).await;
        assert_eq!(core.ctx.with_lock(|i| i.voted_for.clone()), Some("peer-a".to_string()));
    }

    #[tokio::test]
    async fn higher_term_clears_prior_vote() {
        let (core, _rx) = test_core("self");
        core.on_request_vote("peer-a".into(), 1, Utc::now()).await;
        core.on_request_vote("peer-b".into(), 2, Utc::now()).await;
        assert_eq!(core.ctx.with_lock(|i| i.voted_for.clone()), Some("peer-b".to_string()));
        assert_eq!(core.ctx.term(), 2);
    }

    #[tokio::test]
    async fn vote_response_tally_requires_matching_election_term() {
        let (core, _rx) = test_core("self");
        core.ctx.with_lock(|i| {
            i.state = NodeState::Candidate;
            i.term = 1;
            i.election_term = Some(1);
            i.votes_received.insert("self".to_string());
        });

        core.on_vote_response("peer-a".into(), "self", 1, true);
        assert_eq!(core.ctx.with_lock(|i| i.votes_received.len()), 2);

        // A response for a stale election term does not count.
        core.on_vote_response("peer-b".into(), "self", 0, true);
        assert_eq!(core.ctx.with_lock(|i| i.votes_received.len()), 2);
    }

    #[tokio::test]
    async fn competing_leader_heartbeat_demotes() {
        let (core, mut rx) = test_core("self");
        core.ctx.with_lock(|i| {
            i.state = NodeState::Leader;
            i.term = 1;
            i.leader_id = Some("self".to_string());
        });

        core.on_leader_heartbeat("other".into(), 1).await;

        assert_eq!(core.ctx.state(), NodeState::Follower);
        assert_eq!(rx.recv().await, Some(LeadershipEvent::Demoted));
    }
}
