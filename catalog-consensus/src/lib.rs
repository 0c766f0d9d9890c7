//! Election Core and Heartbeat Loop (spec.md §4.3, §4.4).
//!
//! A Raft-style, single-round-vote leader election over the shared bus:
//! terms, one vote per term, majority-of-known-peers wins, a randomized
//! startup grace delays the first election so a freshly joined cluster
//! does not immediately split-vote. The heartbeat loop shares this crate
//! because the variant it emits (`leader_heartbeat` vs `peer_heartbeat`)
//! and its start/stop timing are dictated entirely by election state.
//!
//! This crate does not start or stop the HTTP surface itself — that would
//! require depending on `catalog-api`, which the API crate does not need
//! to depend back on. Instead [`ElectionCore::spawn`] takes an
//! `mpsc::UnboundedSender<LeadershipEvent>`; the binary crate listens on
//! the matching receiver and owns the HTTP server's lifecycle.

mod election;

pub use election::{ElectionCore, LeadershipEvent};

use std::sync::Arc;

use catalog_bus::{BusGateway, Envelope};
use catalog_core::{NodeContext, PeerId};

/// Dispatch one envelope to the election/heartbeat handlers if it is one of
/// the types this crate owns. Unrelated envelope types are ignored so the
/// caller can fan the same envelope out to every subsystem unconditionally.
pub async fn handle_envelope(core: &ElectionCore, sender: Option<PeerId>, envelope: &Envelope) {
    match envelope {
        Envelope::RequestVote { candidate_id, term, timestamp } => {
            core.on_request_vote(candidate_id.clone(), *term, *timestamp).await;
        }
        Envelope::VoteResponse { voter_id, candidate_id, term, vote_granted, .. } => {
            core.on_vote_response(voter_id.clone(), candidate_id, *term, *vote_granted);
        }
        Envelope::LeaderHeartbeat { leader_id, term, .. } => {
            core.on_leader_heartbeat(leader_id.clone(), *term).await;
        }
        Envelope::PeerHeartbeat { .. } => {
            // Liveness only; the caller already marked `sender` in the peer
            // registry before dispatching here.
            let _ = sender;
        }
        _ => {}
    }
}

/// Convenience constructor plus spawn, used by the binary's wiring code.
pub fn spawn(
    ctx: Arc<NodeContext>,
    bus: Arc<BusGateway>,
    timing: catalog_core::TimingSettings,
    leadership_tx: tokio::sync::mpsc::UnboundedSender<LeadershipEvent>,
) -> (Arc<ElectionCore>, Vec<tokio::task::JoinHandle<()>>) {
    let core = Arc::new(ElectionCore::new(ctx, bus, timing, leadership_tx));
    let handles = ElectionCore::spawn(Arc::clone(&core));
    (core, handles)
}
