//! Garbage Collector (spec.md §2, §4.5 / §4.6 / §4.7 GC notes): one
//! periodic sweep that independently expires, on every node, voting
//! sessions past `SESSION_TIMEOUT`, confirmation aggregates past
//! `CONFIRMATION_TIMEOUT`, stale peers past `PEER_TIMEOUT`, and leftover
//! search bookkeeping. No cross-cluster coordination is needed — each
//! node's sweep only touches its own in-memory state.

use std::sync::Arc;

use catalog_commit::CommitCore;
use catalog_core::{NodeContext, TimingSettings};
use catalog_search::SearchBroker;
use catalog_voting::VotingCore;
use tracing::debug;

pub async fn run(ctx: Arc<NodeContext>, voting: Arc<VotingCore>, commit: Arc<CommitCore>, search: Arc<SearchBroker>, timing: TimingSettings) {
    let mut interval = tokio::time::interval(timing.gc_sweep_interval());
    loop {
        interval.tick().await;
        if !ctx.is_running() {
            return;
        }

        debug!("running garbage collection sweep");
        ctx.peers.evict_stale(timing.peer_timeout());
        voting.gc_sessions(timing.voting_session_timeout());
        commit.gc_confirmations(timing.confirmation_timeout());
        // Search requests have no dedicated timer in spec.md; they share the
        // voting session horizon, same as catalog-search's own gc_requests doc.
        search.gc_requests(timing.voting_session_timeout());
    }
}
