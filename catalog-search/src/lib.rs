//! Search Broker: round-robin dispatch and token-gated polling of
//! similarity search requests (spec.md §4.7).

use std::sync::Arc;
use std::time::{Duration, Instant};

use catalog_bus::{BusGateway, Envelope};
use catalog_core::{NodeContext, PeerId, SearchHit, SearchRequest, SearchResult, TimingSettings};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SearchInitAck {
    pub search_id: Uuid,
    pub token: Uuid,
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    Ready(Vec<SearchHit>),
    Processing,
    NotFound,
    BadToken,
}

pub struct SearchBroker {
    ctx: Arc<NodeContext>,
    bus: Arc<BusGateway>,
    timing: TimingSettings,
}

impl SearchBroker {
    pub fn new(ctx: Arc<NodeContext>, bus: Arc<BusGateway>, timing: TimingSettings) -> Self {
        Self { ctx, bus, timing }
    }

    /// Leader-facing entry point for `POST /search`.
    pub async fn init_search(&self, prompt: String, top_k: usize) -> SearchInitAck {
        let search_id = Uuid::new_v4();
        let token = Uuid::new_v4();
        let others = self.ctx.peers.other_peers_sorted();

        let target = if others.is_empty() {
            self.ctx.self_id.clone()
        } else {
            let cursor = self.ctx.with_lock(|inner| {
                let picked = inner.round_robin_cursor;
                inner.round_robin_cursor += 1;
                picked
            });
            others[cursor % others.len()].clone()
        };

        self.ctx.with_lock(|inner| {
            inner.search_requests.insert(
                search_id,
                SearchRequest { search_id, token, target_peer: target.clone(), prompt: prompt.clone(), top_k, created_at: Utc::now() },
            );
        });

        self.bus
            .publish(&Envelope::SearchRequest {
                search_id,
                token,
                prompt: prompt.clone(),
                top_k,
                target_peer: target.clone(),
                leader_id: self.ctx.self_id.clone(),
                timestamp: Utc::now(),
            })
            .await;

        if target == self.ctx.self_id {
            self.execute(search_id, &prompt, top_k).await;
        }

        SearchInitAck { search_id, token }
    }

    /// Run local similarity search and record the result. Called both
    /// inline (single-node cluster) and when this node is the addressed
    /// peer of an inbound `search_request`.
    pub async fn execute(&self, search_id: Uuid, prompt: &str, top_k: usize) {
        let index = self.ctx.similarity_index();
        let vector = self.ctx.embedder.embed(prompt);
        let hits = index.search(&vector, top_k);

        self.ctx.with_lock(|inner| {
            inner.search_results.insert(search_id, SearchResult { search_id, origin_peer: self.ctx.self_id.clone(), hits });
        });

        self.bus.publish(&Envelope::SearchResultReady { search_id, peer_id: self.ctx.self_id.clone(), timestamp: Utc::now() }).await;
    }

    /// Handle an inbound `search_request` addressed to this node.
    pub async fn on_search_request(&self, search_id: Uuid, prompt: String, top_k: usize, target_peer: PeerId) {
        if target_peer == self.ctx.self_id {
            self.execute(search_id, &prompt, top_k).await;
        }
    }

    pub fn on_search_result_ready(&self, peer_id: PeerId) {
        self.ctx.peers.mark(&peer_id);
    }

    /// Handle an inbound `search_result_request`: reply with our locally
    /// produced result for `search_id`, if we have one.
    pub async fn on_search_result_request(&self, search_id: Uuid, target_peer: PeerId) {
        if target_peer != self.ctx.self_id {
            return;
        }
        let hits = self.ctx.with_lock(|inner| inner.search_results.get(&search_id).map(|r| r.hits.clone()));
        let Some(hits) = hits else {
            debug!(search_id = %search_id, "no local result yet for requested search");
            return;
        };
        self.bus
            .publish(&Envelope::SearchResultResponse { search_id, peer_id: self.ctx.self_id.clone(), results: hits, timestamp: Utc::now() })
            .await;
    }

    /// Leader-only: record a peer's search result. Duplicate responses for
    /// the same `search_id` simply overwrite — a keyed, idempotent update.
    pub fn on_search_result_response(&self, search_id: Uuid, peer_id: PeerId, results: Vec<SearchHit>) {
        self.ctx.with_lock(|inner| {
            inner.search_results.insert(search_id, SearchResult { search_id, origin_peer: peer_id, hits: results });
        });
    }

    /// Leader-facing entry point for `GET /search/{id}?token=...`.
    pub async fn poll(&self, search_id: Uuid, token: Uuid) -> PollOutcome {
        let request = self.ctx.with_lock(|inner| inner.search_requests.get(&search_id).cloned());
        let Some(request) = request else { return PollOutcome::NotFound };
        if request.token != token {
            return PollOutcome::BadToken;
        }

        if request.target_peer == self.ctx.self_id {
            return match self.ctx.with_lock(|inner| inner.search_results.get(&search_id).map(|r| r.hits.clone())) {
                Some(hits) => PollOutcome::Ready(hits),
                None => PollOutcome::Processing,
            };
        }

        self.bus
            .publish(&Envelope::SearchResultRequest {
                search_id,
                from_leader: self.ctx.self_id.clone(),
                target_peer: request.target_peer.clone(),
                timestamp: Utc::now(),
            })
            .await;

        let deadline = Instant::now() + self.timing.search_poll_timeout();
        loop {
            if let Some(hits) = self.ctx.with_lock(|inner| inner.search_results.get(&search_id).map(|r| r.hits.clone())) {
                return PollOutcome::Ready(hits);
            }
            if Instant::now() >= deadline {
                return PollOutcome::Processing;
            }
            tokio::time::sleep(self.timing.search_poll_interval()).await;
        }
    }

    /// Drop search bookkeeping older than `timeout` (shares the session GC
    /// horizon; search requests have no dedicated timer in spec.md).
    pub fn gc_requests(&self, timeout: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(300));
        self.ctx.with_lock(|inner| {
            inner.search_requests.retain(|_, request| request.created_at >= cutoff);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{Catalog, HashingEmbedder, VectorIndex, VectorIndexEntry};
    use catalog_storage::{StorageClient, StorageClientConfig};

    fn test_broker(self_id: &str) -> Arc<SearchBroker> {
        let storage = StorageClient::new(StorageClientConfig {
            base_url: "http://127.0.0.1:1/api/v0".to_string(),
            request_timeout: Duration::from_millis(50),
            retry_attempts: 1,
            retry_backoff: Duration::from_millis(1),
        });
        let bus = Arc::new(BusGateway::new(storage, "test-topic"));
        let ctx = Arc::new(NodeContext::new(self_id.to_string(), Catalog::default(), Arc::new(HashingEmbedder::default())));
        let timing = catalog_core::CatalogConfig::default().timing;
        Arc::new(SearchBroker::new(ctx, bus, timing))
    }

    #[tokio::test]
    async fn single_node_cluster_executes_inline() {
        let broker = test_broker("self");
        broker.ctx.replace_similarity_index(VectorIndex::from_entries(vec![VectorIndexEntry {
            cid: "Qm1".into(),
            filename: "a.txt".into(),
            added_at: Utc::now(),
            vector: broker.ctx.embedder.embed("hello"),
        }]));

        let ack = broker.init_search("hello".to_string(), 1).await;

        let outcome = broker.poll(ack.search_id, ack.token).await;
        match outcome {
            PollOutcome::Ready(hits) => assert_eq!(hits[0].cid, "Qm1"),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let broker = test_broker("self");
        let ack = broker.init_search("hello".to_string(), 1).await;

        let outcome = broker.poll(ack.search_id, Uuid::new_v4()).await;
        assert!(matches!(outcome, PollOutcome::BadToken));
    }

    #[tokio::test]
    async fn unknown_search_id_is_not_found() {
        let broker = test_broker("self");
        let outcome = broker.poll(Uuid::new_v4(), Uuid::new_v4()).await;
        assert!(matches!(outcome, PollOutcome::NotFound));
    }

    #[tokio::test]
    async fn duplicate_result_response_overwrites_not_duplicates() {
        let broker = test_broker("self");
        let search_id = Uuid::new_v4();
        broker.on_search_result_response(search_id, "peer-a".into(), vec![]);
        broker.on_search_result_response(search_id, "peer-a".into(), vec![]);
        assert_eq!(broker.ctx.with_lock(|inner| inner.search_results.len()), 1);
    }
}
