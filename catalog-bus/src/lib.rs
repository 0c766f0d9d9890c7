//! The bus gateway: a single named pub/sub topic carrying tagged JSON
//! envelopes, wrapping the storage layer's pub/sub HTTP surface.
//!
//! Every node reads the same topic and filters by envelope `type`; there is
//! no point-to-point delivery. Publication is best-effort — failures are
//! logged and left for the caller's own periodic timer to re-drive.

mod envelope;

pub use envelope::{Envelope, PendingProposalSummary, VoteKind};

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use catalog_core::PeerId;
use catalog_storage::StorageClient;
use futures::stream::{Stream, StreamExt};
use tracing::debug;

/// Publishes and subscribes [`Envelope`]s on one fixed topic.
#[derive(Clone)]
pub struct BusGateway {
    storage: StorageClient,
    topic: String,
}

impl BusGateway {
    pub fn new(storage: StorageClient, topic: impl Into<String>) -> Self {
        Self {
            storage,
            topic: topic.into(),
        }
    }

    /// Serialize and publish `envelope`. Failures are swallowed here (the
    /// storage client already logs); callers never need to retry by hand —
    /// heartbeats and election triggers fire again on their own cadence.
    pub async fn publish(&self, envelope: &Envelope) {
        match serde_json::to_vec(envelope) {
            Ok(bytes) => {
                let _ = self.storage.publish(&self.topic, &bytes).await;
            }
            Err(err) => {
                debug!(error = %err, "failed to serialize envelope for publish");
            }
        }
    }

    /// Subscribe to the topic, yielding `(sender, envelope)` pairs.
    ///
    /// Accepts both wire framings spec'd for the storage layer's pub/sub
    /// endpoint: an outer `{"from": ..., "data": "<base64>"}` wrapper (HTTP
    /// pub/sub), or a bare JSON envelope object (CLI subscribe stream).
    /// Unrecognized `type` discriminators and malformed frames are dropped
    /// silently rather than surfaced as errors — one bad message must never
    /// take down the subscription.
    pub fn subscribe(&self) -> impl Stream<Item = (Option<PeerId>, Envelope)> + Send {
        self.storage.subscribe_raw(&self.topic).filter_map(|frame| async move {
            let (sender, payload) = unwrap_frame(frame)?;
            match serde_json::from_value::<Envelope>(payload) {
                Ok(envelope) => Some((sender, envelope)),
                Err(err) => {
                    debug!(error = %err, "dropping envelope with unrecognized shape");
                    None
                }
            }
        })
    }

    pub fn timeout_hint(&self) -> Duration {
        Duration::from_secs(5)
    }
}

/// Unwrap one pub/sub frame into `(sender, inner JSON value)`.
///
/// An HTTP pub/sub frame wraps the real payload as base64 inside a `data`
/// field alongside a `from` field naming the publisher. A CLI-subscribe
/// frame is the envelope JSON directly, with no wrapper and no sender.
fn unwrap_frame(frame: serde_json::Value) -> Option<(Option<PeerId>, serde_json::Value)> {
    if let serde_json::Value::Object(ref map) = frame {
        if let Some(serde_json::Value::String(data)) = map.get("data") {
            let sender = map.get("from").and_then(|v| v.as_str()).map(|s| s.to_string());
            let decoded = BASE64.decode(data).ok()?;
            let inner: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
            return Some((sender, inner));
        }
    }
    Some((None, frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn unwraps_base64_http_framing() {
        let inner = serde_json::json!({"type": "peer_heartbeat", "peer_id": "node-a", "state": "Follower", "timestamp": "2026-01-01T00:00:00Z"});
        let encoded = BASE64.encode(serde_json::to_vec(&inner).unwrap());
        let wrapped = serde_json::json!({"from": "node-a", "data": encoded, "seqno": "1"});

        let (sender, value) = unwrap_frame(wrapped).unwrap();
        assert_eq!(sender.as_deref(), Some("node-a"));
        assert_eq!(value, inner);
    }

    #[test]
    fn accepts_bare_cli_framing() {
        let inner = serde_json::json!({"type": "peer_heartbeat", "peer_id": "node-a", "state": "Follower", "timestamp": "2026-01-01T00:00:00Z"});
        let (sender, value) = unwrap_frame(inner.clone()).unwrap();
        assert!(sender.is_none());
        assert_eq!(value, inner);
    }

    #[test]
    fn malformed_base64_is_dropped() {
        let wrapped = serde_json::json!({"from": "node-a", "data": "not-base64!!"});
        assert!(unwrap_frame(wrapped).is_none());
    }

    #[test]
    fn unknown_envelope_type_round_trips_to_none() {
        let value = serde_json::json!({"type": "some_future_type", "foo": "bar"});
        let parsed: Result<Envelope, _> = serde_json::from_value(value);
        assert!(parsed.is_err());
    }

    #[test]
    fn request_vote_round_trips() {
        let envelope = Envelope::RequestVote {
            candidate_id: "node-a".into(),
            term: 4,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"request_vote\""));
        let round_tripped: Envelope = serde_json::from_str(&json).unwrap();
        match round_tripped {
            Envelope::RequestVote { candidate_id, term, .. } => {
                assert_eq!(candidate_id, "node-a");
                assert_eq!(term, 4);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn search_request_carries_a_token() {
        let envelope = Envelope::SearchRequest {
            search_id: Uuid::new_v4(),
            token: Uuid::new_v4(),
            prompt: "hello".into(),
            top_k: 3,
            target_peer: "node-b".into(),
            leader_id: "node-a".into(),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let round_tripped: Envelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(round_tripped, Envelope::SearchRequest { top_k: 3, .. }));
    }
}
