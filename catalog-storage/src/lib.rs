//! Thin client over the content-addressed storage layer's HTTP API.
//!
//! This crate does not implement a storage layer — it consumes one (an
//! IPFS-like daemon exposing `add`/`cat`/`pin`/`pubsub` over HTTP, per
//! spec.md §6.2). Everything here is I/O plumbing: retries, timeouts, and
//! the two wire framings the pub/sub endpoint can hand back.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("storage response was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage call exhausted {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct StorageClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

/// A retrying HTTP client for the storage layer's `add`/`cat`/`pin` and
/// `pubsub publish`/`pubsub subscribe` surface.
#[derive(Debug, Clone)]
pub struct StorageClient {
    config: StorageClientConfig,
    http: reqwest::Client,
}

impl StorageClient {
    pub fn new(config: StorageClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Content-address `bytes` under `filename`, returning the resulting
    /// CID. Retried up to `retry_attempts` times with a fixed backoff;
    /// each attempt is capped at `request_timeout`.
    pub async fn add(&self, bytes: Vec<u8>, filename: &str) -> StorageResult<String> {
        self.with_retry("add", || {
            let bytes = bytes.clone();
            let filename = filename.to_string();
            async move {
                let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
                let form = reqwest::multipart::Form::new().part("file", part);
                let url = format!("{}/add", self.config.base_url);
                let resp = self.http.post(&url).multipart(form).send().await?.error_for_status()?;
                let body: AddResponse = resp.json().await?;
                Ok(body.hash)
            }
        })
        .await
    }

    /// Retrieve the bytes behind `cid`.
    pub async fn cat(&self, cid: &str) -> StorageResult<Vec<u8>> {
        self.with_retry("cat", || async move {
            let url = format!("{}/cat", self.config.base_url);
            let resp = self.http.post(&url).query(&[("arg", cid)]).send().await?.error_for_status()?;
            let bytes = resp.bytes().await?;
            Ok(bytes.to_vec())
        })
        .await
    }

    /// Pin `cid` so the storage layer does not garbage-collect it.
    pub async fn pin(&self, cid: &str) -> StorageResult<()> {
        self.with_retry("pin", || async move {
            let url = format!("{}/pin/add", self.config.base_url);
            self.http.post(&url).query(&[("arg", cid)]).send().await?.error_for_status()?;
            Ok(())
        })
        .await
    }

    /// Publish raw bytes on `topic`. Publication is best-effort: a 5s hard
    /// cap, no retry beyond that — callers' periodic timers (heartbeats,
    /// elections) naturally re-drive a dropped publish on their own cadence.
    pub async fn publish(&self, topic: &str, bytes: &[u8]) -> StorageResult<()> {
        let url = format!("{}/pubsub/pub", self.config.base_url);
        let part = reqwest::multipart::Part::bytes(bytes.to_vec());
        let form = reqwest::multipart::Form::new().part("data", part);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            self.http.post(&url).query(&[("arg", topic)]).multipart(form).send(),
        )
        .await;

        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                warn!(topic, error = %err, "pubsub publish failed");
                Err(StorageError::Request(err))
            }
            Err(_) => {
                warn!(topic, "pubsub publish timed out after 5s");
                Err(StorageError::RetriesExhausted {
                    attempts: 1,
                    last: "publish timed out".to_string(),
                })
            }
        }
    }

    /// Subscribe to `topic`, yielding each message frame as a parsed JSON
    /// [`serde_json::Value`]. Handles both wire framings transparently at
    /// the byte level: a transport chunk may contain several concatenated
    /// JSON objects, which [`serde_json::Deserializer::from_slice`]'s
    /// stream deserializer splits for us. Malformed trailing bytes are
    /// buffered until more data arrives or dropped at stream end.
    pub fn subscribe_raw(&self, topic: &str) -> impl Stream<Item = serde_json::Value> + Send {
        let url = format!("{}/pubsub/sub", self.config.base_url);
        let arg = topic.to_string();
        let http = self.http.clone();

        stream::unfold(SubscribeState::Connecting(http, url, arg), move |state| async move {
            match state {
                SubscribeState::Connecting(http, url, arg) => {
                    match http.post(&url).query(&[("arg", arg.as_str())]).send().await {
                        Ok(resp) => {
                            let body = resp.bytes_stream();
                            next_frame(SubscribeState::Streaming(Box::pin(body), Vec::new())).await
                        }
                        Err(err) => {
                            warn!(topic = %arg, error = %err, "pubsub subscribe connection failed");
                            None
                        }
                    }
                }
                other => next_frame(other).await,
            }
        })
    }

    /// The storage layer's own stable identifier for this process.
    pub async fn self_id(&self) -> StorageResult<String> {
        self.with_retry("id", || async move {
            let url = format!("{}/id", self.config.base_url);
            let resp = self.http.post(&url).send().await?.error_for_status()?;
            let body: IdResponse = resp.json().await?;
            Ok(body.id)
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut f: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StorageResult<T>>,
    {
        let mut last_err = None;
        for attempt in 1..=self.config.retry_attempts.max(1) {
            let attempt_result = tokio::time::timeout(self.config.request_timeout, f()).await;
            match attempt_result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    debug!(op, attempt, error = %err, "storage call failed, will retry");
                    last_err = Some(err.to_string());
                }
                Err(_) => {
                    debug!(op, attempt, "storage call timed out, will retry");
                    last_err = Some("request timed out".to_string());
                }
            }
            if attempt < self.config.retry_attempts {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }
        Err(StorageError::RetriesExhausted {
            attempts: self.config.retry_attempts,
            last: last_err.unwrap_or_default(),
        })
    }
}

type ByteStream = std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

enum SubscribeState {
    Connecting(reqwest::Client, String, String),
    Streaming(ByteStream, Vec<u8>),
}

async fn next_frame(state: SubscribeState) -> Option<(serde_json::Value, SubscribeState)> {
    let (mut body, mut buf) = match state {
        SubscribeState::Streaming(body, buf) => (body, buf),
        _ => return None,
    };

    loop {
        if let Some((value, consumed)) = try_parse_one(&buf) {
            buf.drain(..consumed);
            return Some((value, SubscribeState::Streaming(body, buf)));
        }

        match body.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(err)) => {
                warn!(error = %err, "pubsub subscribe stream error");
                return None;
            }
            None => return None,
        }
    }
}

/// Attempt to parse exactly one JSON value from the front of `buf`, tolerating
/// more concatenated values after it. Returns the value and how many bytes
/// it consumed, or `None` if `buf` does not yet hold a complete value.
fn try_parse_one(buf: &[u8]) -> Option<(serde_json::Value, usize)> {
    let mut deserializer = serde_json::Deserializer::from_slice(buf).into_iter::<serde_json::Value>();
    match deserializer.next() {
        Some(Ok(value)) => Some((value, deserializer.byte_offset())),
        _ => None,
    }
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_json_object() {
        let buf = br#"{"a":1}"#;
        let (value, consumed) = try_parse_one(buf).unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn leaves_incomplete_trailing_bytes_unconsumed() {
        let buf = br#"{"a":1}{"b":2"#;
        let (value, consumed) = try_parse_one(buf).unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
        assert_eq!(&buf[consumed..], br#"{"b":2"#);
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        assert!(try_parse_one(b"").is_none());
    }

    mod http {
        use super::super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn client(base_url: String) -> StorageClient {
            StorageClient::new(StorageClientConfig {
                base_url,
                request_timeout: Duration::from_millis(500),
                retry_attempts: 3,
                retry_backoff: Duration::from_millis(5),
            })
        }

        #[tokio::test]
        async fn add_returns_the_hash_on_first_success() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/add"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"Hash": "QmTest"})))
                .mount(&server)
                .await;

            let result = client(server.uri()).add(b"hello".to_vec(), "a.txt").await.unwrap();
            assert_eq!(result, "QmTest");
        }

        #[tokio::test]
        async fn add_retries_after_a_transient_failure_then_succeeds() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/add"))
                .respond_with(ResponseTemplate::new(500))
                .up_to_n_times(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/add"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"Hash": "QmRetried"})))
                .mount(&server)
                .await;

            let result = client(server.uri()).add(b"hello".to_vec(), "a.txt").await.unwrap();
            assert_eq!(result, "QmRetried");
        }

        #[tokio::test]
        async fn cat_exhausts_retries_and_reports_failure() {
            let server = MockServer::start().await;
            Mock::given(method("POST")).and(path("/cat")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

            let result = client(server.uri()).cat("QmMissing").await;
            assert!(matches!(result, Err(StorageError::RetriesExhausted { attempts: 3, .. })));
        }

        #[tokio::test]
        async fn self_id_returns_the_peer_identifier() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/id"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ID": "peer-xyz"})))
                .mount(&server)
                .await;

            let result = client(server.uri()).self_id().await.unwrap();
            assert_eq!(result, "peer-xyz");
        }
    }
}
