//! HTTP Surface (spec.md §4.8): leader-only lifecycle around the router in
//! [`rest`]. Bound to a configurable address, started on election win and
//! stopped on demotion — both idempotent, per spec.md §4.8's "startup and
//! teardown must be idempotent and race-free".
//!
//! The server's running/not-running state is tracked through
//! `NodeContext::http_shutdown`/`http_server_handle` rather than a field on
//! this struct, so every caller — the election loop on demotion, the binary
//! on final shutdown — observes the same state through the one shared lock.

mod rest;

use std::sync::Arc;
use std::time::Duration;

use catalog_bus::BusGateway;
use catalog_core::NodeContext;
use catalog_search::SearchBroker;
use catalog_storage::StorageClient;
use catalog_voting::VotingCore;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub use rest::router;

/// How long [`HttpSurface::stop`] waits for the serving task to join before
/// giving up on a clean shutdown (spec.md §5's "bounded grace").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct HttpSurface {
    ctx: Arc<NodeContext>,
    voting: Arc<VotingCore>,
    search: Arc<SearchBroker>,
    storage: StorageClient,
    bind_addr: String,
    port: u16,
}

impl HttpSurface {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<NodeContext>,
        _bus: Arc<BusGateway>,
        voting: Arc<VotingCore>,
        search: Arc<SearchBroker>,
        storage: StorageClient,
        bind_addr: String,
        port: u16,
    ) -> Self {
        Self { ctx, voting, search, storage, bind_addr, port }
    }

    /// Bind and serve. A second call while already running is a no-op,
    /// checked and set atomically under the context lock so two concurrent
    /// "leader elected" observations cannot both bind the port.
    pub async fn start(self: &Arc<Self>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let already_running = self.ctx.with_lock(|inner| {
            if inner.http_shutdown.is_some() {
                true
            } else {
                inner.http_shutdown = Some(shutdown_tx);
                false
            }
        });
        if already_running {
            return;
        }

        let addr = format!("{}:{}", self.bind_addr, self.port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(addr, error = %err, "failed to bind HTTP surface, staying follower-only");
                self.ctx.with_lock(|inner| inner.http_shutdown = None);
                return;
            }
        };

        let app = rest::router(rest::AppState {
            ctx: Arc::clone(&self.ctx),
            voting: Arc::clone(&self.voting),
            search: Arc::clone(&self.search),
            storage: self.storage.clone(),
        });

        info!(addr, "HTTP surface listening");
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                warn!(error = %err, "HTTP surface exited with an error");
            }
        });

        self.ctx.with_lock(|inner| inner.http_server_handle = Some(handle));
    }

    /// Signal the serving task to stop and join it within [`SHUTDOWN_GRACE`].
    /// A second call while already stopped is a no-op.
    pub async fn stop(&self) {
        let (shutdown_tx, handle) = self.ctx.with_lock(|inner| (inner.http_shutdown.take(), inner.http_server_handle.take()));

        let Some(shutdown_tx) = shutdown_tx else {
            return;
        };
        let _ = shutdown_tx.send(());

        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("HTTP surface did not shut down within the grace period");
            }
        }
        info!("HTTP surface stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{Catalog, HashingEmbedder};
    use catalog_storage::StorageClientConfig;

    fn test_surface() -> Arc<HttpSurface> {
        let storage = StorageClient::new(StorageClientConfig {
            base_url: "http://127.0.0.1:1/api/v0".to_string(),
            request_timeout: Duration::from_millis(50),
            retry_attempts: 1,
            retry_backoff: Duration::from_millis(1),
        });
        let ctx = Arc::new(NodeContext::new("self".into(), Catalog::default(), Arc::new(HashingEmbedder::default())));
        let bus = Arc::new(BusGateway::new(storage.clone(), "test-topic"));
        let commit = Arc::new(catalog_commit::CommitCore::new(
            Arc::clone(&ctx),
            Arc::clone(&bus),
            storage.clone(),
            catalog_commit::CommitPaths {
                catalog_path: "/tmp/catalog-http-tests/catalog.json".into(),
                embeddings_dir: "/tmp/catalog-http-tests/embeddings".into(),
                temp_embeddings_dir: "/tmp/catalog-http-tests/temp_embeddings".into(),
                index_path: "/tmp/catalog-http-tests/index.json".into(),
            },
        ));
        let voting = Arc::new(VotingCore::new(
            Arc::clone(&ctx),
            Arc::clone(&bus),
            commit,
            catalog_core::CatalogConfig::default().timing,
            "/tmp/catalog-http-tests/pending_uploads".into(),
        ));
        let search = Arc::new(SearchBroker::new(Arc::clone(&ctx), Arc::clone(&bus), catalog_core::CatalogConfig::default().timing));
        Arc::new(HttpSurface::new(ctx, bus, voting, search, storage, "127.0.0.1".into(), 0))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let surface = test_surface();
        surface.start().await;
        surface.start().await;
        assert!(surface.ctx.with_lock(|inner| inner.http_shutdown.is_some()));
        surface.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let surface = test_surface();
        surface.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let surface = test_surface();
        surface.start().await;
        surface.stop().await;
        surface.stop().await;
    }
}
