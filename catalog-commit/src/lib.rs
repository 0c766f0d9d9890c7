//! Commit Core: the two-phase, hash-checked version update (spec.md §4.6).
//!
//! Ingestion and proposal are leader-only; staging, confirming, and
//! adopting run uniformly on every node, including the leader itself — the
//! leader's own `version_confirmation_request`, `version_confirmation`, and
//! `vector_commit` broadcasts are all envelope types explicitly allowed to
//! echo back to their sender (spec.md §6.1), so there is a single code path
//! for "peer stages a proposal", "peer counts toward quorum", and "peer
//! adopts a commit" rather than leader-only shortcuts. This is also how the
//! leader counts its own confirmation toward quorum and adopts its own
//! commit — it observes its own broadcasts come back off the bus exactly as
//! a follower would.

use std::path::Path;
use std::sync::Arc;

use catalog_bus::{BusGateway, Envelope};
use catalog_core::{
    CatalogEntry, CatalogResult, NodeContext, PeerId, StagedCommit, VectorIndex, VectorIndexEntry,
};
use catalog_storage::StorageClient;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Filesystem locations Commit Core reads and writes. Owned by the root
/// binary's config, borrowed here by reference.
#[derive(Debug, Clone)]
pub struct CommitPaths {
    pub catalog_path: String,
    pub embeddings_dir: String,
    pub temp_embeddings_dir: String,
    pub index_path: String,
}

/// Identifiers produced by a successful ingest, needed by catalog-voting to
/// build the advisory `document_approved` broadcast.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub cid: String,
    pub embedding_cid: String,
    pub version: u64,
}

pub struct CommitCore {
    ctx: Arc<NodeContext>,
    bus: Arc<BusGateway>,
    storage: StorageClient,
    paths: CommitPaths,
}

impl CommitCore {
    pub fn new(ctx: Arc<NodeContext>, bus: Arc<BusGateway>, storage: StorageClient, paths: CommitPaths) -> Self {
        Self { ctx, bus, storage, paths }
    }

    /// Step 1+2: ingest an approved document's bytes into storage, derive
    /// its embedding, and broadcast the proposed new version. Leader-only;
    /// called by catalog-voting when a session resolves to `Approved`.
    pub async fn ingest_and_propose(&self, filename: &str, bytes: Vec<u8>) -> CatalogResult<IngestOutcome> {
        let cid = self.storage.add(bytes.clone(), filename).await.map_err(storage_err)?;

        let text = String::from_utf8(bytes).unwrap_or_else(|_| format!("binary document: {filename}"));
        let embedding = self.ctx.embedder.embed(&text);
        let embedding_bytes = serde_json::to_vec(&embedding).map_err(catalog_core::CatalogError::Json)?;
        let embedding_cid = self.storage.add(embedding_bytes.clone(), &format!("{cid}.embedding")).await.map_err(storage_err)?;

        let local_embedding_path = format!("{cid}.json");
        write_file(&self.paths.embeddings_dir, &local_embedding_path, &embedding_bytes)
            .await
            .map_err(catalog_core::CatalogError::Io)?;

        let entry = CatalogEntry {
            cid: cid.clone(),
            filename: filename.to_string(),
            added_at: Utc::now(),
            embedding_cid: embedding_cid.clone(),
            local_embedding_path,
        };

        let (new_version, documents) = self.ctx.with_lock(|inner| {
            let mut documents = inner.catalog.documents_confirmed.clone();
            documents.push(entry.clone());
            (inner.catalog.version_confirmed + 1, documents)
        });

        info!(version = new_version, cid, "proposing new catalog version");
        self.bus
            .publish(&Envelope::VersionConfirmationRequest {
                version: new_version,
                documents,
                cid: cid.clone(),
                embedding_cid: embedding_cid.clone(),
                timestamp: Utc::now(),
            })
            .await;

        Ok(IngestOutcome { cid, embedding_cid, version: new_version })
    }

    /// Step 2 (peer side, including the leader's own echo): stage a
    /// proposed version and report its hash back to the leader.
    pub async fn handle_version_confirmation_request(
        &self,
        version: u64,
        documents: Vec<CatalogEntry>,
        cid: String,
        embedding_cid: String,
    ) {
        let already_confirmed = self.ctx.with_lock(|inner| version <= inner.catalog.version_confirmed);
        if already_confirmed {
            debug!(version, "dropping confirmation request for an already-confirmed version");
            return;
        }

        let embedding_bytes = match self.storage.cat(&embedding_cid).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(embedding_cid, error = %err, "failed to fetch embedding, dropping this proposal");
                return;
            }
        };

        let local_embedding_path = format!("{cid}.json");
        if let Err(err) = write_file(&self.paths.temp_embeddings_dir, &local_embedding_path, &embedding_bytes).await {
            warn!(error = %err, "failed to stage embedding to temp directory");
            return;
        }

        let hash = match catalog_core::canonical_hash(&documents) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(error = %err, "failed to hash proposed document list");
                return;
            }
        };

        self.ctx.with_lock(|inner| {
            inner.staged_commits.insert(
                cid,
                StagedCommit { version, hash: hash.clone(), documents, embedding_cid, staged_at: Utc::now() },
            );
        });

        self.bus
            .publish(&Envelope::VersionConfirmation { peer_id: self.ctx.self_id.clone(), version, hash, timestamp: Utc::now() })
            .await;
    }

    /// Step 3 (leader only): accumulate per-peer hash confirmations and
    /// broadcast the commit once a quorum agrees on the same hash.
    pub async fn handle_version_confirmation(&self, peer_id: PeerId, version: u64, hash: String) {
        if !self.ctx.is_leader() {
            return;
        }

        let quorum = self.ctx.peers.quorum_size();
        let reached = self.ctx.with_lock(|inner| {
            let aggregate = inner.confirmations.entry(version).or_default();
            aggregate.entries.push((peer_id, hash.clone()));
            if aggregate.agreeing_peers(&hash) >= quorum { aggregate.majority_hash() } else { None }
        });

        if let Some(majority_hash) = reached {
            info!(version, "quorum reached, broadcasting commit");
            self.ctx.with_lock(|inner| {
                inner.confirmations.remove(&version);
            });
            self.bus
                .publish(&Envelope::VectorCommit { version, hash: majority_hash, timestamp: Utc::now(), leader_id: self.ctx.self_id.clone() })
                .await;
        }
    }

    /// Step 4: adopt a committed version if a matching staged entry exists.
    pub async fn handle_vector_commit(&self, version: u64, hash: String) {
        let staged = self.ctx.with_lock(|inner| {
            inner
                .staged_commits
                .iter()
                .find(|(_, staged)| staged.version == version && staged.hash == hash)
                .map(|(cid, staged)| (cid.clone(), staged.documents.clone()))
        });

        let Some((cid, documents)) = staged else {
            debug!(version, "no staged entry for commit, dropping");
            return;
        };

        if let Err(err) = move_temp_to_permanent(&self.paths.temp_embeddings_dir, &self.paths.embeddings_dir).await {
            warn!(error = %err, "failed to move staged embeddings into the permanent directory");
            return;
        }

        self.ctx.with_lock(|inner| {
            inner.catalog.documents_confirmed = documents.clone();
            inner.catalog.version_confirmed = version;
            inner.catalog.last_updated = Utc::now();
            inner.staged_commits.remove(&cid);
        });

        let catalog = self.ctx.with_lock(|inner| inner.catalog.clone());
        if let Err(err) = catalog_core::save_catalog(&self.paths.catalog_path, &catalog).await {
            warn!(error = %err, "failed to persist adopted catalog");
        }

        let index = self.rebuild_index(&documents).await;
        if let Err(err) = index.persist(&self.paths.index_path).await {
            warn!(error = %err, "failed to persist rebuilt similarity index");
        }
        self.ctx.replace_similarity_index(index);

        info!(version, documents = documents.len(), "adopted catalog version");
    }

    async fn rebuild_index(&self, documents: &[CatalogEntry]) -> VectorIndex {
        let mut entries = Vec::with_capacity(documents.len());
        for doc in documents {
            let path = Path::new(&self.paths.embeddings_dir).join(&doc.local_embedding_path);
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Vec<f32>>(&bytes) {
                    Ok(vector) => entries.push(VectorIndexEntry {
                        cid: doc.cid.clone(),
                        filename: doc.filename.clone(),
                        added_at: doc.added_at,
                        vector,
                    }),
                    Err(err) => warn!(cid = %doc.cid, error = %err, "embedding file is not a valid vector, skipping"),
                },
                Err(err) => warn!(cid = %doc.cid, error = %err, "embedding file missing while rebuilding index"),
            }
        }
        VectorIndex::from_entries(entries)
    }

    /// Drop confirmation aggregates older than `timeout` even without quorum.
    pub fn gc_confirmations(&self, timeout: std::time::Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(30));
        self.ctx.with_lock(|inner| {
            inner.confirmations.retain(|_, aggregate| aggregate.created_at >= cutoff);
        });
    }
}

fn storage_err(err: catalog_storage::StorageError) -> catalog_core::CatalogError {
    catalog_core::CatalogError::Transient(err.to_string())
}

async fn write_file(dir: &str, relative_name: &str, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = Path::new(dir).join(relative_name);
    tokio::fs::write(path, bytes).await
}

/// Move every file currently staged in `temp_dir` into `permanent_dir`.
async fn move_temp_to_permanent(temp_dir: &str, permanent_dir: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(permanent_dir).await?;
    let mut read_dir = match tokio::fs::read_dir(temp_dir).await {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    while let Some(entry) = read_dir.next_entry().await? {
        let from = entry.path();
        if !from.is_file() {
            continue;
        }
        let to = Path::new(permanent_dir).join(entry.file_name());
        tokio::fs::rename(&from, &to).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{Catalog, HashingEmbedder};
    use catalog_storage::StorageClientConfig;
    use std::time::Duration;

    fn test_storage() -> StorageClient {
        StorageClient::new(StorageClientConfig {
            base_url: "http://127.0.0.1:1/api/v0".to_string(),
            request_timeout: Duration::from_millis(50),
            retry_attempts: 1,
            retry_backoff: Duration::from_millis(1),
        })
    }

    fn test_core(dir: &std::path::Path) -> CommitCore {
        let ctx = Arc::new(NodeContext::new("self".into(), Catalog::default(), Arc::new(HashingEmbedder::default())));
        let bus = Arc::new(BusGateway::new(test_storage(), "test-topic"));
        let paths = CommitPaths {
            catalog_path: dir.join("catalog.json").to_str().unwrap().to_string(),
            embeddings_dir: dir.join("embeddings").to_str().unwrap().to_string(),
            temp_embeddings_dir: dir.join("temp_embeddings").to_str().unwrap().to_string(),
            index_path: dir.join("index.json").to_str().unwrap().to_string(),
        };
        CommitCore::new(ctx, bus, test_storage(), paths)
    }

    #[tokio::test]
    async fn confirmation_request_for_stale_version_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        core.ctx.with_lock(|inner| inner.catalog.version_confirmed = 5);

        core.handle_version_confirmation_request(3, vec![], "cid".into(), "embcid".into()).await;

        assert!(core.ctx.with_lock(|inner| inner.staged_commits.is_empty()));
    }

    #[tokio::test]
    async fn adopt_drops_silently_when_no_staged_entry_matches() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());

        core.handle_vector_commit(1, "nonexistent-hash".into()).await;

        assert_eq!(core.ctx.with_lock(|inner| inner.catalog.version_confirmed), 0);
    }

    #[tokio::test]
    async fn adopt_applies_staged_documents_and_persists_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());

        let entry = CatalogEntry {
            cid: "cid-1".into(),
            filename: "a.txt".into(),
            added_at: Utc::now(),
            embedding_cid: "emb-1".into(),
            local_embedding_path: "cid-1.json".into(),
        };
        write_file(&core.paths.temp_embeddings_dir, "cid-1.json", b"[1.0,2.0]").await.unwrap();
        core.ctx.with_lock(|inner| {
            inner.staged_commits.insert(
                "cid-1".into(),
                StagedCommit {
                    version: 1,
                    hash: "H".into(),
                    documents: vec![entry.clone()],
                    embedding_cid: "emb-1".into(),
                    staged_at: Utc::now(),
                },
            );
        });

        core.handle_vector_commit(1, "H".into()).await;

        assert_eq!(core.ctx.with_lock(|inner| inner.catalog.version_confirmed), 1);
        assert_eq!(core.ctx.with_lock(|inner| inner.catalog.documents_confirmed.len()), 1);
        assert!(Path::new(&core.paths.embeddings_dir).join("cid-1.json").exists());
        assert_eq!(core.ctx.similarity_index().len(), 1);
    }

    #[tokio::test]
    async fn quorum_confirmation_broadcasts_commit_once() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        core.ctx.with_lock(|inner| inner.state = catalog_core::NodeState::Leader);
        core.ctx.peers.mark(&"peer-a".to_string());
        core.ctx.peers.mark(&"peer-b".to_string());

        core.handle_version_confirmation("self".into(), 1, "H".into()).await;
        core.handle_version_confirmation("peer-a".into(), 1, "H".into()).await;

        assert!(core.ctx.with_lock(|inner| !inner.confirmations.contains_key(&1)));
    }
}
