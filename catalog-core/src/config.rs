//! Configuration for a catalog node.
//!
//! Loaded with the same precedence the corpus favors for this kind of
//! system: built-in defaults, overridden by a config file, overridden by
//! environment variables (`CATALOG_*`), overridden by explicit CLI flags
//! applied by the caller after `CatalogConfig::load` returns.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub node: NodeSettings,
    pub storage: StorageSettings,
    pub bus: BusSettings,
    pub timing: TimingSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Path to the catalog JSON file on disk.
    pub catalog_path: String,
    /// Directory holding confirmed embeddings.
    pub embeddings_dir: String,
    /// Directory holding staged (not-yet-confirmed) embeddings.
    pub temp_embeddings_dir: String,
    /// Directory holding uploads awaiting a vote outcome.
    pub pending_uploads_dir: String,
    /// Path to the persisted vector-similarity index.
    pub index_path: String,
    /// Dimension of the embedding vectors produced by the node's `Embedder`.
    pub embedding_dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Base URL of the content-addressed storage layer's HTTP API.
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Pub/sub topic all nodes share for catalog coordination traffic.
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    pub bind_addr: String,
    pub port: u16,
}

/// Every timing constant the coordination protocol relies on, surfaced so
/// operators can tune them without recompiling. Defaults match the values
/// the protocol was designed and tested against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    pub peer_timeout_secs: u64,
    pub election_timeout_min_secs: u64,
    pub election_timeout_max_secs: u64,
    pub leader_timeout_secs: u64,
    pub leader_heartbeat_interval_secs: u64,
    pub voting_session_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub election_response_wait_secs: u64,
    pub search_poll_timeout_secs: u64,
    pub search_poll_interval_millis: u64,
    pub auto_vote_follower_delay_millis: u64,
    pub auto_vote_leader_delay_millis: u64,
    pub startup_grace_secs: u64,
    pub gc_sweep_interval_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                catalog_path: "catalog.json".into(),
                embeddings_dir: "embeddings".into(),
                temp_embeddings_dir: "temp_embeddings".into(),
                pending_uploads_dir: "pending_uploads".into(),
                index_path: "index.json".into(),
                embedding_dimension: 64,
            },
            storage: StorageSettings {
                api_base_url: "http://127.0.0.1:5001/api/v0".into(),
                request_timeout_secs: 30,
                retry_attempts: 3,
                retry_backoff_millis: 1000,
            },
            bus: BusSettings {
                topic: "catalog-coordination".into(),
            },
            api: ApiSettings {
                bind_addr: "0.0.0.0".into(),
                port: 5000,
            },
            timing: TimingSettings {
                peer_timeout_secs: 30,
                election_timeout_min_secs: 10,
                election_timeout_max_secs: 15,
                leader_timeout_secs: 15,
                leader_heartbeat_interval_secs: 5,
                voting_session_timeout_secs: 300,
                confirmation_timeout_secs: 30,
                election_response_wait_secs: 3,
                search_poll_timeout_secs: 5,
                search_poll_interval_millis: 200,
                auto_vote_follower_delay_millis: 300,
                auto_vote_leader_delay_millis: 500,
                startup_grace_secs: 15,
                gc_sweep_interval_secs: 60,
            },
        }
    }
}

impl TimingSettings {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
    pub fn leader_timeout(&self) -> Duration {
        Duration::from_secs(self.leader_timeout_secs)
    }
    pub fn leader_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.leader_heartbeat_interval_secs)
    }
    pub fn voting_session_timeout(&self) -> Duration {
        Duration::from_secs(self.voting_session_timeout_secs)
    }
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
    pub fn election_response_wait(&self) -> Duration {
        Duration::from_secs(self.election_response_wait_secs)
    }
    pub fn search_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.search_poll_timeout_secs)
    }
    pub fn search_poll_interval(&self) -> Duration {
        Duration::from_millis(self.search_poll_interval_millis)
    }
    pub fn gc_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.gc_sweep_interval_secs)
    }
}

impl CatalogConfig {
    /// Load configuration from `config.toml`/`config.json` if present,
    /// then layer `CATALOG_*` environment variables on top, falling back
    /// to built-in defaults for anything unset.
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&CatalogConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("CATALOG").separator("__"));

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }
}
