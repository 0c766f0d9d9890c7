//! Shared types, configuration, and the node context for a catalog node.
//!
//! Every other catalog crate (`catalog-bus`, `catalog-storage`,
//! `catalog-consensus`, `catalog-voting`, `catalog-commit`,
//! `catalog-search`, `catalog-api`) depends on this one for the data model
//! and the `NodeContext` they all coordinate through.

pub mod catalog;
mod config;
mod context;
mod embed;
mod error;
mod hash;
mod index;
mod registry;
mod types;

pub use catalog::{load_catalog, save_catalog};
pub use config::{ApiSettings, BusSettings, CatalogConfig, NodeSettings, StorageSettings, TimingSettings};
pub use context::{NodeContext, NodeInner};
pub use embed::{Embedder, HashingEmbedder};
pub use error::{CatalogError, CatalogResult};
pub use hash::canonical_hash;
pub use index::{VectorIndex, VectorIndexEntry};
pub use registry::PeerRegistry;
pub use types::{
    Catalog, CatalogEntry, ConfirmationAggregate, NodeState, PeerId, SearchHit, SearchRequest, SearchResult,
    StagedCommit, Term, VotingSession, VotingStatus,
};
