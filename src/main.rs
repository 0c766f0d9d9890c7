//! Process entry point for a catalog node: loads configuration, resolves
//! this process's identity from the storage layer, wires every component
//! in §4 through one shared `NodeContext`, and blocks until a shutdown
//! signal arrives.

mod gc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use catalog_bus::{BusGateway, Envelope, VoteKind};
use catalog_commit::{CommitCore, CommitPaths};
use catalog_consensus::{ElectionCore, LeadershipEvent};
use catalog_core::{load_catalog, CatalogConfig, HashingEmbedder, NodeContext, VectorIndex};
use catalog_search::SearchBroker;
use catalog_storage::{StorageClient, StorageClientConfig};
use catalog_voting::VotingCore;
use clap::Parser;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Peer-to-peer catalog coordination node.
#[derive(Parser, Debug)]
#[command(name = "catalog-node", about = "Peer-to-peer catalog coordination node")]
struct Cli {
    /// Emit structured JSON logs instead of the pretty human-readable default.
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = CatalogConfig::load().context("loading configuration")?;
    info!(topic = %config.bus.topic, port = config.api.port, "starting catalog node");

    let storage = StorageClient::new(StorageClientConfig {
        base_url: config.storage.api_base_url.clone(),
        request_timeout: Duration::from_secs(config.storage.request_timeout_secs),
        retry_attempts: config.storage.retry_attempts,
        retry_backoff: Duration::from_millis(config.storage.retry_backoff_millis),
    });

    // Fatal per spec.md §7: the storage layer is the one dependency this
    // process cannot run without, so an unreachable daemon at startup exits
    // the process rather than retrying forever with no identity to run as.
    let self_id = storage.self_id().await.unwrap_or_else(|err| {
        error!(error = %err, "storage layer unreachable at startup, exiting");
        std::process::exit(1);
    });
    info!(peer_id = %self_id, "resolved self identity from storage layer");

    let catalog = load_catalog(&config.node.catalog_path).await;
    let embedder = Arc::new(HashingEmbedder::new(config.node.embedding_dimension));
    let ctx = Arc::new(NodeContext::new(self_id, catalog, embedder));
    ctx.replace_similarity_index(VectorIndex::load(&config.node.index_path).await);

    let bus = Arc::new(BusGateway::new(storage.clone(), config.bus.topic.clone()));

    let commit = Arc::new(CommitCore::new(
        Arc::clone(&ctx),
        Arc::clone(&bus),
        storage.clone(),
        CommitPaths {
            catalog_path: config.node.catalog_path.clone(),
            embeddings_dir: config.node.embeddings_dir.clone(),
            temp_embeddings_dir: config.node.temp_embeddings_dir.clone(),
            index_path: config.node.index_path.clone(),
        },
    ));

    let voting = Arc::new(VotingCore::new(
        Arc::clone(&ctx),
        Arc::clone(&bus),
        Arc::clone(&commit),
        config.timing.clone(),
        config.node.pending_uploads_dir.clone(),
    ));

    let search = Arc::new(SearchBroker::new(Arc::clone(&ctx), Arc::clone(&bus), config.timing.clone()));

    let (leadership_tx, mut leadership_rx) = mpsc::unbounded_channel();
    let (election, mut election_handles) = catalog_consensus::spawn(Arc::clone(&ctx), Arc::clone(&bus), config.timing.clone(), leadership_tx);

    let http = Arc::new(catalog_api::HttpSurface::new(
        Arc::clone(&ctx),
        Arc::clone(&bus),
        Arc::clone(&voting),
        Arc::clone(&search),
        storage.clone(),
        config.api.bind_addr.clone(),
        config.api.port,
    ));

    let leadership_task = {
        let http = Arc::clone(&http);
        tokio::spawn(async move { run_leadership_loop(http, leadership_rx.by_ref()).await })
    };

    let dispatch_task = {
        let ctx = Arc::clone(&ctx);
        let bus = Arc::clone(&bus);
        let election = Arc::clone(&election);
        let voting = Arc::clone(&voting);
        let commit = Arc::clone(&commit);
        let search = Arc::clone(&search);
        tokio::spawn(async move { dispatch_loop(ctx, bus, election, voting, commit, search).await })
    };

    let gc_task = {
        let ctx = Arc::clone(&ctx);
        let voting = Arc::clone(&voting);
        let commit = Arc::clone(&commit);
        let search = Arc::clone(&search);
        let timing = config.timing.clone();
        tokio::spawn(async move { gc::run(ctx, voting, commit, search, timing).await })
    };

    tokio::signal::ctrl_c().await.context("listening for shutdown signal")?;
    info!("shutdown signal received, stopping");

    ctx.stop();
    http.stop().await;
    dispatch_task.abort();
    gc_task.abort();
    leadership_task.abort();
    for handle in election_handles.drain(..) {
        handle.abort();
    }

    info!("catalog node stopped");
    Ok(())
}

async fn run_leadership_loop(http: Arc<catalog_api::HttpSurface>, rx: &mut mpsc::UnboundedReceiver<LeadershipEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            LeadershipEvent::Elected { term } => {
                info!(term, "leadership event: elected, starting HTTP surface");
                http.start().await;
            }
            LeadershipEvent::Demoted => {
                info!("leadership event: demoted, stopping HTTP surface");
                http.stop().await;
            }
        }
    }
}

/// Read every envelope off the bus and fan it out to the subsystem that
/// owns its `type`. One subscription consumer per node, per spec.md §5.
async fn dispatch_loop(
    ctx: Arc<NodeContext>,
    bus: Arc<BusGateway>,
    election: Arc<ElectionCore>,
    voting: Arc<VotingCore>,
    commit: Arc<CommitCore>,
    search: Arc<SearchBroker>,
) {
    let mut stream = Box::pin(bus.subscribe());
    while let Some((sender, envelope)) = stream.next().await {
        if !ctx.is_running() {
            return;
        }
        if let Some(sender_id) = sender.as_ref().filter(|id| !id.is_empty()) {
            ctx.peers.mark(sender_id);
        }

        // Per spec.md §6.1: a node skips envelopes whose apparent sender is
        // itself, except for the handful of types that are deliberately
        // allowed to round-trip back to their own publisher.
        let is_self_echo = sender.as_deref() == Some(ctx.self_id.as_str());
        let allowed_self_echo = matches!(
            envelope,
            Envelope::VoteResponse { .. }
                | Envelope::DocumentProposal { .. }
                | Envelope::VersionConfirmationRequest { .. }
                | Envelope::VersionConfirmation { .. }
                | Envelope::VectorCommit { .. }
        );
        if is_self_echo && !allowed_self_echo {
            continue;
        }

        catalog_consensus::handle_envelope(&election, sender.clone(), &envelope).await;
        dispatch_to_voting_commit_search(&voting, &commit, &search, envelope).await;
    }
}

async fn dispatch_to_voting_commit_search(voting: &Arc<VotingCore>, commit: &Arc<CommitCore>, search: &Arc<SearchBroker>, envelope: Envelope) {
    match envelope {
        Envelope::DocumentProposal { doc_id, filename, total_peers, from_peer, .. } => {
            voting.on_document_proposal(doc_id, filename, total_peers, from_peer);
        }
        Envelope::PeerVote { doc_id, vote, peer_id, .. } => {
            voting.on_peer_vote(doc_id, peer_id, vote == VoteKind::Approve).await;
        }
        Envelope::DocumentApproved { doc_id, .. } | Envelope::DocumentRejected { doc_id, .. } => {
            voting.on_document_decided(doc_id);
        }
        Envelope::VersionConfirmationRequest { version, documents, cid, embedding_cid, .. } => {
            commit.handle_version_confirmation_request(version, documents, cid, embedding_cid).await;
        }
        Envelope::VersionConfirmation { peer_id, version, hash, .. } => {
            commit.handle_version_confirmation(peer_id, version, hash).await;
        }
        Envelope::VectorCommit { version, hash, .. } => {
            commit.handle_vector_commit(version, hash).await;
        }
        Envelope::SearchRequest { search_id, prompt, top_k, target_peer, .. } => {
            search.on_search_request(search_id, prompt, top_k, target_peer).await;
        }
        Envelope::SearchResultReady { peer_id, .. } => {
            search.on_search_result_ready(peer_id);
        }
        Envelope::SearchResultRequest { search_id, target_peer, .. } => {
            search.on_search_result_request(search_id, target_peer).await;
        }
        Envelope::SearchResultResponse { search_id, peer_id, results, .. } => {
            search.on_search_result_response(search_id, peer_id, results);
        }
        Envelope::PeerHeartbeat { .. } | Envelope::LeaderHeartbeat { .. } | Envelope::RequestVote { .. } | Envelope::VoteResponse { .. } => {
            // Fully owned by catalog-consensus, already dispatched above.
        }
    }
}
