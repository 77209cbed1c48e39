//! JSON HTTP RPC API for the slotchain node.
//!
//! Read endpoints report chain, pool and election state. The write
//! endpoints (`/pay`, `/vote`, `/produce`) act with the node's own key and
//! are meant for a local operator; bind the server to loopback.

use std::net::SocketAddr;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use super::core::{DelegateInfo, NodeError, NodeHandle, NodeStatus};
use super::mempool::MempoolStats;
use crate::block::{BlockData, BlockHash};
use crate::crypto::keys::Identity;
use crate::network::p2p::{P2pHandle, PeerInfo};

/// Shared RPC state.
#[derive(Clone)]
pub struct RpcState {
    pub node: NodeHandle,
    /// Absent when the node runs without networking (tests).
    pub p2p: Option<P2pHandle>,
}

/// Build the RPC router.
pub fn router(rpc_state: RpcState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/balance/{identity}", get(get_balance))
        .route("/delegates", get(get_delegates))
        .route("/peers", get(get_peers))
        .route("/mempool", get(get_mempool))
        .route("/block/{hash}", get(get_block))
        .route("/pay", post(post_pay))
        .route("/vote", post(post_vote))
        .route("/produce", post(post_produce))
        .with_state(rpc_state)
        .layer(DefaultBodyLimit::max(64 * 1024))
}

/// Serve the RPC API on `addr` until the task is dropped.
pub async fn serve(
    addr: SocketAddr,
    rpc_state: RpcState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(rpc_state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "RPC server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn rejected(e: NodeError) -> (StatusCode, String) {
    tracing::debug!(error = %e, "RPC request rejected");
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn parse_identity(s: &str) -> Result<Identity, (StatusCode, String)> {
    Identity::parse(s).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            "identity must be 64 lowercase hex characters".to_string(),
        )
    })
}

// ── GET /status ──

async fn get_status(State(state): State<RpcState>) -> Json<NodeStatus> {
    Json(state.node.status().await)
}

// ── GET /balance/{identity} ──

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub identity: Identity,
    pub balance: u64,
}

async fn get_balance(
    State(state): State<RpcState>,
    Path(identity): Path<String>,
) -> Result<Json<BalanceResponse>, (StatusCode, String)> {
    let identity = parse_identity(&identity)?;
    let balance = state.node.balance(&identity).await;
    Ok(Json(BalanceResponse { identity, balance }))
}

// ── GET /delegates ──

async fn get_delegates(State(state): State<RpcState>) -> Json<Vec<DelegateInfo>> {
    Json(state.node.delegates().await)
}

// ── GET /peers ──

async fn get_peers(
    State(state): State<RpcState>,
) -> Result<Json<Vec<PeerInfo>>, (StatusCode, String)> {
    let Some(p2p) = state.p2p else {
        return Ok(Json(Vec::new()));
    };
    let peers = p2p.get_peers().await.map_err(|e| {
        tracing::error!(error = %e, "RPC get_peers: P2P layer unavailable");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "P2P layer unavailable".to_string(),
        )
    })?;
    Ok(Json(peers))
}

// ── GET /mempool ──

async fn get_mempool(State(state): State<RpcState>) -> Json<MempoolStats> {
    let node = state.node.state();
    let node = node.lock().await;
    Json(node.mempool.stats())
}

// ── GET /block/{hash} ──

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockSummary {
    pub hash: String,
    pub parent: String,
    pub producer: Identity,
    pub timestamp: i64,
    pub reward: u64,
    pub transactions: usize,
    pub votes: usize,
}

impl From<&BlockData> for BlockSummary {
    fn from(block: &BlockData) -> Self {
        BlockSummary {
            hash: block.hash.to_hex(),
            parent: block.parent_hash.to_hex(),
            producer: block.producer().clone(),
            timestamp: block.unit.timestamp,
            reward: block.reward,
            transactions: block.transactions.len(),
            votes: block.votes.len(),
        }
    }
}

async fn get_block(
    State(state): State<RpcState>,
    Path(hash): Path<String>,
) -> Result<Json<BlockSummary>, (StatusCode, String)> {
    let hash = BlockHash::from_hex(&hash).ok_or((
        StatusCode::BAD_REQUEST,
        "hash must be 32 bytes hex".to_string(),
    ))?;
    match state.node.block(&hash).await {
        Some(block) => Ok(Json(BlockSummary::from(&block))),
        None => Err((StatusCode::NOT_FOUND, "block not found".to_string())),
    }
}

// ── POST /pay ──

#[derive(Debug, Serialize, Deserialize)]
pub struct PayRequest {
    pub recipient: String,
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: String,
    pub timestamp: i64,
}

async fn post_pay(
    State(state): State<RpcState>,
    Json(req): Json<PayRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    let recipient = parse_identity(&req.recipient)?;
    let tx = state
        .node
        .pay(recipient, req.amount)
        .await
        .map_err(rejected)?;
    Ok(Json(SubmitResponse {
        id: hex::encode(tx.id()),
        timestamp: tx.unit.timestamp,
    }))
}

// ── POST /vote ──

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate: String,
}

async fn post_vote(
    State(state): State<RpcState>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    let candidate = parse_identity(&req.candidate)?;
    let vote = state.node.vote(candidate).await.map_err(rejected)?;
    Ok(Json(SubmitResponse {
        id: hex::encode(vote.id()),
        timestamp: vote.unit.timestamp,
    }))
}

// ── POST /produce ──

async fn post_produce(
    State(state): State<RpcState>,
) -> Result<Json<BlockSummary>, (StatusCode, String)> {
    let block = state
        .node
        .produce(crate::now_nanos())
        .await
        .map_err(rejected)?;
    Ok(Json(BlockSummary::from(&block)))
}
