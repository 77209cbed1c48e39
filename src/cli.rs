//! Operator CLI command handlers.
//!
//! Each command talks to a running node through its HTTP RPC API and prints
//! a short human-readable report.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::node::rpc::{BalanceResponse, BlockSummary, PayRequest, SubmitResponse, VoteRequest};
use crate::node::{DelegateInfo, NodeStatus};

/// CLI errors.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("node rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Simple RPC client for communicating with a slotchain node.
pub struct RpcClient {
    base_url: String,
    client: reqwest::Client,
}

impl RpcClient {
    pub fn new(rpc_addr: SocketAddr) -> Self {
        RpcClient {
            base_url: format!("http://{}", rpc_addr),
            client: reqwest::Client::new(),
        }
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CliError> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(CliError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        resp.json()
            .await
            .map_err(|e| CliError::Rpc(format!("invalid response: {}", e)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CliError::Rpc(format!("request failed: {}", e)))?;
        Self::decode(resp).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CliError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| CliError::Rpc(format!("request failed: {}", e)))?;
        Self::decode(resp).await
    }

    pub async fn status(&self) -> Result<NodeStatus, CliError> {
        self.get("/status").await
    }

    pub async fn balance(&self, identity: &str) -> Result<BalanceResponse, CliError> {
        self.get(&format!("/balance/{}", identity)).await
    }

    pub async fn delegates(&self) -> Result<Vec<DelegateInfo>, CliError> {
        self.get("/delegates").await
    }

    pub async fn pay(&self, recipient: &str, amount: u64) -> Result<SubmitResponse, CliError> {
        let body = PayRequest {
            recipient: recipient.to_string(),
            amount,
        };
        self.post("/pay", &body).await
    }

    pub async fn vote(&self, candidate: &str) -> Result<SubmitResponse, CliError> {
        let body = VoteRequest {
            candidate: candidate.to_string(),
        };
        self.post("/vote", &body).await
    }

    pub async fn produce(&self) -> Result<BlockSummary, CliError> {
        self.post("/produce", &serde_json::json!({})).await
    }
}

// ── Commands ──

pub async fn cmd_status(rpc_addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let client = RpcClient::new(rpc_addr);
    let status = client.status().await?;
    println!("Identity:     {}", status.identity);
    println!("Head:         {} (height {})", status.head, status.height);
    println!("Head time:    {}", status.head_timestamp);
    println!(
        "Pending:      {} transactions, {} votes",
        status.pending_transactions, status.pending_votes
    );
    match status.position {
        Some(pos) => println!("Our slot:     {} (current {})", pos, status.current_slot),
        None => println!("Our slot:     not elected (current {})", status.current_slot),
    }
    println!("Delegates:");
    if status.delegates.is_empty() {
        println!("  (none)");
    }
    for (slot, d) in status.delegates.iter().enumerate() {
        println!("  [{}] {} ({} votes)", slot, d.identity, d.votes);
    }
    Ok(())
}

pub async fn cmd_balance(
    rpc_addr: SocketAddr,
    identity: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = RpcClient::new(rpc_addr);
    let identity = match identity {
        Some(id) => id,
        None => client.status().await?.identity.to_string(),
    };
    let resp = client.balance(&identity).await?;
    println!("{}: {}", resp.identity, resp.balance);
    Ok(())
}

pub async fn cmd_pay(
    rpc_addr: SocketAddr,
    recipient: &str,
    amount: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = RpcClient::new(rpc_addr).pay(recipient, amount).await?;
    println!("Transaction pooled: {}", resp.id);
    Ok(())
}

pub async fn cmd_vote(
    rpc_addr: SocketAddr,
    candidate: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = RpcClient::new(rpc_addr).vote(candidate).await?;
    println!("Vote cast: {}", resp.id);
    Ok(())
}

pub async fn cmd_produce(rpc_addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let block = RpcClient::new(rpc_addr).produce().await?;
    println!(
        "Produced block {} on {} ({} txs, {} votes, reward {})",
        block.hash, block.parent, block.transactions, block.votes, block.reward
    );
    Ok(())
}
