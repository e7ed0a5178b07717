//! Runtime configuration, read from flags or the environment

use crate::{
    Error, Result,
    address::Network,
    broadcast::JsonRpcClient,
    funding::{DEFAULT_FEE_PER_KB, FeeRate},
    indexer::{DEFAULT_INDEXER_URL, HttpIndexer},
    server::DEFAULT_PORT,
    wallet::WalletFile,
};
use clap::Args;
use std::path::PathBuf;

/// Settings shared by every command
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Use testnet address and key prefixes
    #[arg(long, env = "TESTNET", global = true)]
    pub testnet: bool,

    /// Fee rate in smallest units per 1000 bytes
    #[arg(long, env = "FEE_PER_KB", default_value_t = DEFAULT_FEE_PER_KB, global = true)]
    pub fee_per_kb: u64,

    /// Wallet file
    #[arg(long, env = "WALLET", default_value = ".wallet.json", global = true)]
    pub wallet: PathBuf,

    /// Node JSON-RPC endpoint
    #[arg(long, env = "NODE_RPC_URL", global = true)]
    pub node_rpc_url: Option<String>,

    /// Node RPC user
    #[arg(long, env = "NODE_RPC_USER", global = true)]
    pub node_rpc_user: Option<String>,

    /// Node RPC password
    #[arg(long, env = "NODE_RPC_PASS", hide_env_values = true, global = true)]
    pub node_rpc_pass: Option<String>,

    /// Indexer API base URL
    #[arg(long, env = "INDEXER_URL", default_value = DEFAULT_INDEXER_URL, global = true)]
    pub indexer_url: String,

    /// Port of the decoder server
    #[arg(long, env = "SERVER_PORT", default_value_t = DEFAULT_PORT, global = true)]
    pub server_port: u16,
}

impl Config {
    /// Network selected by `testnet`
    pub fn network(&self) -> Network {
        if self.testnet {
            Network::Testnet
        } else {
            Network::Mainnet
        }
    }

    /// Fee rate for funding
    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::per_kb(self.fee_per_kb)
    }

    /// The wallet file
    pub fn wallet_file(&self) -> WalletFile {
        WalletFile::new(&self.wallet)
    }

    /// Client for the node RPC. Fails if no endpoint is configured.
    pub fn node_rpc(&self) -> Result<JsonRpcClient> {
        let url = self
            .node_rpc_url
            .as_deref()
            .ok_or_else(|| Error::Validation("NODE_RPC_URL is not set".into()))?;

        Ok(JsonRpcClient::new(
            url,
            self.node_rpc_user.clone(),
            self.node_rpc_pass.clone(),
        ))
    }

    /// Client for the indexer API
    pub fn indexer(&self) -> HttpIndexer {
        HttpIndexer::new(&self.indexer_url)
    }
}
