use crate::{address, broadcast::RpcError, decoder, envelope};
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by wallet, chain and broadcast operations
#[derive(Debug, Error)]
pub enum Error {
    /// Envelope framing failed
    #[error(transparent)]
    Envelope(#[from] envelope::Error),
    /// Address or key is malformed or signing failed
    #[error(transparent)]
    Address(#[from] address::Error),
    /// Transaction chain could not be decoded
    #[error(transparent)]
    Decode(#[from] decoder::Error),
    /// The node rejected a submission
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// Invalid user input
    #[error("{0}")]
    Validation(String),
    /// Wallet outputs do not cover outputs plus fee
    #[error("not enough funds: need {needed} sat, have {available} sat")]
    InsufficientFunds {
        /// Output total plus fee
        needed: u64,
        /// Input total reachable from the wallet
        available: u64,
    },
    /// A chain broadcast stopped at `index`; the rest was saved as pending
    #[error("broadcast of transaction {index} failed: {source}")]
    Broadcast {
        /// Position of the failing transaction
        index: usize,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
    /// Refusing to overwrite a wallet
    #[error("wallet already exists at {0}")]
    WalletExists(PathBuf),
    /// File access failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failed
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// HTTP request failed
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// Hex decoding failed
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    /// Transaction bytes could not be decoded
    #[error("invalid transaction: {0}")]
    Transaction(#[from] bitcoin::consensus::encode::Error),
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
