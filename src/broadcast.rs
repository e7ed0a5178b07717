//! # Broadcast Engine
//!
//! Submits transactions to the node in order. A node rejection for excessive
//! unconfirmed-chain depth can be retried on a fixed interval; any other failure
//! stops the run and writes the transactions not yet accepted to a pending file so
//! a later run can resume them.

use crate::{
    Error, Result,
    address::Network,
    wallet::WalletFile,
};
use bitcoin::{Transaction, consensus, consensus::encode::serialize_hex};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

/// Substring of the node's rejection message for excessive unconfirmed-chain depth
pub const MEMPOOL_CHAIN_ERROR: &str = "too-long-mempool-chain";

/// Errors returned by the node's submission RPC
#[derive(Debug, Error)]
pub enum RpcError {
    /// The node answered with a JSON-RPC error object
    #[error("node rejected transaction (code {code}): {message}")]
    Rejected {
        /// JSON-RPC error code
        code: i64,
        /// JSON-RPC error message
        message: String,
        /// Full response body
        payload: Value,
    },
    /// The response was neither a result nor a JSON-RPC error
    #[error("unexpected rpc response (status {status}): {body}")]
    Response {
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },
    /// The request could not be made
    #[error("rpc request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl RpcError {
    /// Builds a rejection the way the node reports it
    pub fn rejected(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        let payload = serde_json::json!({
            "result": null,
            "error": { "code": code, "message": message },
            "id": 0,
        });
        RpcError::Rejected {
            code,
            message,
            payload,
        }
    }

    /// The node's structured error payload, if it sent one
    pub fn payload(&self) -> Option<&Value> {
        match self {
            RpcError::Rejected { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Returns true for the transient unconfirmed-chain depth rejection
pub fn is_mempool_chain_error(err: &RpcError) -> bool {
    matches!(err, RpcError::Rejected { message, .. } if message.contains(MEMPOOL_CHAIN_ERROR))
}

/// Transaction submission endpoint of a node
pub trait NodeRpc {
    /// Submits a hex-encoded raw transaction
    fn send_raw_transaction(&self, hex: &str) -> std::result::Result<(), RpcError>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'static str,
    params: [&'a str; 1],
}

/// [`NodeRpc`] over JSON-RPC 1.0 with HTTP basic auth
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    client: Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
}

impl JsonRpcClient {
    /// Creates a client for the node at `url`
    pub fn new(url: impl Into<String>, user: Option<String>, password: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            user,
            password,
        }
    }
}

impl NodeRpc for JsonRpcClient {
    fn send_raw_transaction(&self, hex: &str) -> std::result::Result<(), RpcError> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: 0,
            method: "sendrawtransaction",
            params: [hex],
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_ref());
        }

        let response = builder.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        parse_response(status, &body)
    }
}

/// Interprets a JSON-RPC response. The node reports rejections with a non-2xx
/// status and an `error` object, so the object is checked first.
fn parse_response(status: u16, body: &str) -> std::result::Result<(), RpcError> {
    let unexpected = || RpcError::Response {
        status,
        body: body.to_owned(),
    };

    let payload: Value = serde_json::from_str(body).map_err(|_| unexpected())?;
    match payload.get("error") {
        Some(error) if !error.is_null() => {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            Err(RpcError::Rejected {
                code,
                message,
                payload,
            })
        }
        _ if (200..300).contains(&status) => Ok(()),
        _ => Err(unexpected()),
    }
}

/// When and how often a failed submission is retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Wait between attempts
    pub interval: Duration,
    /// Attempts before giving up; `None` retries until the node accepts
    pub max_attempts: Option<usize>,
    /// Errors worth retrying
    pub retry_on: fn(&RpcError) -> bool,
}

impl RetryPolicy {
    /// Retries the mempool-chain rejection every second with no limit
    pub fn mempool_chain() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: None,
            retry_on: is_mempool_chain_error,
        }
    }

    fn should_retry(&self, err: &RpcError, attempts: usize) -> bool {
        (self.retry_on)(err) && self.max_attempts.is_none_or(|max| attempts < max)
    }
}

/// Hex-encoded transactions awaiting broadcast, stored as a JSON array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    path: PathBuf,
}

impl PendingFile {
    /// Refers to the pending file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The pending file kept next to a wallet file: `wallet` in the file name is
    /// replaced by `pending-txs`, or `pending-txs.json` is used if it has none.
    pub fn for_wallet(wallet_path: &Path) -> Self {
        let name = wallet_path
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| name.contains("wallet"))
            .map(|name| name.replacen("wallet", "pending-txs", 1))
            .unwrap_or_else(|| "pending-txs.json".to_owned());

        Self::new(wallet_path.with_file_name(name))
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if there is pending work
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the pending transactions
    pub fn load(&self) -> Result<Vec<Transaction>> {
        let encoded: Vec<String> = serde_json::from_str(&fs::read_to_string(&self.path)?)?;

        encoded
            .iter()
            .map(|tx| -> Result<Transaction> { Ok(consensus::deserialize(&hex::decode(tx)?)?) })
            .collect()
    }

    /// Replaces the pending transactions
    pub fn save(&self, txs: &[Transaction]) -> Result<()> {
        let encoded: Vec<String> = txs.iter().map(serialize_hex).collect();
        fs::write(&self.path, serde_json::to_string(&encoded)?)?;
        Ok(())
    }

    /// Removes the file if present
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

/// Submits transactions and keeps the wallet file and pending file current
pub struct Broadcaster<'a, R: NodeRpc + ?Sized> {
    rpc: &'a R,
    wallet: &'a WalletFile,
    pending: &'a PendingFile,
    network: Network,
    policy: RetryPolicy,
}

impl<'a, R: NodeRpc + ?Sized> Broadcaster<'a, R> {
    /// Creates a broadcaster retrying with [`RetryPolicy::mempool_chain`]
    pub fn new(
        rpc: &'a R,
        wallet: &'a WalletFile,
        pending: &'a PendingFile,
        network: Network,
    ) -> Self {
        Self {
            rpc,
            wallet,
            pending,
            network,
            policy: RetryPolicy::mempool_chain(),
        }
    }

    /// Replaces the retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Submits one transaction, then applies it to the wallet file.
    ///
    /// With `retry` set, errors accepted by the retry policy are retried after its
    /// interval. Everything else fails immediately.
    pub fn broadcast(&self, tx: &Transaction, retry: bool) -> Result<()> {
        self.submit(tx, retry)?;
        self.record(tx)
    }

    fn submit(&self, tx: &Transaction, retry: bool) -> Result<()> {
        let hex = serialize_hex(tx);
        let txid = tx.compute_txid();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.rpc.send_raw_transaction(&hex) {
                Ok(()) => break,
                Err(err) if retry && self.policy.should_retry(&err, attempts) => {
                    warn!(%txid, attempts, error = %err, "retrying broadcast");
                    thread::sleep(self.policy.interval);
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!(%txid, "broadcast transaction");
        Ok(())
    }

    /// Applies an accepted transaction to the wallet file
    fn record(&self, tx: &Transaction) -> Result<()> {
        let mut wallet = self.wallet.load()?;
        let owner = wallet.address(self.network)?.script_pubkey();
        wallet.update(tx, &owner);
        self.wallet.save(&wallet)
    }

    /// Submits a chain in order. On the first rejection the rejected transaction and
    /// every one after it are written to the pending file and the error is returned
    /// as [`Error::Broadcast`]. If the wallet file cannot be updated after the node
    /// accepted a transaction, only the transactions after it are kept pending and
    /// the wallet error is returned. A fully successful run removes the pending file.
    pub fn broadcast_all(&self, txs: &[Transaction], retry: bool) -> Result<()> {
        for (index, tx) in txs.iter().enumerate() {
            if let Err(err) = self.submit(tx, retry) {
                error!(index, error = %err, "broadcast failed, saving remaining transactions");
                self.pending.save(&txs[index..])?;
                return Err(Error::Broadcast {
                    index,
                    source: Box::new(err),
                });
            }

            if let Err(err) = self.record(tx) {
                error!(index, error = %err, "wallet update failed after broadcast");
                let remaining = &txs[index + 1..];
                if remaining.is_empty() {
                    self.pending.clear()?;
                } else {
                    self.pending.save(remaining)?;
                }
                return Err(err);
            }
        }

        self.pending.clear()
    }

    /// Rebroadcasts the pending file without retry. Returns false if there was
    /// nothing pending.
    pub fn resume(&self) -> Result<bool> {
        if !self.pending.exists() {
            return Ok(false);
        }

        let txs = self.pending.load()?;
        info!(
            count = txs.len(),
            path = %self.pending.path().display(),
            "rebroadcasting pending transactions"
        );
        self.broadcast_all(&txs, false)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::ChainBuilder,
        testing::{self, MockRpc},
    };
    use std::cell::RefCell;

    struct Fixture {
        _dir: tempfile::TempDir,
        wallet: WalletFile,
        pending: PendingFile,
        txs: Vec<Transaction>,
    }

    fn fixture(payload_len: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let wallet = WalletFile::new(dir.path().join(".wallet.json"));
        let pending = PendingFile::for_wallet(wallet.path());

        let key = testing::key();
        let mut state = testing::funded_wallet(&key, &[50_000_000]);
        wallet.save(&state).unwrap();

        let payload = vec![0x42; payload_len];
        let txs = ChainBuilder::new(&key)
            .build(&mut state, &testing::other_key().address(), b"text/plain", &payload)
            .unwrap()
            .into_iter()
            .map(|built| built.transaction)
            .collect();

        Fixture {
            _dir: dir,
            wallet,
            pending,
            txs,
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(1),
            ..RetryPolicy::mempool_chain()
        }
    }

    fn mempool_chain_error() -> RpcError {
        RpcError::rejected(-26, "too-long-mempool-chain, too many unconfirmed ancestors [limit: 25]")
    }

    #[test]
    fn test_mempool_chain_error_detection() {
        assert!(is_mempool_chain_error(&mempool_chain_error()));
        assert!(!is_mempool_chain_error(&RpcError::rejected(-25, "bad-txns-inputs-missingorspent")));
        assert!(!is_mempool_chain_error(&RpcError::Response {
            status: 502,
            body: "too-long-mempool-chain".into(),
        }));
    }

    #[test]
    fn test_retry_until_accepted() {
        let f = fixture(10);
        let rpc = MockRpc::new(vec![Err(mempool_chain_error()), Err(mempool_chain_error())]);
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK)
            .with_policy(fast());

        broadcaster.broadcast(&f.txs[0], true).unwrap();

        assert_eq!(rpc.calls(), 3);
        assert_eq!(rpc.sent(), vec![serialize_hex(&f.txs[0]); 3]);
    }

    #[test]
    fn test_no_retry_fails_immediately() {
        let f = fixture(10);
        let rpc = MockRpc::new(vec![Err(mempool_chain_error()), Err(mempool_chain_error())]);
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK)
            .with_policy(fast());
        let before = f.wallet.load().unwrap();

        let result = broadcaster.broadcast(&f.txs[0], false);

        assert!(matches!(result, Err(Error::Rpc(RpcError::Rejected { code: -26, .. }))));
        assert_eq!(rpc.calls(), 1);
        assert_eq!(f.wallet.load().unwrap(), before);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let f = fixture(10);
        let rpc = MockRpc::new(vec![Err(RpcError::rejected(-25, "missing inputs"))]);
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK)
            .with_policy(fast());

        let err = broadcaster.broadcast(&f.txs[0], true).unwrap_err();

        assert_eq!(rpc.calls(), 1);
        match err {
            Error::Rpc(rpc_err) => assert_eq!(rpc_err.payload().unwrap()["error"]["code"], -25),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_bounded_policy_gives_up() {
        let f = fixture(10);
        let rpc = MockRpc::new((0..5).map(|_| Err(mempool_chain_error())).collect());
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..fast()
        };
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK)
            .with_policy(policy);

        assert!(broadcaster.broadcast(&f.txs[0], true).is_err());
        assert_eq!(rpc.calls(), 3);
    }

    #[test]
    fn test_broadcast_updates_wallet_file() {
        let f = fixture(10);
        let rpc = MockRpc::default();
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK);

        broadcaster.broadcast(&f.txs[0], false).unwrap();

        let wallet = f.wallet.load().unwrap();
        let txid = f.txs[0].compute_txid();
        assert!(wallet.utxos.iter().all(|utxo| utxo.txid != testing::utxo_txid(0)));
        assert!(wallet.utxos.iter().any(|utxo| utxo.txid == txid));
    }

    #[test]
    fn test_broadcast_all_success_clears_pending() {
        let f = fixture(2000);
        f.pending.save(&f.txs[..1]).unwrap();
        let rpc = MockRpc::default();
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK);

        broadcaster.broadcast_all(&f.txs, false).unwrap();

        assert_eq!(rpc.calls(), f.txs.len());
        assert!(!f.pending.exists());

        let sent: Vec<String> = f.txs.iter().map(serialize_hex).collect();
        assert_eq!(rpc.sent(), sent);
    }

    #[test]
    fn test_broadcast_all_saves_remaining_on_failure() {
        let f = fixture(5000);
        assert!(f.txs.len() > 3);

        let rpc = MockRpc::new(vec![
            Ok(()),
            Ok(()),
            Err(RpcError::rejected(-26, "mandatory-script-verify-flag-failed")),
        ]);
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK);

        let result = broadcaster.broadcast_all(&f.txs, false);

        assert!(matches!(result, Err(Error::Broadcast { index: 2, .. })));
        assert_eq!(rpc.calls(), 3);
        assert_eq!(f.pending.load().unwrap(), f.txs[2..].to_vec());

        // Resuming sends exactly the saved transactions and clears the file
        let rpc = MockRpc::default();
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK);
        assert!(broadcaster.resume().unwrap());

        let sent: Vec<String> = f.txs[2..].iter().map(serialize_hex).collect();
        assert_eq!(rpc.sent(), sent);
        assert!(!f.pending.exists());
        assert!(!broadcaster.resume().unwrap());
    }

    /// Node that accepts every transaction and clobbers the wallet file on the first
    struct ClobberingRpc {
        wallet: PathBuf,
        sent: RefCell<usize>,
    }

    impl NodeRpc for ClobberingRpc {
        fn send_raw_transaction(&self, _hex: &str) -> std::result::Result<(), RpcError> {
            if *self.sent.borrow() == 0 {
                fs::write(&self.wallet, "not a wallet").unwrap();
            }
            *self.sent.borrow_mut() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_accepted_transaction_is_not_left_pending() {
        let f = fixture(2000);
        let rpc = ClobberingRpc {
            wallet: f.wallet.path().to_path_buf(),
            sent: RefCell::new(0),
        };
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK);

        let result = broadcaster.broadcast_all(&f.txs, false);

        assert!(matches!(result, Err(Error::Json(_))));
        assert_eq!(*rpc.sent.borrow(), 1);
        assert_eq!(f.pending.load().unwrap(), f.txs[1..].to_vec());
    }

    #[test]
    fn test_resume_failure_keeps_remaining() {
        let f = fixture(2000);
        f.pending.save(&f.txs).unwrap();

        let rpc = MockRpc::new(vec![Ok(()), Err(mempool_chain_error())]);
        let broadcaster = Broadcaster::new(&rpc, &f.wallet, &f.pending, testing::NETWORK)
            .with_policy(fast());

        assert!(matches!(broadcaster.resume(), Err(Error::Broadcast { index: 1, .. })));
        assert_eq!(rpc.calls(), 2);
        assert_eq!(f.pending.load().unwrap(), f.txs[1..].to_vec());
    }

    #[test]
    fn test_pending_path_for_wallet() {
        assert_eq!(
            PendingFile::for_wallet(Path::new(".wallet.json")).path(),
            Path::new(".pending-txs.json")
        );
        assert_eq!(
            PendingFile::for_wallet(Path::new("/data/wallet-2.json")).path(),
            Path::new("/data/pending-txs-2.json")
        );
        assert_eq!(
            PendingFile::for_wallet(Path::new("/data/keys.json")).path(),
            Path::new("/data/pending-txs.json")
        );
    }

    #[test]
    fn test_clear_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let pending = PendingFile::new(dir.path().join("pending-txs.json"));
        pending.clear().unwrap();
    }

    #[test]
    fn test_parse_response() {
        assert!(parse_response(200, r#"{"result":"ab","error":null,"id":0}"#).is_ok());

        let err = parse_response(
            500,
            r#"{"result":null,"error":{"code":-26,"message":"too-long-mempool-chain"},"id":0}"#,
        )
        .unwrap_err();
        assert!(is_mempool_chain_error(&err));

        assert!(matches!(
            parse_response(401, ""),
            Err(RpcError::Response { status: 401, .. })
        ));
        assert!(matches!(
            parse_response(500, r#"{"result":null,"error":null}"#),
            Err(RpcError::Response { status: 500, .. })
        ));
    }
}
