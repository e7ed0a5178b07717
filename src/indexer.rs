//! Client for the UTXO indexing API

use crate::Result;
use bitcoin::Txid;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

/// Default indexer endpoint
pub const DEFAULT_INDEXER_URL: &str = "https://api.junkiewally.xyz";

/// An unspent output as listed by `GET /address/{address}/utxo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressUtxo {
    /// Funding transaction
    pub txid: Txid,
    /// Output index
    pub vout: u32,
    /// Value in the smallest unit
    pub value: u64,
}

/// Body of `GET /tx/{txid}/raw`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    /// The indexed transaction
    pub transaction: IndexedTransaction,
}

/// The parts of an indexed transaction the decoder walks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTransaction {
    /// Inputs in order
    pub inputs: Vec<IndexedInput>,
    /// Outputs in order
    pub outputs: Vec<IndexedOutput>,
}

/// An indexed input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedInput {
    /// Unlocking script
    #[serde(rename = "scriptSig")]
    pub script_sig: ScriptHex,
}

/// A script in hex form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptHex {
    /// Hex-encoded script bytes
    pub hex: String,
}

/// An indexed output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedOutput {
    /// Transaction spending this output, once spent
    #[serde(default)]
    pub spent: Option<SpentBy>,
}

/// Pointer to a spending transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentBy {
    /// Spending transaction id
    pub hash: String,
}

/// Read access to indexed chain data
pub trait Indexer {
    /// Lists the unspent outputs of an address
    fn address_utxos(&self, address: &str) -> Result<Vec<AddressUtxo>>;

    /// Fetches a transaction with spent-output pointers
    fn raw_transaction(&self, txid: &str) -> Result<IndexedTransaction>;
}

/// [`Indexer`] backed by the indexer HTTP API
#[derive(Debug, Clone)]
pub struct HttpIndexer {
    client: Client,
    base_url: String,
}

impl HttpIndexer {
    /// Creates a client for the API at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

impl Indexer for HttpIndexer {
    fn address_utxos(&self, address: &str) -> Result<Vec<AddressUtxo>> {
        let url = format!("{}/address/{}/utxo", self.base_url, address);
        Ok(self.client.get(url).send()?.error_for_status()?.json()?)
    }

    fn raw_transaction(&self, txid: &str) -> Result<IndexedTransaction> {
        let url = format!("{}/tx/{}/raw", self.base_url, txid);
        let raw: RawTransaction = self.client.get(url).send()?.error_for_status()?.json()?;
        Ok(raw.transaction)
    }
}
