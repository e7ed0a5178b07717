//! # Wallet Ledger
//!
//! A single-key wallet with a flat list of unspent outputs, persisted as JSON:
//!
//! ```json
//! { "privkey": "<wif>", "address": "<base58>", "utxos": [{ "txid", "vout", "satoshis", "script" }] }
//! ```
//!
//! The file is read before and rewritten after every operation that moves money.
//! There is no locking: running two processes against one wallet file at the same
//! time is not supported.

use crate::{
    Error, Result,
    address::{Address, Network, WalletKey},
    indexer::Indexer,
};
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

/// A spendable output owned by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Funding transaction
    pub txid: Txid,
    /// Output index
    pub vout: u32,
    /// Value in the smallest unit
    pub satoshis: u64,
    /// Locking script
    pub script: ScriptBuf,
}

impl Utxo {
    /// The outpoint identifying this output
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    /// The value as an amount
    pub fn amount(&self) -> Amount {
        Amount::from_sat(self.satoshis)
    }
}

/// Wallet state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Private key in wallet-import-format
    pub privkey: String,
    /// Receiving address
    pub address: String,
    /// Unspent outputs in funding order
    #[serde(default)]
    pub utxos: Vec<Utxo>,
}

impl Wallet {
    /// Creates an empty wallet for a key
    pub fn new(key: &WalletKey) -> Self {
        Self {
            privkey: key.to_wif(),
            address: key.address().to_string(),
            utxos: Vec::new(),
        }
    }

    /// Parses the wallet key
    pub fn key(&self, network: Network) -> Result<WalletKey> {
        Ok(WalletKey::from_wif(&self.privkey, network)?)
    }

    /// Parses the wallet address
    pub fn address(&self, network: Network) -> Result<Address> {
        Ok(Address::parse(&self.address, network)?)
    }

    /// Sum of all unspent outputs
    pub fn balance(&self) -> u64 {
        self.utxos.iter().map(|utxo| utxo.satoshis).sum()
    }

    /// Applies a transaction to the ledger: outputs it spends are removed and
    /// outputs paying `owner` are appended.
    pub fn update(&mut self, tx: &Transaction, owner: &Script) {
        self.utxos.retain(|utxo| {
            !tx.input
                .iter()
                .any(|input| input.previous_output == utxo.outpoint())
        });

        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey.as_script() == owner {
                self.utxos.push(Utxo {
                    txid,
                    vout: vout as u32,
                    satoshis: output.value.to_sat(),
                    script: output.script_pubkey.clone(),
                });
            }
        }
    }

    /// Replaces the unspent outputs with the indexer's view of the address
    pub fn sync<I: Indexer + ?Sized>(&mut self, indexer: &I, network: Network) -> Result<()> {
        let script = self.address(network)?.script_pubkey();

        info!(address = %self.address, "syncing utxos with indexer");
        self.utxos = indexer
            .address_utxos(&self.address)?
            .into_iter()
            .map(|utxo| Utxo {
                txid: utxo.txid,
                vout: utxo.vout,
                satoshis: utxo.value,
                script: script.clone(),
            })
            .collect();

        Ok(())
    }
}

/// JSON file holding a [`Wallet`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletFile {
    path: PathBuf,
}

impl WalletFile {
    /// Refers to the wallet stored at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the file exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the wallet
    pub fn load(&self) -> Result<Wallet> {
        let json = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Overwrites the wallet
    pub fn save(&self, wallet: &Wallet) -> Result<()> {
        fs::write(&self.path, serde_json::to_string_pretty(wallet)?)?;
        Ok(())
    }

    /// Writes a new wallet, refusing to replace an existing one
    pub fn create(&self, wallet: &Wallet) -> Result<()> {
        if self.exists() {
            return Err(Error::WalletExists(self.path.clone()));
        }
        self.save(wallet)
    }

    /// Generates a key and writes an empty wallet for it
    pub fn generate(&self, network: Network) -> Result<Wallet> {
        let wallet = Wallet::new(&WalletKey::generate(network));
        self.create(&wallet)?;
        info!(address = %wallet.address, "created wallet");
        Ok(wallet)
    }

    /// Syncs the stored wallet with the indexer and saves it. The indexer only
    /// serves mainnet.
    pub fn sync<I: Indexer + ?Sized>(&self, indexer: &I, network: Network) -> Result<Wallet> {
        if network == Network::Testnet {
            return Err(Error::Validation("no indexer available for testnet".into()));
        }

        let mut wallet = self.load()?;
        wallet.sync(indexer, network)?;
        self.save(&wallet)?;
        Ok(wallet)
    }
}
