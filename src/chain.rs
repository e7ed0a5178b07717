//! # Chain Builder
//!
//! Turns an envelope into a linked sequence of signed transactions. Each
//! transaction commits to the next slice of the envelope with a pay-to-script-hash
//! output and reveals the previous slice while spending the previous commitment. The
//! last transaction reveals the final slice and pays the destination.

use crate::{
    Error, Result,
    address::{Address, WalletKey},
    envelope::{self, Chunk, Envelope, MAX_PARTIAL_LEN, Partial},
    funding::{self, DUST_LIMIT, FeeRate, Spend, TxDraft},
    wallet::Wallet,
};
use bitcoin::{
    Amount, OutPoint, Script, ScriptBuf, ScriptHash, Transaction, TxOut, Txid,
    hashes::Hash,
};
use std::collections::VecDeque;
use tracing::debug;

/// Value locked in every commitment output and paid to the destination
pub const DEFAULT_COMMIT_VALUE: Amount = Amount::from_sat(100_000);

/// A built transaction together with the scripts linking it into the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    /// The signed transaction
    pub transaction: Transaction,
    /// Redeem script committed to by output 0. `None` for the final transaction.
    pub lock_script: Option<ScriptBuf>,
    /// Script revealing the previous slice on input 0. `None` for the first transaction.
    pub unlock_script: Option<ScriptBuf>,
}

impl ChainTransaction {
    /// Transaction id
    pub fn txid(&self) -> Txid {
        self.transaction.compute_txid()
    }
}

/// Splits an envelope into slices of at most [`MAX_PARTIAL_LEN`] serialized bytes.
///
/// The first slice starts with the marker on its own. Chunks then move over in
/// pairs while the slice is within the bound; a pair that pushes it over is moved
/// back.
pub fn pack(envelope: Envelope) -> Vec<Partial> {
    let mut remaining: VecDeque<Chunk> = envelope.into();
    let mut partials: Vec<Partial> = Vec::new();

    while !remaining.is_empty() {
        let mut partial = Partial::new();
        if partials.is_empty() {
            if let Some(marker) = remaining.pop_front() {
                partial.push(marker);
            }
        }

        let mut pairs = 0;
        while partial.script_len() <= MAX_PARTIAL_LEN && !remaining.is_empty() {
            for chunk in remaining.drain(..remaining.len().min(2)) {
                partial.push(chunk);
            }
            pairs += 1;
        }

        // A lone pair always fits since elements are capped well below the bound
        if partial.script_len() > MAX_PARTIAL_LEN && pairs > 1 {
            if let (Some(data), Some(tag)) = (partial.pop(), partial.pop()) {
                remaining.push_front(data);
                remaining.push_front(tag);
            }
        }

        partials.push(partial);
    }

    partials
}

/// The commitment output a transaction leaves for its successor
struct Commitment {
    outpoint: OutPoint,
    partial: Partial,
    lock: ScriptBuf,
}

/// Builds inscription chains funded and signed by a single wallet key
#[derive(Debug)]
pub struct ChainBuilder<'a> {
    key: &'a WalletKey,
    fee_rate: FeeRate,
    commit_value: Amount,
}

impl<'a> ChainBuilder<'a> {
    /// Creates a builder with the default fee rate and commit value
    pub fn new(key: &'a WalletKey) -> Self {
        Self {
            key,
            fee_rate: FeeRate::default(),
            commit_value: DEFAULT_COMMIT_VALUE,
        }
    }

    /// Sets the fee rate
    pub fn fee_rate(mut self, fee_rate: FeeRate) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Sets the value of commitment outputs and of the final payment
    pub fn commit_value(mut self, commit_value: Amount) -> Self {
        self.commit_value = commit_value;
        self
    }

    /// Builds the chain inscribing `payload` under `content_type` and delivering it
    /// to `destination`.
    ///
    /// Every transaction is funded from `wallet`, which is updated as the chain is
    /// built so later transactions spend earlier change. On error `wallet` is left
    /// untouched.
    pub fn build(
        &self,
        wallet: &mut Wallet,
        destination: &Address,
        content_type: &[u8],
        payload: &[u8],
    ) -> Result<Vec<ChainTransaction>> {
        if self.commit_value <= DUST_LIMIT {
            return Err(Error::Validation(format!(
                "commit value {} must exceed the dust limit of {}",
                self.commit_value.to_sat(),
                DUST_LIMIT.to_sat()
            )));
        }

        let envelope = envelope::encode(content_type, payload)?;
        let owner = self.key.address().script_pubkey();
        let mut ledger = wallet.clone();
        let mut chain = Vec::new();
        let mut previous = None;

        for partial in pack(envelope) {
            let lock = partial.lock_script(self.key.public_key());

            let mut draft = TxDraft::new();
            draft.add_output(TxOut {
                value: self.commit_value,
                script_pubkey: ScriptBuf::new_p2sh(&ScriptHash::hash(lock.as_bytes())),
            });

            let mut built = self.link(&mut ledger, draft, previous.take(), &owner)?;
            debug!(
                index = chain.len(),
                txid = %built.txid(),
                chunks = partial.len(),
                "built commit transaction"
            );

            previous = Some(Commitment {
                outpoint: OutPoint::new(built.txid(), 0),
                partial,
                lock: lock.clone(),
            });
            built.lock_script = Some(lock);
            chain.push(built);
        }

        let mut draft = TxDraft::new();
        draft.add_output(TxOut {
            value: self.commit_value,
            script_pubkey: destination.script_pubkey(),
        });
        let built = self.link(&mut ledger, draft, previous, &owner)?;
        debug!(index = chain.len(), txid = %built.txid(), "built final transaction");
        chain.push(built);

        *wallet = ledger;
        Ok(chain)
    }

    /// Spends `previous` on input 0 of `draft`, funds it, reveals the previous slice
    /// and applies the result to the ledger
    fn link(
        &self,
        ledger: &mut Wallet,
        mut draft: TxDraft,
        previous: Option<Commitment>,
        owner: &Script,
    ) -> Result<ChainTransaction> {
        if let Some(previous) = &previous {
            draft.add_input(
                previous.outpoint,
                Spend::Reveal {
                    value: self.commit_value,
                    partial: previous.partial.clone(),
                    lock: previous.lock.clone(),
                },
            );
        }

        funding::fund(ledger, self.key, &mut draft, self.fee_rate)?;

        let unlock_script = match &previous {
            Some(previous) => {
                let signature = self.key.sign(draft.transaction(), 0, &previous.lock)?;
                let unlock = previous.partial.unlock_script(&signature, &previous.lock)?;
                draft.set_unlock(0, unlock.clone());
                Some(unlock)
            }
            None => None,
        };

        let transaction = draft.into_transaction();
        ledger.update(&transaction, owner);

        Ok(ChainTransaction {
            transaction,
            lock_script: None,
            unlock_script,
        })
    }
}
