//! # UTXO Funder
//!
//! Incremental coin selection over a [`TxDraft`]. Inputs are added one at a time in
//! wallet order and the change output is recomputed after each one. Fees are charged
//! on the size the transaction has once every input carries its largest possible
//! unlocking script, so the fee never falls short of the signed transaction.

use crate::{
    Error, Result,
    address::WalletKey,
    envelope::Partial,
    wallet::Wallet,
};
use bitcoin::{
    Amount, OutPoint, PublicKey, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
    absolute::LockTime, consensus, script::Builder, transaction::Version,
};

/// Default fee rate per 1000 bytes
pub const DEFAULT_FEE_PER_KB: u64 = 100_000;

/// Smallest output value the network relays
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Upper bound of a DER signature plus sighash byte
const MAX_SIGNATURE_LEN: usize = 73;

/// Fee charged per 1000 serialized bytes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FeeRate(u64);

impl FeeRate {
    /// Creates a rate in smallest units per 1000 bytes
    pub const fn per_kb(rate: u64) -> Self {
        Self(rate)
    }

    /// Fee for a transaction of `size` bytes, rounded up
    pub fn fee(&self, size: usize) -> Amount {
        Amount::from_sat((size as u64 * self.0).div_ceil(1000))
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self(DEFAULT_FEE_PER_KB)
    }
}

/// How an input of a draft gets unlocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spend {
    /// Wallet-owned output, signed by [`TxDraft::sign`]
    Wallet {
        /// Value of the output being spent
        value: Amount,
        /// Its locking script, used as the signature script code
        script_pubkey: ScriptBuf,
    },
    /// Commitment output unlocked by revealing `partial`. Never touched by
    /// [`TxDraft::sign`]; the chain builder attaches the unlocking script.
    Reveal {
        /// Value of the commitment output
        value: Amount,
        /// Chunks revealed when spending
        partial: Partial,
        /// Redeem script the output commits to
        lock: ScriptBuf,
    },
}

impl Spend {
    /// Value of the output being spent
    pub fn value(&self) -> Amount {
        match self {
            Spend::Wallet { value, .. } | Spend::Reveal { value, .. } => *value,
        }
    }

    /// Largest unlocking script this input can end up with
    fn max_unlock_len(&self, public_key: &PublicKey) -> usize {
        match self {
            Spend::Wallet { .. } => push_len(MAX_SIGNATURE_LEN) + push_len(public_key.to_bytes().len()),
            Spend::Reveal { partial, lock, .. } => {
                partial.script_len() + push_len(MAX_SIGNATURE_LEN) + push_len(lock.len())
            }
        }
    }
}

/// A transaction under construction together with how each input is unlocked
#[derive(Debug, Clone)]
pub struct TxDraft {
    tx: Transaction,
    spends: Vec<Spend>,
    change: Option<usize>,
}

impl Default for TxDraft {
    fn default() -> Self {
        Self::new()
    }
}

impl TxDraft {
    /// Creates an empty version 1 transaction
    pub fn new() -> Self {
        Self {
            tx: Transaction {
                version: Version::ONE,
                lock_time: LockTime::ZERO,
                input: Vec::new(),
                output: Vec::new(),
            },
            spends: Vec::new(),
            change: None,
        }
    }

    /// Adds an input
    pub fn add_input(&mut self, previous_output: OutPoint, spend: Spend) {
        self.tx.input.push(TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
        self.spends.push(spend);
    }

    /// Adds an output ahead of the change output
    pub fn add_output(&mut self, output: TxOut) {
        match self.change {
            Some(index) => {
                self.tx.output.insert(index, output);
                self.change = Some(index + 1);
            }
            None => self.tx.output.push(output),
        }
    }

    /// The transaction as built so far
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Index of the change output, if there is one
    pub fn change_index(&self) -> Option<usize> {
        self.change
    }

    /// Consumes the draft
    pub fn into_transaction(self) -> Transaction {
        self.tx
    }

    /// Sum of input values
    pub fn input_total(&self) -> Amount {
        self.spends.iter().map(Spend::value).sum()
    }

    /// Sum of output values, change included
    pub fn output_total(&self) -> Amount {
        self.tx.output.iter().map(|output| output.value).sum()
    }

    /// Serialized size once every input carries its largest unlocking script
    pub fn estimated_size(&self, public_key: &PublicKey) -> usize {
        let current = consensus::serialize(&self.tx).len();

        self.tx
            .input
            .iter()
            .zip(&self.spends)
            .fold(current, |size, (input, spend)| {
                size - script_field_len(input.script_sig.len())
                    + script_field_len(spend.max_unlock_len(public_key))
            })
    }

    /// Fee for the estimated size
    pub fn fee(&self, rate: FeeRate, public_key: &PublicKey) -> Amount {
        rate.fee(self.estimated_size(public_key))
    }

    /// True once there is an input and an output and the inputs cover outputs plus fee
    pub fn is_funded(&self, rate: FeeRate, public_key: &PublicKey) -> bool {
        !self.tx.input.is_empty()
            && !self.tx.output.is_empty()
            && self.input_total() >= self.output_total() + self.fee(rate, public_key)
    }

    /// Recomputes the change output paying `script`. The output is dropped when the
    /// remainder after fee would be below [`DUST_LIMIT`].
    pub fn set_change(&mut self, script: &Script, rate: FeeRate, public_key: &PublicKey) {
        if let Some(index) = self.change.take() {
            self.tx.output.remove(index);
        }

        let spent = self.output_total();
        self.tx.output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: script.to_owned(),
        });
        let index = self.tx.output.len() - 1;
        let needed = spent + self.fee(rate, public_key);

        match self.input_total().checked_sub(needed) {
            Some(change) if change >= DUST_LIMIT => {
                self.tx.output[index].value = change;
                self.change = Some(index);
            }
            _ => {
                self.tx.output.pop();
            }
        }
    }

    /// Signs every wallet input; reveal inputs are skipped
    pub fn sign(&mut self, key: &WalletKey) -> Result<()> {
        for (index, spend) in self.spends.iter().enumerate() {
            let Spend::Wallet { script_pubkey, .. } = spend else {
                continue;
            };

            let signature = key.sign(&self.tx, index, script_pubkey)?;
            let script_sig = Builder::new()
                .push_slice(
                    bitcoin::script::PushBytesBuf::try_from(signature)
                        .map_err(|_| Error::Validation("signature too long".into()))?,
                )
                .push_key(key.public_key())
                .into_script();

            self.tx.input[index].script_sig = script_sig;
        }

        Ok(())
    }

    /// Attaches an unlocking script to an input
    pub fn set_unlock(&mut self, index: usize, script_sig: ScriptBuf) {
        self.tx.input[index].script_sig = script_sig;
    }
}

/// Adds wallet outputs to `draft` in wallet order until it pays for its outputs and
/// fee, sending change back to the wallet key's address. Wallet inputs are signed
/// once the selection settles.
///
/// Fails with [`Error::InsufficientFunds`] once every output has been tried.
pub fn fund(wallet: &Wallet, key: &WalletKey, draft: &mut TxDraft, rate: FeeRate) -> Result<()> {
    let public_key = *key.public_key();
    let change = key.address().script_pubkey();

    draft.set_change(&change, rate, &public_key);

    for utxo in &wallet.utxos {
        if draft.is_funded(rate, &public_key) {
            break;
        }

        draft.add_input(
            utxo.outpoint(),
            Spend::Wallet {
                value: utxo.amount(),
                script_pubkey: utxo.script.clone(),
            },
        );
        draft.set_change(&change, rate, &public_key);
    }

    draft.sign(key)?;
    check_funded(draft, rate, &public_key)
}

/// Spends every wallet output into `draft` and sends whatever is left after outputs
/// and fee to `change_to`.
pub fn sweep(
    wallet: &Wallet,
    key: &WalletKey,
    draft: &mut TxDraft,
    change_to: &Script,
    rate: FeeRate,
) -> Result<()> {
    let public_key = *key.public_key();

    for utxo in &wallet.utxos {
        draft.add_input(
            utxo.outpoint(),
            Spend::Wallet {
                value: utxo.amount(),
                script_pubkey: utxo.script.clone(),
            },
        );
    }

    draft.set_change(change_to, rate, &public_key);
    draft.sign(key)?;

    check_funded(draft, rate, &public_key)
}

fn check_funded(draft: &TxDraft, rate: FeeRate, public_key: &PublicKey) -> Result<()> {
    if draft.is_funded(rate, public_key) {
        return Ok(());
    }

    Err(Error::InsufficientFunds {
        needed: (draft.output_total() + draft.fee(rate, public_key)).to_sat(),
        available: draft.input_total().to_sat(),
    })
}

/// Bytes taken by a minimal push of `len` bytes
fn push_len(len: usize) -> usize {
    match len {
        0..=75 => 1 + len,
        76..=255 => 2 + len,
        256..=65535 => 3 + len,
        _ => 5 + len,
    }
}

/// Bytes taken by a length-prefixed script field
fn script_field_len(len: usize) -> usize {
    let prefix = match len {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    };
    prefix + len
}
