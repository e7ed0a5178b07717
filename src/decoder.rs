//! # Decoder
//!
//! Reassembles an inscription from the transaction that first reveals it. The
//! reveal scripts are read in chain order: when a transaction's chunks run out before
//! the countdown reaches zero, the transaction that spent its first output is
//! fetched and reading continues there.

use crate::{
    Result,
    envelope::{self, Chunk, MARKER},
    indexer::{Indexer, IndexedTransaction},
};
use bitcoin::ScriptBuf;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while reassembling an inscription
#[derive(Debug, Error)]
pub enum Error {
    /// The first input does not start with the marker
    #[error("not an inscription")]
    NotAnInscription,
    /// The transaction has no inputs to read
    #[error("transaction {0} has no inputs")]
    MissingInput(String),
    /// The inscription continues but the first output of `0` was never spent
    #[error("inscription continues past transaction {0} but its first output is unspent")]
    MissingContinuation(String),
    /// A chunk is missing or of the wrong kind
    #[error("malformed inscription: {0}")]
    Malformed(&'static str),
    /// An unlocking script could not be parsed
    #[error(transparent)]
    Script(#[from] envelope::Error),
}

/// Content recovered from a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inscription {
    /// Declared content type
    pub content_type: String,
    /// Reassembled payload
    pub data: Vec<u8>,
}

/// Fetches `txid` from `indexer` and reassembles the inscription it starts.
///
/// Reading stops once the countdown reaches zero, or when the chunks run out with
/// no part count left to follow, in which case the data read so far is returned.
pub fn extract<I: Indexer + ?Sized>(indexer: &I, txid: &str) -> Result<Inscription> {
    let mut txid = txid.to_owned();
    let mut tx = indexer.raw_transaction(&txid)?;
    let mut chunks = first_input_chunks(&tx, &txid)?;

    match chunks.pop_front() {
        Some(chunk) if chunk.as_bytes() == Some(MARKER) => {}
        _ => return Err(Error::NotAnInscription.into()),
    }

    let total = chunks
        .pop_front()
        .and_then(|chunk| chunk.number())
        .ok_or(Error::Malformed("missing part count"))?;

    let content_type = match chunks.pop_front() {
        Some(Chunk::Push(bytes)) => String::from_utf8_lossy(bytes.as_bytes()).into_owned(),
        _ => return Err(Error::Malformed("missing content type").into()),
    };

    let mut data = Vec::new();
    let mut remaining = total;

    while remaining > 0 {
        let Some(chunk) = chunks.pop_front() else {
            break;
        };

        if chunk.number() != Some(remaining - 1) {
            let next = tx
                .outputs
                .first()
                .and_then(|output| output.spent.as_ref())
                .map(|spent| spent.hash.clone())
                .ok_or_else(|| Error::MissingContinuation(txid.clone()))?;

            debug!(from = %txid, to = %next, remaining, "following inscription");
            txid = next;
            tx = indexer.raw_transaction(&txid)?;
            chunks = first_input_chunks(&tx, &txid)?;
            continue;
        }

        match chunks.pop_front() {
            Some(Chunk::Push(part)) => data.extend_from_slice(part.as_bytes()),
            _ => return Err(Error::Malformed("missing data after part count").into()),
        }
        remaining -= 1;
    }

    Ok(Inscription { content_type, data })
}

fn first_input_chunks(tx: &IndexedTransaction, txid: &str) -> Result<VecDeque<Chunk>> {
    let input = tx
        .inputs
        .first()
        .ok_or_else(|| Error::MissingInput(txid.to_owned()))?;
    let script = ScriptBuf::from_bytes(hex::decode(&input.script_sig.hex)?);

    Ok(envelope::from_script(&script)
        .map_err(Error::from)?
        .into())
}
