//! # Junkscribe
//!
//! Inscribes arbitrary content on a UTXO chain with Junkcoin addresses. The
//! content is framed into an envelope of script chunks, revealed across a chain of
//! pay-to-script-hash commit and reveal transactions, and can be reassembled from
//! the first reveal's transaction id.
//!
//! Wallet state lives in a single JSON file that is read and rewritten around every
//! operation that moves money. One process per wallet file at a time.

// Coding conventions
#![deny(unsafe_code)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(missing_docs)]

#[cfg(not(any(feature = "std")))]
compile_error!("`std` must be enabled");

pub mod address;
pub mod broadcast;
pub mod chain;
pub mod config;
pub mod decoder;
pub mod envelope;
mod error;
pub mod funding;
pub mod indexer;
pub mod server;
pub mod session;
pub mod token;
pub mod wallet;

pub use error::{Error, Result};
