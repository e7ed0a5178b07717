//! junk-20 token operations
//!
//! Operations are inscribed as compact JSON, for example
//! `{"p":"junk-20","op":"mint","tick":"junk","amt":"1000"}`. Amounts are written as
//! strings.

use crate::Result;
use serde::{Serialize, Serializer};

/// Protocol identifier carried in the `p` field
pub const PROTOCOL: &str = "junk-20";

/// Content type token operations are inscribed under
pub const CONTENT_TYPE: &str = "application/json";

/// A token operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// Creates a token with a total supply and a per-mint limit
    Deploy {
        /// Ticker
        tick: String,
        /// Total supply
        #[serde(serialize_with = "as_string")]
        max: u64,
        /// Amount allowed per mint
        #[serde(serialize_with = "as_string")]
        lim: u64,
    },
    /// Mints tokens to the inscription's receiver
    Mint {
        /// Ticker
        tick: String,
        /// Amount
        #[serde(serialize_with = "as_string")]
        amt: u64,
    },
    /// Creates a transfer inscription
    Transfer {
        /// Ticker
        tick: String,
        /// Amount
        #[serde(serialize_with = "as_string")]
        amt: u64,
    },
}

#[derive(Serialize)]
struct Document<'a> {
    p: &'static str,
    #[serde(flatten)]
    op: &'a Operation,
}

impl Operation {
    /// The JSON document to inscribe
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Document {
            p: PROTOCOL,
            op: self,
        })?)
    }
}

fn as_string<S: Serializer>(value: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
