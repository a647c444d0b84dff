//! Query signatures binding checkpoints to the query that produced them.

use std::fmt;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::config::Server;
use crate::record::normalize_affiliation;

/// Bytes of the affiliation digest kept in the signature.
const AFFILIATION_DIGEST_LEN: usize = 6;

/// Identity of one server query: server, date window and, in search mode,
/// the target affiliation.
///
/// Rendered as `biorxiv_2020-01-01_2020-12-31` or, with a target,
/// `biorxiv_2020-01-01_2020-12-31_aff-1a2b3c4d5e6f`. The affiliation is
/// hashed after normalization so equivalent spellings share checkpoints and
/// the signature stays filename-safe. It never contains a `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuerySignature(String);

impl QuerySignature {
    /// Builds the signature for a query.
    #[must_use]
    pub fn new(
        server: Server,
        start_date: NaiveDate,
        end_date: NaiveDate,
        target_affiliation: Option<&str>,
    ) -> Self {
        let mut value = format!("{server}_{start_date}_{end_date}");
        if let Some(target) = target_affiliation {
            let digest = Sha256::digest(normalize_affiliation(target).as_bytes());
            value.push_str("_aff-");
            value.push_str(&hex_encode(&digest[..AFFILIATION_DIGEST_LEN]));
        }
        Self(value)
    }

    /// The signature string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}
