//! Content identifiers accepted by the delivery scheduler.
//!
//! Only the two canonical textual forms served by HTTP gateways are accepted:
//! legacy CIDv0 (`Qm` + 44 base58btc characters) and CIDv1 in lowercase
//! base32 (`b` + 58 characters). Every other string is rejected before any
//! network traffic is generated.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Total length of a CIDv0 string.
const CID_V0_LEN: usize = 46;

/// Total length of a base32 CIDv1 string for a sha2-256 multihash.
const CID_V1_LEN: usize = 59;

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Canonical encoding a [`Cid`] was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CidVersion {
    /// Legacy base58btc form starting with `Qm`.
    V0,
    /// Base32 multibase form starting with `b`.
    V1,
}

/// Validated content identifier.
///
/// Construction goes through [`Cid::parse`], so holding a `Cid` means the
/// string matched one of the canonical forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid(String);

/// Errors produced while parsing a content identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidError {
    #[error("Malformed CID: {value:?}")]
    Malformed { value: String },
}

impl Cid {
    /// Parses and validates a CID string.
    ///
    /// # Errors
    ///
    /// - `CidError::Malformed` - String is not a canonical CIDv0 or base32 CIDv1
    pub fn parse(value: &str) -> Result<Self, CidError> {
        if detect_version(value).is_some() {
            Ok(Self(value.to_string()))
        } else {
            Err(CidError::Malformed {
                value: value.to_string(),
            })
        }
    }

    /// Returns the CID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the canonical encoding of this CID.
    pub fn version(&self) -> CidVersion {
        // Parsing guarantees a match.
        if self.0.starts_with("Qm") {
            CidVersion::V0
        } else {
            CidVersion::V1
        }
    }
}

/// Returns the canonical version of `value`, or `None` when malformed.
pub fn detect_version(value: &str) -> Option<CidVersion> {
    let bytes = value.as_bytes();

    if bytes.len() == CID_V0_LEN
        && value.starts_with("Qm")
        && bytes.iter().all(|b| BASE58_ALPHABET.contains(b))
    {
        return Some(CidVersion::V0);
    }

    if bytes.len() == CID_V1_LEN
        && bytes[0] == b'b'
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(b))
    {
        return Some(CidVersion::V1);
    }

    None
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Cid {
    type Error = CidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if detect_version(&value).is_some() {
            Ok(Self(value))
        } else {
            Err(CidError::Malformed { value })
        }
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.0
    }
}

impl AsRef<str> for Cid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
