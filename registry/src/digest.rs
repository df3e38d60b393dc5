//! Content digest primitives.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error indicating that a string could not be parsed as a digest
#[derive(Debug, Error)]
#[error("Invalid digest: {value:?}")]
pub struct InvalidDigest {
    value: String,
}

impl InvalidDigest {
    pub(crate) fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// A content address in `algorithm:hex` form (e.g. `sha256:ab12…`).
///
/// Digests identify blobs in storage and serve as node identity in the
/// reference graph. Two digests are equal iff their string forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Compute the sha256 digest of the given bytes.
    pub fn sha256(data: &[u8]) -> Self {
        use sha2::Digest as _;
        Digest(format!("sha256:{}", hex::encode(sha2::Sha256::digest(data))))
    }

    /// The algorithm component (e.g. `sha256`).
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(alg, _)| alg).unwrap_or("")
    }

    /// The hex-encoded hash component.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or("")
    }

    /// The full string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The relative storage path for this digest: `<algorithm>/<hex>`.
    pub fn to_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}/{}", self.algorithm(), self.hex()))
    }
}

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((algorithm, hex)) = s.split_once(':') else {
            return Err(InvalidDigest::new(s));
        };

        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(InvalidDigest::new(s));
        }

        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidDigest::new(s));
        }

        Ok(Digest(s.to_string()))
    }
}

impl TryFrom<String> for Digest {
    type Error = InvalidDigest;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
