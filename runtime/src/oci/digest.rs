//! Content digests and incremental verification.

use std::fmt;

use dockboot_core::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Parse `sha256:<64 lowercase hex>`.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            ConvertError::Protocol(format!("Invalid digest '{}': expected algorithm:hex", s))
        })?;
        if algorithm != "sha256" {
            return Err(ConvertError::Protocol(format!(
                "Unsupported digest algorithm '{}'",
                algorithm
            )));
        }
        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ConvertError::Protocol(format!("Invalid sha256 digest '{}'", s)));
        }
        Ok(Self {
            hex: hex.to_string(),
        })
    }

    /// Digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Self {
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    /// Hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Short form for logs.
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }

    /// Start an incremental verification against this digest.
    pub fn verifier(&self) -> DigestVerifier {
        DigestVerifier {
            expected: self.clone(),
            hasher: Sha256::new(),
            len: 0,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.hex)
    }
}

impl TryFrom<String> for Digest {
    type Error = ConvertError;

    fn try_from(value: String) -> Result<Self> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

/// Hashes content as it streams past and checks it at the end.
pub struct DigestVerifier {
    expected: Digest,
    hasher: Sha256,
    len: u64,
}

impl DigestVerifier {
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes seen so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fail with `IntegrityError` unless the content matched.
    pub fn finish(self) -> Result<()> {
        let actual = hex::encode(self.hasher.finalize());
        if actual == self.expected.hex {
            Ok(())
        } else {
            Err(ConvertError::IntegrityError {
                digest: self.expected.to_string(),
                actual: format!("sha256:{}", actual),
            })
        }
    }
}
