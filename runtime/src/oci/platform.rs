//! Target platform (`os/arch[/variant]`) parsing and matching.

use std::fmt;

use dockboot_core::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};

/// Requested or advertised image platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Self {
            os: os.to_string(),
            architecture: normalize_arch(architecture).to_string(),
            variant: variant.map(str::to_string),
        }
    }

    /// Parse `os/arch[/variant]`; a bare `arch` means `linux/arch`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let invalid = || {
            ConvertError::InvalidReference(format!(
                "Invalid platform '{}': expected os/arch[/variant]",
                s
            ))
        };
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        match parts.as_slice() {
            [arch] => Ok(Self::new("linux", arch, None)),
            [os, arch] => Ok(Self::new(os, arch, None)),
            [os, arch, variant] => Ok(Self::new(os, arch, Some(variant))),
            _ => Err(invalid()),
        }
    }

    /// Platform of the running host.
    pub fn host() -> Self {
        Self::new("linux", std::env::consts::ARCH, None)
    }

    /// Index entries for attestations and signatures, not images.
    pub fn is_attestation(&self) -> bool {
        self.os == "unknown" || self.architecture == "unknown"
    }

    /// Whether an index entry advertising `candidate` satisfies this request.
    pub fn matches(&self, candidate: &Platform) -> bool {
        if self.os != candidate.os || self.architecture != normalize_arch(&candidate.architecture)
        {
            return false;
        }
        match &self.variant {
            None => true,
            Some(wanted) => {
                let have = candidate
                    .variant
                    .as_deref()
                    .or_else(|| default_variant(&candidate.architecture));
                have == Some(wanted.as_str())
            }
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new("linux", "amd64", None)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "x86-64" => "amd64",
        "aarch64" => "arm64",
        "i386" | "i686" => "386",
        other => other,
    }
}

fn default_variant(arch: &str) -> Option<&'static str> {
    match normalize_arch(arch) {
        "arm64" => Some("v8"),
        _ => None,
    }
}
