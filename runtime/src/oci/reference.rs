//! OCI image reference parsing.
//!
//! Parses image references like `ghcr.io/org/app:v1.2` into structured components.

use dockboot_core::error::{ConvertError, Result};

use super::digest::Digest;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Host that actually serves the Docker Hub API.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    /// - `https://ghcr.io/org/image` → ghcr.io/org/image:latest
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim();
        let reference = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        if reference.is_empty() {
            return Err(ConvertError::InvalidReference(
                "Empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest_part)) => {
                let digest = Digest::parse(digest_part).map_err(|_| {
                    ConvertError::InvalidReference(format!(
                        "Invalid digest in reference '{}': expected sha256:<64 hex>",
                        reference
                    ))
                })?;
                (name_tag, Some(digest))
            }
            None => (reference, None),
        };

        // Tag is the last colon after the last slash; a bare `host:port` has none.
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => match name_tag[slash_pos + 1..].rfind(':') {
                Some(colon_pos) => {
                    let split = slash_pos + 1 + colon_pos;
                    (&name_tag[..split], Some(&name_tag[split + 1..]))
                }
                None => (name_tag, None),
            },
            None => match name_tag.rsplit_once(':') {
                Some((name, tag)) => (name, Some(tag)),
                None => (name_tag, None),
            },
        };

        if let Some(tag) = tag {
            validate_tag(tag, reference)?;
        }

        let (registry, repository) = Self::split_registry_repository(name)?;
        validate_repository(&repository, reference)?;

        // Apply default tag if no tag and no digest
        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // A first component with a dot or colon, or "localhost", names a registry
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(ConvertError::InvalidReference(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                let registry = match first {
                    "index.docker.io" | DOCKER_HUB_API_HOST => DEFAULT_REGISTRY,
                    other => other,
                };
                let repository = if registry == DEFAULT_REGISTRY && !rest.contains('/') {
                    format!("library/{}", rest)
                } else {
                    rest.to_string()
                };
                return Ok((registry.to_string(), repository));
            }
        }

        // No registry detected, use the default
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Host that serves the registry API for this reference.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Manifest reference to request: the digest when pinned, otherwise the tag.
    pub fn manifest_reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Tags: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
fn validate_tag(tag: &str, reference: &str) -> Result<()> {
    let mut chars = tag.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphanumeric() || first == '_')
                && tag.len() <= 128
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConvertError::InvalidReference(format!(
            "Invalid tag '{}' in reference '{}'",
            tag, reference
        )))
    }
}

/// Repository components: lowercase alphanumerics joined by separators, split by `/`.
fn validate_repository(repository: &str, reference: &str) -> Result<()> {
    let component_ok = |component: &str| {
        let bytes = component.as_bytes();
        let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        if bytes.is_empty() || !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
            return false;
        }
        // Separators: `.`, `_`, `__` or a run of `-`.
        let mut run: Vec<u8> = Vec::new();
        for &b in bytes {
            if is_alnum(b) {
                run.clear();
            } else if matches!(b, b'.' | b'_' | b'-') {
                run.push(b);
                let ok = match run.as_slice() {
                    [_] => true,
                    [b'_', b'_'] => true,
                    r => r.iter().all(|&c| c == b'-'),
                };
                if !ok {
                    return false;
                }
            } else {
                return false;
            }
        }
        true
    };

    if repository.split('/').all(component_ok) {
        Ok(())
    } else {
        Err(ConvertError::InvalidReference(format!(
            "Invalid repository '{}' in reference '{}'",
            repository, reference
        )))
    }
}
