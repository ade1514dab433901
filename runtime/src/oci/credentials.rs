//! Persistent registry credentials.
//!
//! Stored per registry at `~/.dockboot/auth/credentials.json`, readable only
//! by the owner. Writes go to a temp file that is renamed into place.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use dockboot_core::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};

/// Stored login for one registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: BTreeMap<String, StoredCredential>,
}

/// File-backed credential store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `~/.dockboot/auth/credentials.json`.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            ConvertError::Config("Cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self::new(
            home.join(".dockboot").join("auth").join("credentials.json"),
        ))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save a login, replacing any previous one for the registry.
    pub fn store(&self, registry: &str, credential: StoredCredential) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(registry_key(registry), credential);
        self.save(&file)
    }

    pub fn get(&self, registry: &str) -> Result<Option<StoredCredential>> {
        Ok(self.load()?.registries.remove(&registry_key(registry)))
    }

    /// Forget a login. Returns whether one existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        if file.registries.remove(&registry_key(registry)).is_none() {
            return Ok(false);
        }
        self.save(&file)?;
        Ok(true)
    }

    /// Registries with a stored login, sorted.
    pub fn registries(&self) -> Result<Vec<String>> {
        Ok(self.load()?.registries.into_keys().collect())
    }

    fn load(&self) -> Result<CredentialFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialFile::default())
            }
            Err(e) => {
                return Err(ConvertError::Config(format!(
                    "Failed to read credential store {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            ConvertError::Config(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConvertError::io(format!("creating {}", parent.display()), e))?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(file)
            .map_err(|e| ConvertError::Internal(format!("Failed to encode credentials: {}", e)))?;
        std::fs::write(&tmp_path, data)
            .map_err(|e| ConvertError::io(format!("writing {}", tmp_path.display()), e))?;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| ConvertError::io(format!("chmod {}", tmp_path.display()), e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            ConvertError::io(
                format!("renaming {} -> {}", tmp_path.display(), self.path.display()),
                e,
            )
        })
    }
}

/// Docker Hub goes by several names; store them under one key.
fn registry_key(registry: &str) -> String {
    let r = registry.trim().to_ascii_lowercase();
    match r.as_str() {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => "docker.io".to_string(),
        _ => r,
    }
}
