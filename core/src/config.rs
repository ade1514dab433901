use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConvertError, Result};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Conversion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Smallest accepted disk size in bytes
    pub min_size_bytes: u64,

    /// Largest accepted disk size in bytes
    pub max_size_bytes: u64,

    /// Partition layout
    pub partitioning: Partitioning,

    /// Filesystem labels
    pub root_label: String,
    pub boot_label: String,

    /// What to do when the image ships no kernel
    pub kernel_policy: KernelPolicy,

    /// Kernel command line appended after `root=`
    pub kernel_cmdline: String,

    /// GRUB menu timeout in seconds
    pub bootloader_timeout_secs: u32,

    /// Registry and download settings
    pub registry: RegistryConfig,

    /// Ceiling for a whole conversion, in seconds
    pub conversion_timeout_secs: u64,

    /// Parent directory for per-conversion workspaces (system temp if unset)
    pub workspace_dir: Option<PathBuf>,

    /// Keep the workspace after the conversion ends
    pub preserve_workspace: bool,

    /// Keep a failed image as `<output>.partial` instead of deleting it
    pub preserve_failed_image: bool,

    /// Share of the root partition reserved for filesystem metadata
    pub filesystem_overhead_percent: u8,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: 512 * MIB,
            max_size_bytes: 64 * GIB,
            partitioning: Partitioning::default(),
            root_label: "rootfs".to_string(),
            boot_label: "BOOT".to_string(),
            kernel_policy: KernelPolicy::default(),
            kernel_cmdline: "ro console=tty0 console=ttyS0,115200".to_string(),
            bootloader_timeout_secs: 5,
            registry: RegistryConfig::default(),
            conversion_timeout_secs: 3600, // 1 hour
            workspace_dir: None,
            preserve_workspace: false,
            preserve_failed_image: false,
            filesystem_overhead_percent: 8,
        }
    }
}

impl ConvertConfig {
    /// Load a YAML configuration file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ConvertError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: ConvertConfig = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce a working conversion.
    pub fn validate(&self) -> Result<()> {
        if self.min_size_bytes == 0 || self.min_size_bytes > self.max_size_bytes {
            return Err(ConvertError::Config(format!(
                "Invalid disk size range {}..={}",
                self.min_size_bytes, self.max_size_bytes
            )));
        }
        if let Partitioning::SeparateBoot { boot_size_bytes } = self.partitioning {
            if boot_size_bytes < 32 * MIB || boot_size_bytes >= self.min_size_bytes {
                return Err(ConvertError::Config(format!(
                    "Boot partition size {} must be at least 32 MiB and below the minimum disk size",
                    boot_size_bytes
                )));
            }
        }
        if self.filesystem_overhead_percent >= 100 {
            return Err(ConvertError::Config(
                "filesystem_overhead_percent must be below 100".to_string(),
            ));
        }
        if self.registry.max_concurrent_downloads == 0 {
            return Err(ConvertError::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.registry.retry.max_attempts == 0 {
            return Err(ConvertError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Check a requested disk size against the accepted range.
    pub fn check_disk_size(&self, size_bytes: u64) -> Result<()> {
        if size_bytes < self.min_size_bytes || size_bytes > self.max_size_bytes {
            return Err(ConvertError::Config(format!(
                "Disk size {} bytes outside accepted range {}..={}",
                size_bytes, self.min_size_bytes, self.max_size_bytes
            )));
        }
        Ok(())
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }
}

/// Partition layout of the produced disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Partitioning {
    /// One bootable ext4 root partition
    SingleRoot,

    /// A FAT32 boot partition followed by an ext4 root partition
    SeparateBoot { boot_size_bytes: u64 },
}

impl Default for Partitioning {
    fn default() -> Self {
        Partitioning::SingleRoot
    }
}

/// Policy when the assembled filesystem contains no kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelPolicy {
    /// Fail the conversion
    Require,

    /// Install the distribution's kernel package inside the target
    DistroPackages,

    /// Install a generic boot stage pointing at `/boot/vmlinuz`
    GenericStage,
}

impl Default for KernelPolicy {
    fn default() -> Self {
        KernelPolicy::GenericStage
    }
}

/// Registry client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Parallel layer downloads
    pub max_concurrent_downloads: usize,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Retry policy for transient failures
    pub retry: RetrySettings,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 4,
            request_timeout_secs: 60,
            retry: RetrySettings::default(),
            insecure_registries: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Download concurrency clamped to the supported window.
    pub fn download_concurrency(&self) -> usize {
        self.max_concurrent_downloads.clamp(1, 8)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure_registries.iter().any(|r| r == registry)
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Cap on any single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `retry` (1-based), doubling up to the cap.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let ms = self.initial_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}
