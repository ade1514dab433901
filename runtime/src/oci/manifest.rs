//! Manifest and manifest-index documents.
//!
//! Registries answer a manifest request with one of five shapes. They are
//! decoded into either a concrete [`Manifest`] (ordered layer list) or a
//! platform index that still has to be resolved to one child.

use dockboot_core::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};

use super::digest::Digest;
use super::platform::Platform;

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Media type assumed for legacy schema 1 layers.
const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// `Accept` header sent with every manifest request.
pub fn accept_header() -> String {
    [
        OCI_INDEX,
        OCI_MANIFEST,
        DOCKER_MANIFEST_LIST,
        DOCKER_MANIFEST_V2,
        DOCKER_MANIFEST_V1_SIGNED,
        DOCKER_MANIFEST_V1,
    ]
    .join(", ")
}

/// Which of the registry document shapes a manifest was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    OciManifest,
    OciIndex,
    DockerV2,
    DockerList,
    DockerV1,
}

impl SchemaKind {
    fn from_media_type(media_type: &str) -> Option<Self> {
        // Content-Type may carry parameters
        let media_type = media_type.split(';').next().unwrap_or("").trim();
        match media_type {
            OCI_MANIFEST => Some(SchemaKind::OciManifest),
            OCI_INDEX => Some(SchemaKind::OciIndex),
            DOCKER_MANIFEST_V2 => Some(SchemaKind::DockerV2),
            DOCKER_MANIFEST_LIST => Some(SchemaKind::DockerList),
            DOCKER_MANIFEST_V1 | DOCKER_MANIFEST_V1_SIGNED => Some(SchemaKind::DockerV1),
            _ => None,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, SchemaKind::OciIndex | SchemaKind::DockerList)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::OciManifest => "oci-manifest",
            SchemaKind::OciIndex => "oci-index",
            SchemaKind::DockerV2 => "docker-v2",
            SchemaKind::DockerList => "docker-manifest-list",
            SchemaKind::DockerV1 => "docker-v1",
        }
    }
}

/// One content-addressed layer blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub digest: Digest,
    /// Compressed size; 0 when the registry did not say (schema 1).
    pub size: u64,
    pub media_type: String,
}

/// A platform-specific manifest with its layers bottom to top.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Digest of the manifest bytes as served.
    pub digest: Digest,
    pub schema: SchemaKind,
    pub config: Option<LayerDescriptor>,
    pub layers: Vec<LayerDescriptor>,
}

impl Manifest {
    /// Sum of advertised compressed layer sizes.
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Child manifest listed by an index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub digest: Digest,
    pub media_type: Option<String>,
    pub platform: Option<Platform>,
}

/// Decoded manifest response.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    Image(Manifest),
    Index {
        schema: SchemaKind,
        entries: Vec<IndexEntry>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    schema_version: Option<u32>,
    media_type: Option<String>,
    config: Option<RawDescriptor>,
    layers: Option<Vec<RawDescriptor>>,
    manifests: Option<Vec<RawDescriptor>>,
    fs_layers: Option<Vec<RawFsLayer>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    media_type: Option<String>,
    #[serde(default)]
    size: u64,
    digest: Digest,
    platform: Option<Platform>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFsLayer {
    blob_sum: Digest,
}

impl RawDescriptor {
    fn into_layer(self, default_media_type: &str) -> LayerDescriptor {
        LayerDescriptor {
            digest: self.digest,
            size: self.size,
            media_type: self
                .media_type
                .unwrap_or_else(|| default_media_type.to_string()),
        }
    }
}

/// Decode a manifest body.
///
/// The kind is taken from the body's `mediaType`, then the response
/// `Content-Type`, then the document's shape.
pub fn parse_manifest(
    body: &[u8],
    content_type: Option<&str>,
    digest: Digest,
) -> Result<ManifestDocument> {
    let raw: RawDocument = serde_json::from_slice(body)
        .map_err(|e| ConvertError::Protocol(format!("Malformed manifest {}: {}", digest, e)))?;

    let schema = raw
        .media_type
        .as_deref()
        .and_then(SchemaKind::from_media_type)
        .or_else(|| content_type.and_then(SchemaKind::from_media_type))
        .or_else(|| {
            if raw.manifests.is_some() {
                Some(SchemaKind::OciIndex)
            } else if raw.fs_layers.is_some() || raw.schema_version == Some(1) {
                Some(SchemaKind::DockerV1)
            } else if raw.layers.is_some() {
                Some(SchemaKind::OciManifest)
            } else {
                None
            }
        })
        .ok_or_else(|| {
            ConvertError::Protocol(format!("Unrecognized manifest document {}", digest))
        })?;

    match schema {
        SchemaKind::OciIndex | SchemaKind::DockerList => {
            let entries = raw
                .manifests
                .ok_or_else(|| {
                    ConvertError::Protocol(format!("Index {} has no manifests", digest))
                })?
                .into_iter()
                .map(|d| IndexEntry {
                    digest: d.digest,
                    media_type: d.media_type,
                    platform: d.platform,
                })
                .collect();
            Ok(ManifestDocument::Index { schema, entries })
        }
        SchemaKind::DockerV1 => {
            let fs_layers = raw.fs_layers.ok_or_else(|| {
                ConvertError::Protocol(format!("Schema 1 manifest {} has no fsLayers", digest))
            })?;
            // Schema 1 lists the top layer first.
            let layers = fs_layers
                .into_iter()
                .rev()
                .map(|l| LayerDescriptor {
                    digest: l.blob_sum,
                    size: 0,
                    media_type: DOCKER_LAYER_GZIP.to_string(),
                })
                .collect();
            non_empty(Manifest {
                digest,
                schema,
                config: None,
                layers,
            })
        }
        SchemaKind::OciManifest | SchemaKind::DockerV2 => {
            let default_layer_type = if schema == SchemaKind::DockerV2 {
                DOCKER_LAYER_GZIP
            } else {
                "application/vnd.oci.image.layer.v1.tar+gzip"
            };
            let layers = raw
                .layers
                .ok_or_else(|| {
                    ConvertError::Protocol(format!("Manifest {} has no layers field", digest))
                })?
                .into_iter()
                .map(|d| d.into_layer(default_layer_type))
                .collect();
            non_empty(Manifest {
                digest,
                schema,
                config: raw.config.map(|c| c.into_layer("application/octet-stream")),
                layers,
            })
        }
    }
}

fn non_empty(manifest: Manifest) -> Result<ManifestDocument> {
    if manifest.layers.is_empty() {
        return Err(ConvertError::Protocol(format!(
            "Manifest {} lists no layers",
            manifest.digest
        )));
    }
    Ok(ManifestDocument::Image(manifest))
}
