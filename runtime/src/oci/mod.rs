//! OCI image support.
//!
//! Everything needed to turn an image reference into a root filesystem:
//!
//! - Reference and platform parsing
//! - Registry protocol (challenges, manifest kinds, index resolution)
//! - Verified blob download with retry
//! - Layer assembly with whiteout handling
//!
//! # Flow
//!
//! ```text
//!  ImageReference ──resolve──▶ Manifest ──fetch_layer*──▶ verified blobs
//!                                                              │
//!                                            LayerAssembler ◀──┘
//!                                                  │
//!                                                  ▼
//!                                            AssembledRoot
//! ```

pub mod auth;
pub mod credentials;
pub mod digest;
pub mod layers;
pub mod manifest;
pub mod platform;
pub mod reference;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

pub use credentials::{CredentialStore, StoredCredential};
pub use digest::Digest;
pub use layers::{AssembledRoot, EntryKind, LayerAssembler, TreeEntry};
pub use manifest::{LayerDescriptor, Manifest, SchemaKind};
pub use platform::Platform;
pub use reference::ImageReference;
pub use registry::{ImageInfo, LayerBlob, RegistryAuth, RegistryClient};
pub use transport::{RegistryTransport, ReqwestTransport, TransportRequest, TransportResponse};
