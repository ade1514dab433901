//! OCI distribution client.
//!
//! Resolves an image reference to one platform-specific manifest and
//! downloads its layer blobs, checking every byte against the descriptor
//! digest while it streams.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dockboot_core::config::RegistryConfig;
use dockboot_core::error::{ConvertError, Result};
use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::auth::{pull_scope, Challenge, TokenCache, TokenResponse};
use super::credentials::CredentialStore;
use super::digest::Digest;
use super::manifest::{
    accept_header, parse_manifest, IndexEntry, LayerDescriptor, Manifest, ManifestDocument,
    SchemaKind,
};
use super::platform::Platform;
use super::reference::ImageReference;
use super::transport::{
    RegistryTransport, ReqwestTransport, TransportRequest, TransportResponse, MAX_DOCUMENT_BYTES,
};
use crate::retry::{retry_with_backoff, RetryConfig};

/// Nested index levels followed before giving up.
const MAX_INDEX_DEPTH: usize = 2;

/// Authentication credentials for a container registry.
#[derive(Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            token: None,
        }
    }

    /// Use a pre-issued registry bearer token.
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Credential store first, then env vars, then anonymous.
    pub fn from_credential_store(registry: &str) -> Self {
        if let Ok(store) = CredentialStore::default_path() {
            match store.get(registry) {
                Ok(Some(cred)) => return Self::basic(cred.username, cred.password),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Ignoring unreadable credential store"),
            }
        }
        Self::from_env()
    }

    pub fn is_anonymous(&self) -> bool {
        self.basic_pair().is_none() && self.token.is_none()
    }

    fn basic_pair(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A downloaded, verified layer.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub descriptor: LayerDescriptor,
    pub data: Bytes,
}

/// Summary of a resolved image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub reference: String,
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: String,
    pub schema: SchemaKind,
    pub platform: String,
    pub layer_count: usize,
    pub compressed_size: u64,
}

/// Registry client for pulls.
pub struct RegistryClient {
    transport: Arc<dyn RegistryTransport>,
    auth: RegistryAuth,
    tokens: TokenCache,
    retry: RetryConfig,
    read_timeout: Duration,
    insecure_registries: Vec<String>,
}

impl RegistryClient {
    /// Create a client that talks HTTP through reqwest.
    pub fn new(config: &RegistryConfig, auth: RegistryAuth) -> Result<Self> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Ok(Self::with_transport(Arc::new(transport), config, auth))
    }

    pub fn with_transport(
        transport: Arc<dyn RegistryTransport>,
        config: &RegistryConfig,
        auth: RegistryAuth,
    ) -> Self {
        Self {
            transport,
            auth,
            tokens: TokenCache::new(),
            retry: RetryConfig::from(&config.retry),
            read_timeout: config.request_timeout(),
            insecure_registries: config.insecure_registries.clone(),
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve `reference` to the manifest for `platform`.
    ///
    /// Indexes are followed to exactly one child; attestation entries are
    /// ignored.
    pub async fn resolve(&self, reference: &ImageReference, platform: &Platform) -> Result<Manifest> {
        tracing::info!(reference = %reference, platform = %platform, "Resolving image manifest");

        let mut doc = self
            .fetch_manifest(reference, &reference.manifest_reference(), reference.digest.as_ref())
            .await?;

        for _ in 0..=MAX_INDEX_DEPTH {
            match doc {
                ManifestDocument::Image(manifest) => {
                    tracing::info!(
                        reference = %reference,
                        digest = %manifest.digest,
                        schema = manifest.schema.as_str(),
                        layers = manifest.layers.len(),
                        "Resolved manifest"
                    );
                    return Ok(manifest);
                }
                ManifestDocument::Index { entries, .. } => {
                    let entry = select_entry(&entries, platform, reference)?;
                    tracing::debug!(digest = %entry.digest, "Following index entry");
                    doc = self
                        .fetch_manifest(reference, &entry.digest.to_string(), Some(&entry.digest))
                        .await?;
                }
            }
        }

        Err(ConvertError::Protocol(format!(
            "Index nesting for {} exceeds {} levels",
            reference, MAX_INDEX_DEPTH
        )))
    }

    /// Resolve and summarize an image without downloading layers.
    pub async fn inspect(&self, reference: &ImageReference, platform: &Platform) -> Result<ImageInfo> {
        let manifest = self.resolve(reference, platform).await?;
        Ok(ImageInfo {
            reference: reference.to_string(),
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            tag: reference.tag.clone(),
            digest: manifest.digest.to_string(),
            schema: manifest.schema,
            platform: platform.to_string(),
            layer_count: manifest.layers.len(),
            compressed_size: manifest.total_size(),
        })
    }

    /// Download one layer into memory.
    pub async fn fetch_layer(
        &self,
        reference: &ImageReference,
        descriptor: &LayerDescriptor,
    ) -> Result<LayerBlob> {
        let data: Vec<u8> = self
            .fetch_layer_to(reference, descriptor, || async { Ok(Vec::new()) })
            .await?;
        Ok(LayerBlob {
            descriptor: descriptor.clone(),
            data: Bytes::from(data),
        })
    }

    /// Stream one layer into a writer produced by `open`.
    ///
    /// `open` runs once per attempt so a retry never appends to a half-written
    /// sink. The returned writer has received exactly the verified blob.
    pub async fn fetch_layer_to<W, F, Fut>(
        &self,
        reference: &ImageReference,
        descriptor: &LayerDescriptor,
        mut open: F,
    ) -> Result<W>
    where
        W: AsyncWrite + Unpin,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::io::Result<W>>,
    {
        let operation = format!("fetch layer {}", descriptor.digest.short());
        retry_with_backoff(&self.retry, &operation, move || {
            let writer = open();
            async move {
                let writer = writer
                    .await
                    .map_err(|e| ConvertError::io("opening layer sink", e))?;
                self.download_blob(reference, descriptor, writer).await
            }
        })
        .await
    }

    async fn download_blob<W: AsyncWrite + Unpin>(
        &self,
        reference: &ImageReference,
        descriptor: &LayerDescriptor,
        mut writer: W,
    ) -> Result<W> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(reference),
            reference.repository,
            descriptor.digest
        );
        let mut response = self.send(reference, &url, None).await?;
        let mut verifier = descriptor.digest.verifier();

        loop {
            let chunk = tokio::time::timeout(self.read_timeout, response.body.next())
                .await
                .map_err(|_| {
                    ConvertError::TransientNetwork(format!(
                        "Blob {} stalled for {:?}",
                        descriptor.digest, self.read_timeout
                    ))
                })?;
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            verifier.update(&chunk);
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| ConvertError::io("writing layer blob", e))?;
        }

        if descriptor.size > 0 && verifier.len() < descriptor.size {
            return Err(ConvertError::TransientNetwork(format!(
                "Blob {} truncated at {} of {} bytes",
                descriptor.digest,
                verifier.len(),
                descriptor.size
            )));
        }
        verifier.finish()?;
        writer
            .flush()
            .await
            .map_err(|e| ConvertError::io("flushing layer blob", e))?;

        tracing::debug!(digest = %descriptor.digest, "Layer verified");
        Ok(writer)
    }

    /// Fetch and decode one manifest document, checking `expected` when pinned.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        manifest_ref: &str,
        expected: Option<&Digest>,
    ) -> Result<ManifestDocument> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference),
            reference.repository,
            manifest_ref
        );
        let accept = accept_header();
        let (url_ref, accept_ref) = (url.as_str(), accept.as_str());

        let (body, content_type) =
            retry_with_backoff(&self.retry, "fetch manifest", move || async move {
                let response = self.send(reference, url_ref, Some(accept_ref)).await?;
                let content_type = response.header("content-type").map(str::to_string);
                let body = response.bytes(MAX_DOCUMENT_BYTES).await?;
                Ok((body, content_type))
            })
            .await?;

        let digest = Digest::of(&body);
        if let Some(expected) = expected {
            if &digest != expected {
                return Err(ConvertError::IntegrityError {
                    digest: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }
        parse_manifest(&body, content_type.as_deref(), digest)
    }

    /// GET with challenge handling. Non-success statuses become typed errors.
    async fn send(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
    ) -> Result<TransportResponse> {
        let scope = pull_scope(&reference.repository);
        let cache_key = format!("{}|{}", reference.api_host(), scope);
        let build = |auth: &Authorization| {
            let mut request = TransportRequest::get(url);
            if let Some(accept) = accept {
                request = request.header("Accept", accept);
            }
            match auth {
                Authorization::None => request,
                Authorization::Bearer(token) => request.bearer(token),
                Authorization::Basic(user, pass) => request.basic(user, pass),
            }
        };

        let initial = if let Some(token) = &self.auth.token {
            Authorization::Bearer(token.clone())
        } else if let Some(token) = self.tokens.get(&cache_key) {
            Authorization::Bearer(token)
        } else {
            Authorization::None
        };
        let authenticated = !matches!(initial, Authorization::None);

        let response = self.transport.get(build(&initial)).await?;
        if response.status != 401 || self.auth.token.is_some() {
            return check_status(response, reference, url);
        }

        // Unauthorized: answer the challenge once.
        if authenticated {
            self.tokens.invalidate(&cache_key);
        }
        let challenge = response
            .header("www-authenticate")
            .map(Challenge::parse)
            .transpose()?
            .ok_or_else(|| ConvertError::AuthFailure {
                registry: reference.registry.clone(),
                message: "401 without WWW-Authenticate challenge".to_string(),
            })?;

        let retry_auth = match challenge {
            Challenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                let scope = challenge_scope.unwrap_or(scope);
                let token = self
                    .fetch_token(reference, &realm, service.as_deref(), &scope)
                    .await?;
                self.tokens.insert(&cache_key, token.0.clone(), token.1);
                Authorization::Bearer(token.0)
            }
            Challenge::Basic => match self.auth.basic_pair() {
                Some((user, pass)) => Authorization::Basic(user.to_string(), pass.to_string()),
                None => {
                    return Err(ConvertError::AuthFailure {
                        registry: reference.registry.clone(),
                        message: "registry requires credentials".to_string(),
                    })
                }
            },
        };

        let response = self.transport.get(build(&retry_auth)).await?;
        check_status(response, reference, url)
    }

    async fn fetch_token(
        &self,
        reference: &ImageReference,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<(String, Option<Duration>)> {
        let mut params = vec![("scope", scope)];
        if let Some(service) = service {
            params.push(("service", service));
        }
        let url = reqwest::Url::parse_with_params(realm, &params)
            .map_err(|e| ConvertError::Protocol(format!("Invalid token realm '{}': {}", realm, e)))?;

        let mut request = TransportRequest::get(url.as_str());
        if let Some((user, pass)) = self.auth.basic_pair() {
            request = request.basic(user, pass);
        }

        tracing::debug!(registry = %reference.registry, scope = %scope, "Requesting bearer token");
        let response = self.transport.get(request).await?;
        match response.status {
            200..=299 => {}
            401 | 403 => {
                return Err(ConvertError::AuthFailure {
                    registry: reference.registry.clone(),
                    message: format!("token endpoint returned {}", response.status),
                })
            }
            status => return Err(status_error(status, &format!("token endpoint {}", realm))),
        }
        let body = response.bytes(MAX_DOCUMENT_BYTES).await?;
        let token: TokenResponse = serde_json::from_slice(&body)?;
        token.into_token()
    }

    fn base_url(&self, reference: &ImageReference) -> String {
        let scheme = if self.insecure_registries.iter().any(|r| r == &reference.registry) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, reference.api_host())
    }
}

enum Authorization {
    None,
    Bearer(String),
    Basic(String, String),
}

fn check_status(
    response: TransportResponse,
    reference: &ImageReference,
    url: &str,
) -> Result<TransportResponse> {
    match response.status {
        200..=299 => Ok(response),
        404 => Err(ConvertError::NotFound(format!("{} ({})", reference, url))),
        401 | 403 => Err(ConvertError::AuthFailure {
            registry: reference.registry.clone(),
            message: format!("access to {} denied ({})", reference.repository, response.status),
        }),
        status => Err(status_error(status, url)),
    }
}

fn status_error(status: u16, what: &str) -> ConvertError {
    match status {
        408 | 429 | 500..=599 => {
            ConvertError::TransientNetwork(format!("{} returned {}", what, status))
        }
        _ => ConvertError::Protocol(format!("{} returned unexpected status {}", what, status)),
    }
}

/// Pick the single index entry for `platform`.
fn select_entry<'a>(
    entries: &'a [IndexEntry],
    platform: &Platform,
    reference: &ImageReference,
) -> Result<&'a IndexEntry> {
    let mut matches: Vec<&IndexEntry> = entries
        .iter()
        .filter(|e| match &e.platform {
            Some(p) => !p.is_attestation() && platform.matches(p),
            // Unlabelled children of an index can only be nested indexes.
            None => e
                .media_type
                .as_deref()
                .map(|m| m.contains("index") || m.contains("list"))
                .unwrap_or(false),
        })
        .collect();
    let mut seen = HashSet::new();
    matches.retain(|e| seen.insert(e.digest.clone()));

    if matches.len() > 1 {
        // Prefer the entry that does not pin a variant.
        let unpinned: Vec<&IndexEntry> = matches
            .iter()
            .copied()
            .filter(|e| e.platform.as_ref().map(|p| p.variant.is_none()).unwrap_or(false))
            .collect();
        if unpinned.len() == 1 {
            matches = unpinned;
        }
    }

    match matches.as_slice() {
        [one] => Ok(*one),
        [] => Err(ConvertError::NotFound(format!(
            "{} has no manifest for platform {}",
            reference, platform
        ))),
        many => Err(ConvertError::Protocol(format!(
            "{} has {} manifests matching platform {}; specify a variant",
            reference,
            many.len(),
            platform
        ))),
    }
}
