//! HTTP transport seam for the registry client.
//!
//! The registry client talks HTTP only through [`RegistryTransport`], so the
//! protocol logic (challenges, index resolution, digest checks, retries) runs
//! unchanged against the scripted transport used in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use dockboot_core::error::{ConvertError, Result};
use futures::stream::{BoxStream, StreamExt};

use crate::retry::classify_http_error;

/// Largest JSON document (manifest, token) accepted into memory.
pub const MAX_DOCUMENT_BYTES: usize = 8 * 1024 * 1024;

/// One GET request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl TransportRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    pub fn basic(self, username: &str, password: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        self.header("Authorization", format!("Basic {}", encoded))
    }

    /// Value of a header set on this request.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response with a streaming body.
pub struct TransportResponse {
    pub status: u16,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Collect the body, refusing anything above `limit` bytes.
    pub async fn bytes(mut self, limit: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk?;
            if out.len() + chunk.len() > limit {
                return Err(ConvertError::Protocol(format!(
                    "Response body exceeds {} bytes",
                    limit
                )));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Issues HTTP requests on behalf of the registry client.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn get(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// Transport backed by reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    /// `timeout` bounds connecting and waiting for response headers.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dockboot/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ConvertError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl RegistryTransport for ReqwestTransport {
    async fn get(&self, request: TransportRequest) -> Result<TransportResponse> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| {
                ConvertError::TransientNetwork(format!(
                    "GET {} timed out after {:?}",
                    request.url, self.timeout
                ))
            })?
            .map_err(|e| classify_http_error(&format!("GET {}", request.url), &e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let url = request.url.clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| classify_http_error(&format!("reading {}", url), &e)))
            .boxed();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
