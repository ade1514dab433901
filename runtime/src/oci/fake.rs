//! Scripted in-memory registry for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use dockboot_core::error::Result;
use futures::StreamExt;
use parking_lot::Mutex;

use super::digest::Digest;
use super::manifest::LayerDescriptor;
use super::transport::{RegistryTransport, TransportRequest, TransportResponse};

const LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

#[derive(Default)]
struct State {
    /// Path → (content type, body)
    documents: HashMap<String, (String, Vec<u8>)>,
    /// Path → (remaining failures, status)
    failures: HashMap<String, (u32, u16)>,
    requests: HashMap<String, u32>,
    token_requests: u32,
}

/// Registry that serves whatever the test put into it.
pub struct FakeRegistry {
    host: String,
    token: Option<String>,
    credentials: Option<(String, String)>,
    state: Mutex<State>,
}

impl FakeRegistry {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            token: None,
            credentials: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Require `Authorization: Bearer <token>` on every registry call.
    pub fn with_bearer_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Token endpoint only issues tokens for these credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn put_manifest(&self, repo: &str, reference: &str, media_type: &str, body: &[u8]) {
        self.state.lock().documents.insert(
            format!("/v2/{}/manifests/{}", repo, reference),
            (media_type.to_string(), body.to_vec()),
        );
    }

    /// Store a manifest under its own digest and return the digest.
    pub fn put_manifest_by_digest(&self, repo: &str, media_type: &str, body: &[u8]) -> Digest {
        let digest = Digest::of(body);
        self.put_manifest(repo, &digest.to_string(), media_type, body);
        digest
    }

    pub fn put_blob(&self, repo: &str, data: &[u8]) -> LayerDescriptor {
        let digest = Digest::of(data);
        self.state.lock().documents.insert(
            blob_path(repo, &digest),
            ("application/octet-stream".to_string(), data.to_vec()),
        );
        LayerDescriptor {
            digest,
            size: data.len() as u64,
            media_type: LAYER_GZIP.to_string(),
        }
    }

    /// Flip one byte of a stored blob.
    pub fn corrupt_blob(&self, repo: &str, digest: &Digest) {
        if let Some((_, body)) = self.state.lock().documents.get_mut(&blob_path(repo, digest)) {
            if let Some(byte) = body.last_mut() {
                *byte ^= 0x01;
            }
        }
    }

    /// Answer the next `times` requests for a blob with `status`.
    pub fn fail_blob(&self, repo: &str, digest: &Digest, times: u32, status: u16) {
        self.state
            .lock()
            .failures
            .insert(blob_path(repo, digest), (times, status));
    }

    pub fn blob_requests(&self, digest: &Digest) -> u32 {
        let state = self.state.lock();
        state
            .requests
            .iter()
            .filter(|(path, _)| path.ends_with(&format!("/blobs/{}", digest)))
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn token_requests(&self) -> u32 {
        self.state.lock().token_requests
    }

    fn respond(&self, status: u16, headers: Vec<(&str, String)>, body: Vec<u8>) -> TransportResponse {
        // Two chunks so readers exercise their streaming path.
        let split = body.len() / 2;
        let second = body[split..].to_vec();
        let mut first = body;
        first.truncate(split);
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from(first)), Ok(Bytes::from(second))];
        TransportResponse {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            body: futures::stream::iter(chunks).boxed(),
        }
    }

    fn challenge(&self) -> TransportResponse {
        self.respond(
            401,
            vec![(
                "WWW-Authenticate",
                format!(
                    r#"Bearer realm="https://{}/token",service="{}""#,
                    self.host, self.host
                ),
            )],
            Vec::new(),
        )
    }

    fn issue_token(&self, request: &TransportRequest) -> TransportResponse {
        self.state.lock().token_requests += 1;
        if let Some((user, pass)) = &self.credentials {
            let expected = format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass))
            );
            if request.header_value("authorization") != Some(expected.as_str()) {
                return self.respond(401, Vec::new(), Vec::new());
            }
        }
        let token = self.token.clone().unwrap_or_default();
        let body = serde_json::to_vec(&serde_json::json!({ "token": token, "expires_in": 300 }))
            .unwrap_or_default();
        self.respond(200, vec![("Content-Type", "application/json".to_string())], body)
    }
}

#[async_trait]
impl RegistryTransport for FakeRegistry {
    async fn get(&self, request: TransportRequest) -> Result<TransportResponse> {
        let prefix = format!("https://{}", self.host);
        let path = request
            .url
            .strip_prefix(&prefix)
            .unwrap_or(&request.url)
            .to_string();

        if path.starts_with("/token") {
            return Ok(self.issue_token(&request));
        }

        if let Some(token) = &self.token {
            let expected = format!("Bearer {}", token);
            if request.header_value("authorization") != Some(expected.as_str()) {
                return Ok(self.challenge());
            }
        }

        let (injected, document) = {
            let mut state = self.state.lock();
            *state.requests.entry(path.clone()).or_default() += 1;
            let injected = match state.failures.get_mut(&path) {
                Some((remaining, status)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*status)
                }
                _ => None,
            };
            (injected, state.documents.get(&path).cloned())
        };

        if let Some(status) = injected {
            return Ok(self.respond(status, Vec::new(), Vec::new()));
        }
        match document {
            Some((content_type, body)) => {
                Ok(self.respond(200, vec![("Content-Type", content_type)], body))
            }
            None => Ok(self.respond(404, Vec::new(), Vec::new())),
        }
    }
}

fn blob_path(repo: &str, digest: &Digest) -> String {
    format!("/v2/{}/blobs/{}", repo, digest)
}
