//! Registry authentication challenges and bearer token caching.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dockboot_core::error::{ConvertError, Result};
use parking_lot::Mutex;
use serde::Deserialize;

/// Tokens without `expires_in` are assumed to live this long.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl Challenge {
    /// Parse a challenge like
    /// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io"`.
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        let params = parse_params(rest);

        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => {
                let realm = params.get("realm").cloned().ok_or_else(|| {
                    ConvertError::Protocol(format!("Bearer challenge without realm: {}", header))
                })?;
                Ok(Challenge::Bearer {
                    realm,
                    service: params.get("service").cloned(),
                    scope: params.get("scope").cloned(),
                })
            }
            "basic" => Ok(Challenge::Basic),
            other => Err(ConvertError::Protocol(format!(
                "Unsupported authentication scheme '{}'",
                other
            ))),
        }
    }
}

/// Split `k="v",k2=v2` honoring quotes (scopes may contain commas).
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next().is_none() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    params
}

/// Token endpoint response; registries use either field name.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenResponse {
    pub fn into_token(self) -> Result<(String, Option<Duration>)> {
        let ttl = self.expires_in.map(Duration::from_secs);
        self.token
            .or(self.access_token)
            .filter(|t| !t.is_empty())
            .map(|t| (t, ttl))
            .ok_or_else(|| ConvertError::Protocol("Token response carries no token".to_string()))
    }
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Bearer tokens keyed by `(registry, scope)`.
#[derive(Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut tokens = self.tokens.lock();
        match tokens.get(key) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.token.clone()),
            Some(_) => {
                tokens.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, token: String, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(DEFAULT_TOKEN_TTL);
        self.tokens.lock().insert(
            key.to_string(),
            CachedToken {
                token,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.tokens.lock().remove(key);
    }
}

/// Pull scope for a repository.
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}
