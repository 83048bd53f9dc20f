//! Credential acquisition with ordered fallback.
//!
//! Providers are tried in order: an explicitly configured token, then a
//! token printed by a local CLI, then the managed-identity metadata
//! endpoint. The first success wins and is cached for a while; the chain
//! only fails when every provider did.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Something that can produce a bearer token.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Short name for logs and error messages.
    fn name(&self) -> &str;

    async fn token(&self) -> Result<SecretString>;
}

/// A token handed over in configuration.
pub struct StaticToken {
    token: SecretString,
}

impl StaticToken {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    fn name(&self) -> &str {
        "static"
    }

    async fn token(&self) -> Result<SecretString> {
        let token = self.token.expose_secret();
        if token.trim().is_empty() {
            return Err(Error::Credentials("configured token is empty".to_string()));
        }
        Ok(SecretString::from(token.to_string()))
    }
}

/// A token printed on stdout by a local CLI, e.g.
/// `gcloud auth print-access-token`.
pub struct CommandToken {
    program: String,
    args: Vec<String>,
}

impl CommandToken {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl CredentialProvider for CommandToken {
    fn name(&self) -> &str {
        &self.program
    }

    async fn token(&self) -> Result<SecretString> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Credentials(format!(
                "{} exited with status {}",
                self.program,
                output.status.code().unwrap_or(-1)
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(Error::Credentials(format!(
                "{} printed no token",
                self.program
            )));
        }
        Ok(SecretString::from(token))
    }
}

#[derive(Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
}

/// Managed identity: the platform metadata server hands out tokens for the
/// service account the process runs as.
pub struct MetadataToken {
    url: String,
    client: reqwest::Client,
}

impl MetadataToken {
    pub const DEFAULT_URL: &'static str =
        "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl CredentialProvider for MetadataToken {
    fn name(&self) -> &str {
        "metadata"
    }

    async fn token(&self) -> Result<SecretString> {
        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Error::Credentials(format!("metadata server unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Credentials(format!(
                "metadata server returned {}",
                response.status()
            )));
        }

        let body: MetadataTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Credentials(format!("bad metadata token response: {e}")))?;
        Ok(SecretString::from(body.access_token))
    }
}

struct CachedToken {
    token: Arc<SecretString>,
    fetched_at: Instant,
}

/// Ordered list of providers with a shared token cache.
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
    ttl: Duration,
    cache: Mutex<Option<CachedToken>>,
}

impl CredentialChain {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(50 * 60);

    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self {
            providers,
            ttl: Self::DEFAULT_TTL,
            cache: Mutex::new(None),
        }
    }

    /// How long a winning token is reused before the chain is walked again.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Return a token, walking the chain on a cache miss.
    pub async fn token(&self) -> Result<Arc<SecretString>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < self.ttl
        {
            return Ok(Arc::clone(&cached.token));
        }

        let mut failures = Vec::new();
        for provider in &self.providers {
            match provider.token().await {
                Ok(token) => {
                    debug!(provider = provider.name(), "credential acquired");
                    let token = Arc::new(token);
                    *cache = Some(CachedToken {
                        token: Arc::clone(&token),
                        fetched_at: Instant::now(),
                    });
                    return Ok(token);
                }
                Err(e) => {
                    debug!(provider = provider.name(), error = %e, "credential provider failed");
                    failures.push(format!("{}: {e}", provider.name()));
                }
            }
        }

        warn!(tried = self.providers.len(), "no credential provider succeeded");
        if failures.is_empty() {
            failures.push("no providers configured".to_string());
        }
        Err(Error::Credentials(failures.join("; ")))
    }

    /// Drop the cached token, e.g. after the upstream rejected it.
    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }
}
