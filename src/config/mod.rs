//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or a
//! tunable does not parse. Sensitive values are wrapped in
//! `secrecy::SecretString` to keep them out of logs.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::claim::ClaimPolicy;
use crate::client::{
    CommandToken, CredentialChain, CredentialProvider, MetadataToken, QueueConfig, StaticToken,
};
use crate::dedup::{self, SimilarityClusterer};
use crate::error::{Error, Result};
use crate::net::{BreakerConfig, CallerConfig};
use crate::retry::RetryPolicy;

pub const DEFAULT_TOKEN_COMMAND: &str = "gcloud auth print-access-token";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Explicit bearer token; first link of the credential chain.
    pub api_token: Option<SecretString>,
    /// CLI that prints a token. `None` when set to an empty string.
    pub token_command: Option<String>,
    /// Managed-identity token endpoint. `None` when set to an empty string.
    pub metadata_token_url: Option<String>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,

    pub claim_limit: usize,
    pub max_attempts: u32,
    pub claim_stale: Duration,
    pub requests_per_minute: u32,
    pub max_concurrency: usize,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    /// Per HTTP request.
    pub call_timeout: Duration,
    /// Whole guarded call, queue wait and retries included.
    pub call_deadline: Duration,
    pub dedup_threshold: f64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(get);
        let config = Self {
            database_url: SecretString::from(vars.required("DATABASE_URL")?),
            api_token: vars
                .optional("HARVEST_API_TOKEN")
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
            token_command: vars
                .or_default("HARVEST_TOKEN_COMMAND", DEFAULT_TOKEN_COMMAND)
                .filter(|c| !c.trim().is_empty()),
            metadata_token_url: vars
                .or_default("HARVEST_METADATA_TOKEN_URL", MetadataToken::DEFAULT_URL)
                .filter(|u| !u.trim().is_empty()),
            otel_endpoint: vars.optional("OTEL_ENDPOINT"),
            log_level: vars
                .optional("LOG_LEVEL")
                .unwrap_or_else(|| "info".to_string()),

            claim_limit: vars.parse("HARVEST_CLAIM_LIMIT", 5)?,
            max_attempts: vars.parse("HARVEST_MAX_ATTEMPTS", 3)?,
            claim_stale: Duration::from_secs(vars.parse("HARVEST_CLAIM_STALE_SECS", 900)?),
            requests_per_minute: vars.parse("HARVEST_REQUESTS_PER_MINUTE", 60)?,
            max_concurrency: vars.parse("HARVEST_MAX_CONCURRENCY", 2)?,
            breaker_threshold: vars.parse("HARVEST_BREAKER_THRESHOLD", 3)?,
            breaker_cooldown: Duration::from_secs(
                vars.parse("HARVEST_BREAKER_COOLDOWN_SECS", 60)?,
            ),
            call_timeout: Duration::from_secs(vars.parse("HARVEST_CALL_TIMEOUT_SECS", 30)?),
            call_deadline: Duration::from_secs(vars.parse("HARVEST_CALL_DEADLINE_SECS", 300)?),
            dedup_threshold: vars.parse("HARVEST_DEDUP_THRESHOLD", dedup::DEFAULT_THRESHOLD)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("HARVEST_MAX_ATTEMPTS must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config(
                "HARVEST_MAX_CONCURRENCY must be at least 1".into(),
            ));
        }
        if self.breaker_threshold == 0 {
            return Err(Error::Config(
                "HARVEST_BREAKER_THRESHOLD must be at least 1".into(),
            ));
        }
        check_dedup_threshold(self.dedup_threshold)
    }

    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            max_attempts: self.max_attempts,
            stale_after: self.claim_stale,
        }
    }

    /// Queue settings for one endpoint family. Retries happen here.
    pub fn queue_config(&self, name: impl Into<String>) -> QueueConfig {
        QueueConfig {
            name: name.into(),
            max_concurrency: self.max_concurrency,
            requests_per_minute: self.requests_per_minute,
            retry: RetryPolicy::default(),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_threshold,
            cooldown: self.breaker_cooldown,
        }
    }

    /// Caller settings for calls that dispatch through a queue: the queue
    /// already retries, so the caller makes a single attempt bounded by the
    /// overall deadline.
    pub fn caller_config(&self) -> CallerConfig {
        CallerConfig {
            timeout: self.call_deadline,
            retry: RetryPolicy::once(),
        }
    }

    /// Explicit token, then token command, then metadata server.
    pub fn credential_chain(&self, client: reqwest::Client) -> CredentialChain {
        let mut providers: Vec<Box<dyn CredentialProvider>> = Vec::new();
        if let Some(token) = &self.api_token {
            providers.push(Box::new(StaticToken::new(SecretString::from(
                token.expose_secret().to_string(),
            ))));
        }
        if let Some(command) = self
            .token_command
            .as_deref()
            .and_then(CommandToken::from_command_line)
        {
            providers.push(Box::new(command));
        }
        if let Some(url) = &self.metadata_token_url {
            providers.push(Box::new(MetadataToken::new(url.clone(), client)));
        }
        CredentialChain::new(providers)
    }
}

/// Dedup settings alone, for commands that never touch the database.
///
/// An explicit `threshold` wins over `HARVEST_DEDUP_THRESHOLD`.
pub fn clusterer_from_env(threshold: Option<f64>) -> Result<SimilarityClusterer> {
    clusterer_from_lookup(threshold, |name| std::env::var(name).ok())
}

pub fn clusterer_from_lookup<F>(threshold: Option<f64>, get: F) -> Result<SimilarityClusterer>
where
    F: Fn(&str) -> Option<String>,
{
    let threshold = match threshold {
        Some(t) => t,
        None => Vars(get).parse("HARVEST_DEDUP_THRESHOLD", dedup::DEFAULT_THRESHOLD)?,
    };
    check_dedup_threshold(threshold)?;
    Ok(SimilarityClusterer::new(threshold))
}

fn check_dedup_threshold(threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::Config(format!(
            "HARVEST_DEDUP_THRESHOLD must be within [0, 1], got {threshold}"
        )));
    }
    Ok(())
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
    }

    fn required(&self, name: &str) -> Result<String> {
        self.optional(name)
            .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
    }

    /// Unset means `default`; set-but-empty is passed through.
    fn or_default(&self, name: &str, default: &str) -> Option<String> {
        Some(self.optional(name).unwrap_or_else(|| default.to_string()))
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{name}: invalid value {raw:?}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(config.claim_limit, 5);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.claim_stale, Duration::from_secs(900));
        assert_eq!(config.requests_per_minute, 60);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.breaker_threshold, 3);
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.dedup_threshold, 0.6);
        assert_eq!(config.token_command.as_deref(), Some(DEFAULT_TOKEN_COMMAND));
        assert!(config.api_token.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn malformed_tunable_is_a_config_error() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("HARVEST_MAX_ATTEMPTS", "three"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("HARVEST_MAX_ATTEMPTS")));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("HARVEST_DEDUP_THRESHOLD", "1.5"),
        ]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn clusterer_needs_no_database_url() {
        let from_env = clusterer_from_lookup(None, lookup(&[("HARVEST_DEDUP_THRESHOLD", "0.8")]));
        assert_eq!(from_env.unwrap().threshold, 0.8);

        let flag_wins =
            clusterer_from_lookup(Some(0.4), lookup(&[("HARVEST_DEDUP_THRESHOLD", "0.8")]));
        assert_eq!(flag_wins.unwrap().threshold, 0.4);

        assert_eq!(
            clusterer_from_lookup(None, lookup(&[])).unwrap().threshold,
            dedup::DEFAULT_THRESHOLD
        );
        assert!(matches!(
            clusterer_from_lookup(Some(1.5), lookup(&[])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            clusterer_from_lookup(None, lookup(&[("HARVEST_DEDUP_THRESHOLD", "high")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn empty_values_disable_credential_links() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("HARVEST_API_TOKEN", "tok"),
            ("HARVEST_TOKEN_COMMAND", ""),
            ("HARVEST_METADATA_TOKEN_URL", ""),
        ]))
        .unwrap();
        assert!(config.token_command.is_none());
        assert!(config.metadata_token_url.is_none());

        let chain = config.credential_chain(reqwest::Client::new());
        assert!(!chain.is_empty());
    }

    #[test]
    fn component_configs_follow_tunables() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("HARVEST_REQUESTS_PER_MINUTE", "120"),
            ("HARVEST_BREAKER_COOLDOWN_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(
            config.queue_config("imagen").min_interval(),
            Duration::from_millis(500)
        );
        assert_eq!(config.breaker_config().cooldown, Duration::from_secs(5));
        assert_eq!(config.caller_config().retry.max_attempts, 1);
        assert_eq!(config.claim_policy().max_attempts, 3);
    }
}
