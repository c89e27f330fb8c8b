//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Business rules and sync tuning may be overridden from a TOML policy file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::policy::PolicyConfig;
use crate::queue::SyncConfig;

pub const DEFAULT_QUEUE_PATH: &str = "visitq.db";

#[derive(Debug)]
pub struct Config {
    /// Base URL of the remote store's REST interface.
    pub remote_url: String,
    pub remote_key: SecretString,
    /// Push endpoint. Notifications are only logged when unset.
    pub notify_url: Option<String>,
    pub queue_path: PathBuf,
    pub policy: PolicyConfig,
    pub sync: SyncConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::Config(format!("required environment variable {name} is not set"))
                })
        };

        let (policy, sync) = match lookup("VISITQ_POLICY_FILE") {
            Some(path) => load_policy_file(path)?,
            None => (PolicyConfig::default(), SyncConfig::default()),
        };

        Ok(Self {
            remote_url: required("VISITQ_REMOTE_URL")?,
            remote_key: SecretString::from(required("VISITQ_REMOTE_KEY")?),
            notify_url: lookup("VISITQ_NOTIFY_URL"),
            queue_path: lookup("VISITQ_QUEUE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_QUEUE_PATH)),
            policy,
            sync,
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// On-disk policy overrides. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PolicyFile {
    policy: PolicyConfig,
    sync: SyncOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SyncOverrides {
    max_attempts: Option<u32>,
    backoff_base_secs: Option<u64>,
    backoff_max_exponent: Option<u32>,
    remote_timeout_secs: Option<u64>,
    parallelism: Option<usize>,
    poll_interval_secs: Option<u64>,
}

impl SyncOverrides {
    fn apply(self, mut sync: SyncConfig) -> SyncConfig {
        if let Some(v) = self.max_attempts {
            sync.max_attempts = v;
        }
        if let Some(v) = self.backoff_base_secs {
            sync.backoff_base = Duration::from_secs(v);
        }
        if let Some(v) = self.backoff_max_exponent {
            sync.backoff_max_exponent = v;
        }
        if let Some(v) = self.remote_timeout_secs {
            sync.remote_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.parallelism {
            sync.parallelism = v;
        }
        if let Some(v) = self.poll_interval_secs {
            sync.poll_interval = Duration::from_secs(v);
        }
        sync
    }
}

/// Read a TOML policy file.
pub fn load_policy_file(path: impl AsRef<Path>) -> Result<(PolicyConfig, SyncConfig)> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read policy file {}: {e}", path.display())))?;
    parse_policy(&text)
}

/// Parse policy overrides from TOML text.
pub fn parse_policy(text: &str) -> Result<(PolicyConfig, SyncConfig)> {
    let file: PolicyFile =
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid policy file: {e}")))?;
    let policy = file.policy;
    let sync = file.sync.apply(SyncConfig::default());

    if policy.late_cancellation_minutes < 0 {
        return Err(Error::Config(
            "late_cancellation_minutes must not be negative".into(),
        ));
    }
    if !(policy.geofence_radius_m.is_finite() && policy.geofence_radius_m > 0.0) {
        return Err(Error::Config("geofence_radius_m must be positive".into()));
    }
    if sync.max_attempts == 0 {
        return Err(Error::Config("max_attempts must be at least 1".into()));
    }
    if sync.parallelism == 0 {
        return Err(Error::Config("parallelism must be at least 1".into()));
    }
    if sync.poll_interval.is_zero() {
        return Err(Error::Config("poll_interval_secs must be at least 1".into()));
    }

    Ok((policy, sync))
}
