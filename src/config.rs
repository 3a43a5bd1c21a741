//! Configuration for bundling and transfers
//!
//! Settings come from an optional YAML or JSON file, then environment
//! variables, then command line flags, each layer overriding the previous.

use crate::bundle::ArchiveFormat;
use crate::error::{RelocatorError, Result};
use crate::registry::copy::{CopyOptions, TrustPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const ENV_USERNAME: &str = "IMAGE_RELOCATOR_USERNAME";
pub const ENV_PASSWORD: &str = "IMAGE_RELOCATOR_PASSWORD";
pub const ENV_CONCURRENCY: &str = "IMAGE_RELOCATOR_CONCURRENCY";
pub const ENV_SKIP_TLS: &str = "IMAGE_RELOCATOR_SKIP_TLS";

/// Registry credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl AuthConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(RelocatorError::Configuration(
                "Username cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub format: ArchiveFormat,
    /// Leave images whose archive already exists in the bundle alone
    pub skip_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub trust_policy: TrustPolicy,
    pub remove_signatures: bool,
    pub skip_tls: bool,
    /// Registry hosts reached over plain HTTP
    pub plain_http: Vec<String>,
    pub timeout_secs: Option<u64>,
    /// Images transferred at once; 1 keeps transfers sequential
    pub concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            trust_policy: TrustPolicy::default(),
            remove_signatures: true,
            skip_tls: false,
            plain_http: Vec::new(),
            timeout_secs: None,
            concurrency: 1,
        }
    }
}

impl TransferConfig {
    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            trust_policy: self.trust_policy.clone(),
            remove_signatures: self.remove_signatures,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn is_plain_http(&self, host: &str) -> bool {
        self.plain_http.iter().any(|h| h == host)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocatorConfig {
    pub bundle: BundleConfig,
    pub transfer: TransferConfig,
    /// Credentials keyed by registry host
    pub auth: HashMap<String, AuthConfig>,
}

impl RelocatorConfig {
    /// Load a YAML or JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| RelocatorError::path(path, e))?;
        let config: RelocatorConfig = serde_yaml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded configuration file");
        Ok(config)
    }

    /// Apply `IMAGE_RELOCATOR_*` variables from the process environment.
    ///
    /// Credentials from the environment are attached to `destination` only;
    /// without a destination registry they are ignored.
    pub fn apply_env(&mut self, destination: Option<&str>) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok(), destination)
    }

    pub fn apply_env_from<F>(&mut self, lookup: F, destination: Option<&str>) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CONCURRENCY) {
            self.transfer.concurrency = value.parse().map_err(|_| {
                RelocatorError::Configuration(format!(
                    "{} must be a positive integer, got {:?}",
                    ENV_CONCURRENCY, value
                ))
            })?;
        }

        if let Some(value) = lookup(ENV_SKIP_TLS) {
            self.transfer.skip_tls = matches!(value.as_str(), "1" | "true" | "yes");
        }

        if let (Some(username), Some(host)) = (lookup(ENV_USERNAME), destination) {
            let password = lookup(ENV_PASSWORD).unwrap_or_default();
            self.auth
                .insert(host.to_string(), AuthConfig::new(username, password));
        }

        Ok(())
    }

    pub fn credentials_for(&self, host: &str) -> Option<&AuthConfig> {
        self.auth.get(host)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.concurrency == 0 {
            return Err(RelocatorError::Configuration(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.transfer.timeout_secs == Some(0) {
            return Err(RelocatorError::Configuration(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let TrustPolicy::TrustedRegistries { registries } = &self.transfer.trust_policy {
            if registries.is_empty() {
                return Err(RelocatorError::Configuration(
                    "trustedRegistries policy needs at least one registry".to_string(),
                ));
            }
        }
        for (host, auth) in &self.auth {
            auth.validate().map_err(|e| {
                RelocatorError::Configuration(format!("credentials for {}: {}", host, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelocatorConfig::default();
        assert_eq!(config.transfer.concurrency, 1);
        assert!(config.transfer.remove_signatures);
        assert_eq!(config.transfer.trust_policy, TrustPolicy::InsecureAcceptAnything);
        assert_eq!(config.bundle.format, ArchiveFormat::DockerArchive);
        assert!(!config.bundle.skip_existing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relocator.yaml");
        fs::write(
            &path,
            r#"
bundle:
  skip_existing: true
transfer:
  concurrency: 4
  plain_http: ["localhost:5000"]
  trust_policy:
    type: trustedRegistries
    registries: ["registry.example.com"]
auth:
  myregistry.io:
    username: deployer
    password: s3cret
"#,
        )
        .unwrap();

        let config = RelocatorConfig::load(&path).unwrap();
        assert!(config.bundle.skip_existing);
        assert_eq!(config.transfer.concurrency, 4);
        assert!(config.transfer.is_plain_http("localhost:5000"));
        assert!(config.transfer.remove_signatures);
        assert_eq!(
            config.credentials_for("myregistry.io"),
            Some(&AuthConfig::new("deployer", "s3cret"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relocator.json");
        fs::write(&path, r#"{"transfer": {"timeout_secs": 30}}"#).unwrap();
        let config = RelocatorConfig::load(&path).unwrap();
        assert_eq!(config.transfer.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_USERNAME, "robot"),
            (ENV_PASSWORD, "token"),
            (ENV_CONCURRENCY, "3"),
            (ENV_SKIP_TLS, "true"),
        ]
        .into_iter()
        .collect();

        let mut config = RelocatorConfig::default();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()), Some("myregistry.io"))
            .unwrap();
        assert_eq!(config.transfer.concurrency, 3);
        assert!(config.transfer.skip_tls);
        assert_eq!(
            config.credentials_for("myregistry.io"),
            Some(&AuthConfig::new("robot", "token"))
        );

        let mut without_destination = RelocatorConfig::default();
        without_destination
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()), None)
            .unwrap();
        assert!(without_destination.auth.is_empty());
    }

    #[test]
    fn test_env_rejects_bad_concurrency() {
        let mut config = RelocatorConfig::default();
        let result = config.apply_env_from(
            |key| (key == ENV_CONCURRENCY).then(|| "many".to_string()),
            None,
        );
        assert!(matches!(result, Err(RelocatorError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelocatorConfig::default();
        config.transfer.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = RelocatorConfig::default();
        config.transfer.trust_policy = TrustPolicy::TrustedRegistries {
            registries: Vec::new(),
        };
        assert!(config.validate().is_err());

        let mut config = RelocatorConfig::default();
        config
            .auth
            .insert("myregistry.io".to_string(), AuthConfig::new("", "x"));
        assert!(config.validate().is_err());
    }
}
