//! This module defines the configuration file.

use std::{fs, path::Path, time::Duration};

use nodelabels::{annotations::DEFAULT_ANNOTATION_DOMAIN, AnnotationKeys};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WEBHOOK_PATH: &str = "/webhook";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Domain of the reserved pod annotations, e.g. `<domain>/env-zone`.
    pub annotation_domain: String,
    /// The HTTP path the admission reviews are posted to.
    pub webhook_path: String,
    /// Upper bound for answering a single admission request.
    pub request_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            annotation_domain: DEFAULT_ANNOTATION_DOMAIN.to_string(),
            webhook_path: DEFAULT_WEBHOOK_PATH.to_string(),
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
        }
    }
}

impl Config {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(file_path: &Path) -> anyhow::Result<Self> {
        let config_content = fs::read_to_string(file_path)?;
        Self::from_str(&config_content)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.annotation_domain.trim().is_empty(),
            "annotationDomain must not be empty"
        );
        anyhow::ensure!(
            self.webhook_path.starts_with('/'),
            "webhookPath must start with '/': {:?}",
            self.webhook_path
        );
        anyhow::ensure!(
            self.request_timeout_seconds > 0,
            "requestTimeoutSeconds must be positive"
        );
        Ok(())
    }

    pub fn annotation_keys(&self) -> AnnotationKeys {
        AnnotationKeys::new(&self.annotation_domain)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_load() {
        let config = Config::from_str(
            r#"
            annotationDomain: labels.example.com
            webhookPath: /mutate-pods
            requestTimeoutSeconds: 5
        "#,
        )
        .unwrap();

        assert_eq!(config.webhook_path, "/mutate-pods");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));

        let keys = config.annotation_keys();
        assert_eq!(keys.env_prefix(), "labels.example.com/env-");
        assert_eq!(keys.containers_key(), "labels.example.com/containers");
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_str("webhookPath: /hook").unwrap();

        assert_eq!(config.annotation_domain, DEFAULT_ANNOTATION_DOMAIN);
        assert_eq!(config.webhook_path, "/hook");
        assert_eq!(
            config.request_timeout_seconds,
            DEFAULT_REQUEST_TIMEOUT_SECONDS
        );
        assert_eq!(Config::from_str("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        assert!(Config::from_str("webhookPath: webhook").is_err());
        assert!(Config::from_str("requestTimeoutSeconds: 0").is_err());
        assert!(Config::from_str("annotationDomain: ''").is_err());
        assert!(Config::from_str("unknown: [").is_err());
    }
}
