//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use crate::retry::RetryConfig;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding `source.password`.
pub const SOURCE_PASSWORD_ENV: &str = "HEIMDALL_DB_PASSWORD";
/// Environment variable overriding `target.password`.
pub const TARGET_PASSWORD_ENV: &str = "ODIN_DB_PASSWORD";

impl Config {
    /// Load configuration from a YAML file, applying password overrides
    /// from the environment.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var(SOURCE_PASSWORD_ENV) {
            self.source.password = password;
        }
        if let Ok(password) = std::env::var(TARGET_PASSWORD_ENV) {
            self.target.password = password;
        }
    }

    /// Compute a SHA256 hash of the settings that determine migration output.
    ///
    /// Run-selection settings (entities, filter, fail-fast, batch size) and
    /// passwords are excluded so an interrupted run can be resumed with a
    /// narrower stage selection.
    pub fn hash(&self) -> String {
        #[derive(Serialize)]
        struct Fingerprint<'a> {
            source: (&'a str, u16, &'a str, &'a str),
            target: (&'a str, u16, &'a str, &'a str),
            synthetic_email_domain: &'a str,
            max_disambiguation_attempts: u32,
            defaults: &'a DefaultsConfig,
        }

        let fingerprint = Fingerprint {
            source: (
                &self.source.host,
                self.source.port,
                &self.source.database,
                &self.source.schema,
            ),
            target: (
                &self.target.host,
                self.target.port,
                &self.target.database,
                &self.target.schema,
            ),
            synthetic_email_domain: &self.migration.synthetic_email_domain,
            max_disambiguation_attempts: self.migration.max_disambiguation_attempts,
            defaults: &self.defaults,
        };

        let yaml = serde_yaml::to_string(&fingerprint).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl MigrationConfig {
    /// Retry policy for transient errors.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            operation_timeout: Some(self.operation_timeout()),
        }
    }

    /// Deadline for one database operation.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.retry.operation_timeout_ms)
    }
}

impl DatabaseConfig {
    /// `host:port/database` for log messages.
    pub fn display_target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
source:
  host: heimdall.internal
  database: heimdall
target:
  host: odin.internal
  database: odin
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.source.port, 5432);
        assert_eq!(config.source.user, "postgres");
        assert_eq!(config.target.ssl_mode, "disable");
        assert_eq!(config.migration.batch_size, 1000);
        assert_eq!(config.migration.max_disambiguation_attempts, 1000);
        assert!(config.migration.create_target_schema);
        assert!(!config.migration.fail_fast);
        assert_eq!(config.defaults.country, "Kenya");
        assert_eq!(config.defaults.county, "Nairobi");
        assert_eq!(config.defaults.phone_country_code, "254");
        assert_eq!(config.migration.selected_entities().len(), 4);
    }

    #[test]
    fn test_entities_and_retry_parse() {
        let yaml = format!(
            "{}migration:\n  entities: [students, schools]\n  retry:\n    max_attempts: 5\n",
            MINIMAL
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(
            config.migration.selected_entities(),
            vec![crate::EntityKind::Schools, crate::EntityKind::Students]
        );
        let retry = config.migration.retry_config();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(200));
        assert_eq!(retry.operation_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_hash_ignores_run_selection() {
        let a = Config::from_yaml(MINIMAL).unwrap();
        let mut b = a.clone();
        b.migration.entities = vec![crate::EntityKind::Students];
        b.migration.fail_fast = true;
        b.migration.batch_size = 10;
        b.target.password = "other".into();
        assert_eq!(a.hash(), b.hash());

        b.defaults.country = "Uganda".into();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        assert!(Config::from_yaml("source: [").is_err());
        assert!(Config::from_yaml("").is_err());
    }
}
