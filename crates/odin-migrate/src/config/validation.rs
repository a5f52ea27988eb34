//! Configuration validation.

use super::{Config, DatabaseConfig};
use crate::error::{MigrateError, Result};
use crate::source::SourceFilter;
use crate::tls::SslMode;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_database("source", &config.source)?;
    validate_database("target", &config.target)?;

    // Cannot migrate to the same database
    if config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    let migration = &config.migration;
    if migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(ratio) = migration.max_failure_ratio {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(MigrateError::Config(format!(
                "migration.max_failure_ratio must be in (0, 1], got {}",
                ratio
            )));
        }
    }
    if migration.retry.max_attempts == 0 {
        return Err(MigrateError::Config(
            "migration.retry.max_attempts must be at least 1".into(),
        ));
    }
    if migration.retry.base_delay_ms > migration.retry.max_delay_ms {
        return Err(MigrateError::Config(
            "migration.retry.base_delay_ms cannot exceed max_delay_ms".into(),
        ));
    }
    if migration.retry.operation_timeout_ms == 0 {
        return Err(MigrateError::Config(
            "migration.retry.operation_timeout_ms must be at least 1".into(),
        ));
    }
    if migration.max_disambiguation_attempts == 0 {
        return Err(MigrateError::Config(
            "migration.max_disambiguation_attempts must be at least 1".into(),
        ));
    }
    let domain = &migration.synthetic_email_domain;
    if domain.is_empty() || !domain.contains('.') || domain.contains('@') || domain.contains(' ') {
        return Err(MigrateError::Config(format!(
            "migration.synthetic_email_domain '{}' is not a valid domain",
            domain
        )));
    }
    if let Some(filter) = &migration.filter {
        SourceFilter::parse(filter)?;
    }

    let code = &config.defaults.phone_country_code;
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(MigrateError::Config(format!(
            "defaults.phone_country_code must be digits only, got '{}'",
            code
        )));
    }
    if config.defaults.country.trim().is_empty() || config.defaults.county.trim().is_empty() {
        return Err(MigrateError::Config(
            "defaults.country and defaults.county cannot be empty".into(),
        ));
    }

    Ok(())
}

fn validate_database(section: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", section)));
    }
    if db.database.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.database is required",
            section
        )));
    }
    if db.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", section)));
    }
    if db.max_connections == 0 {
        return Err(MigrateError::Config(format!(
            "{}.max_connections must be at least 1",
            section
        )));
    }
    SslMode::parse(&db.ssl_mode)
        .map_err(|e| MigrateError::Config(format!("{}.ssl_mode: {}", section, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefaultsConfig, MigrationConfig};

    fn db(host: &str, database: &str) -> DatabaseConfig {
        DatabaseConfig {
            host: host.to_string(),
            port: 5432,
            database: database.to_string(),
            user: "postgres".to_string(),
            password: "s3cret".to_string(),
            schema: "public".to_string(),
            ssl_mode: "disable".to_string(),
            max_connections: 4,
        }
    }

    fn valid_config() -> Config {
        Config {
            source: db("localhost", "heimdall"),
            target: db("localhost", "odin"),
            migration: MigrationConfig::default(),
            defaults: DefaultsConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("source.host is required"));
    }

    #[test]
    fn test_missing_target_database() {
        let mut config = valid_config();
        config.target.database = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.target.database = "heimdall".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = valid_config();
        config.target.ssl_mode = "sometimes".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("target.ssl_mode"));
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.migration.batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_operation_timeout() {
        let mut config = valid_config();
        config.migration.retry.operation_timeout_ms = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("operation_timeout_ms"));
    }

    #[test]
    fn test_failure_ratio_bounds() {
        let mut config = valid_config();
        config.migration.max_failure_ratio = Some(0.25);
        assert!(validate(&config).is_ok());
        config.migration.max_failure_ratio = Some(1.5);
        assert!(validate(&config).is_err());
        config.migration.max_failure_ratio = Some(0.0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_synthetic_domain_checked() {
        let mut config = valid_config();
        config.migration.synthetic_email_domain = "localhost".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_bad_filter_rejected() {
        let mut config = valid_config();
        config.migration.filter = Some("colour=blue".to_string());
        assert!(validate(&config).is_err());
        config.migration.filter = Some("school_id=7".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_phone_country_code_digits() {
        let mut config = valid_config();
        config.defaults.phone_country_code = "+254".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = valid_config();
        let debug = format!("{:?}", config.source);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("s3cret"));
    }
}
