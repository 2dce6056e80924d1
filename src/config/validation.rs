//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (shutdown timeout floor, pool sizes)
//! - Detect conflicting listeners (names, ports)
//! - Check that TLS listeners have the material they need
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use thiserror::Error;

use crate::config::schema::{
    PoolConfig, ServeConfig, TlsMode, MIN_GRACEFUL_SHUTDOWN_SECS,
};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("graceful_shutdown_timeout_secs must be at least {min}, got {actual}")]
    ShutdownTimeoutTooShort { min: u64, actual: u64 },

    #[error("request_timeout_secs must be greater than zero")]
    ZeroRequestTimeout,

    #[error("listener name must not be empty")]
    EmptyListenerName,

    #[error("duplicate listener name: {0}")]
    DuplicateListenerName(String),

    #[error("listeners {first} and {second} both bind port {port}")]
    DuplicatePort { port: u16, first: String, second: String },

    #[error("listener {0} uses TLS but no [tls] section is configured")]
    MissingTlsMaterial(String),

    #[error("listener {0} uses mutual TLS but tls.client_ca_path is not set")]
    MissingClientCa(String),

    #[error("{pool} pool: {reason}")]
    InvalidPool { pool: &'static str, reason: String },

    #[error("unknown log format: {0} (expected \"text\" or \"json\")")]
    UnknownLogFormat(String),
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ServeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let timeout = config.server.graceful_shutdown_timeout_secs;
    if timeout < MIN_GRACEFUL_SHUTDOWN_SECS {
        errors.push(ValidationError::ShutdownTimeoutTooShort {
            min: MIN_GRACEFUL_SHUTDOWN_SECS,
            actual: timeout,
        });
    }
    if config.server.request_timeout_secs == 0 {
        errors.push(ValidationError::ZeroRequestTimeout);
    }

    let mut names = HashSet::new();
    for listener in &config.listeners {
        if listener.name.trim().is_empty() {
            errors.push(ValidationError::EmptyListenerName);
        } else if !names.insert(listener.name.as_str()) {
            errors.push(ValidationError::DuplicateListenerName(listener.name.clone()));
        }
    }

    // Port 0 is ephemeral and never conflicts.
    let mut ports: Vec<(u16, &str)> = Vec::new();
    for listener in config.enabled_listeners().filter(|l| l.port != 0) {
        if let Some((_, first)) = ports.iter().find(|(p, _)| *p == listener.port) {
            errors.push(ValidationError::DuplicatePort {
                port: listener.port,
                first: first.to_string(),
                second: listener.name.clone(),
            });
        } else {
            ports.push((listener.port, &listener.name));
        }
    }

    for listener in config.enabled_listeners() {
        match (listener.tls_mode, &config.tls) {
            (TlsMode::None, _) => {}
            (_, None) => errors.push(ValidationError::MissingTlsMaterial(listener.name.clone())),
            (TlsMode::Mutual, Some(tls)) if tls.client_ca_path.is_none() => {
                errors.push(ValidationError::MissingClientCa(listener.name.clone()))
            }
            _ => {}
        }
    }

    if let Some(pool) = &config.database {
        check_pool("database", pool, &mut errors);
    }
    if let Some(pool) = &config.cache {
        check_pool("cache", pool, &mut errors);
    }

    match config.observability.log_format.as_str() {
        "text" | "json" => {}
        other => errors.push(ValidationError::UnknownLogFormat(other.to_string())),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_pool(pool: &'static str, config: &PoolConfig, errors: &mut Vec<ValidationError>) {
    if config.address.trim().is_empty() {
        errors.push(ValidationError::InvalidPool {
            pool,
            reason: "address must not be empty".to_string(),
        });
    }
    if config.max_connections == 0 {
        errors.push(ValidationError::InvalidPool {
            pool,
            reason: "max_connections must be greater than zero".to_string(),
        });
    }
    if config.connect_timeout_secs == 0 {
        errors.push(ValidationError::InvalidPool {
            pool,
            reason: "connect_timeout_secs must be greater than zero".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ListenerConfig, TlsConfig};

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ServeConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ServeConfig::default();
        config.server.graceful_shutdown_timeout_secs = 2;
        config.listeners = vec![
            ListenerConfig::new("public", 8080, TlsMode::None),
            ListenerConfig::new("public", 8443, TlsMode::Server),
            ListenerConfig::new("prime", 8080, TlsMode::Mutual),
        ];
        config.observability.log_format = "xml".to_string();

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::ShutdownTimeoutTooShort { min: 5, actual: 2 }));
        assert!(errors.contains(&ValidationError::DuplicateListenerName("public".into())));
        assert!(errors.contains(&ValidationError::DuplicatePort {
            port: 8080,
            first: "public".into(),
            second: "prime".into(),
        }));
        assert!(errors.contains(&ValidationError::MissingTlsMaterial("public".into())));
        assert!(errors.contains(&ValidationError::MissingTlsMaterial("prime".into())));
        assert!(errors.contains(&ValidationError::UnknownLogFormat("xml".into())));
    }

    #[test]
    fn mutual_tls_needs_client_ca() {
        let mut config = ServeConfig::default();
        config.listeners = vec![ListenerConfig::new("mutual-tls", 9443, TlsMode::Mutual)];
        config.tls = Some(TlsConfig {
            cert_path: "cert.pem".into(),
            key_path: "key.pem".into(),
            client_ca_path: None,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::MissingClientCa("mutual-tls".into())]);
    }

    #[test]
    fn ephemeral_ports_and_disabled_listeners_do_not_conflict() {
        let mut config = ServeConfig::default();
        let mut disabled = ListenerConfig::new("old", 8080, TlsMode::None);
        disabled.enabled = false;
        config.listeners = vec![
            ListenerConfig::new("a", 0, TlsMode::None),
            ListenerConfig::new("b", 0, TlsMode::None),
            ListenerConfig::new("c", 8080, TlsMode::None),
            disabled,
        ];
        assert_eq!(validate_config(&config), Ok(()));
    }

    #[test]
    fn rejects_empty_pool() {
        let mut config = ServeConfig::default();
        let mut pool = PoolConfig::new("");
        pool.max_connections = 0;
        config.cache = Some(pool);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::InvalidPool { pool: "cache", .. })));
    }
}
