//! Server Configuration Settings
//!
//! Configuration types for the telemetry server, loaded from environment
//! variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_THRESHOLD: usize = 100;
const DEFAULT_IDLE_SECS: u64 = 5;
const DEFAULT_HEALTH_PORT: u16 = 8082;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Where the listener's TLS identity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Plaintext HTTP/2.
    Disabled,
    /// A throwaway self-signed identity generated at startup.
    SelfSigned,
    /// PEM files on disk, reloaded on every listener restart.
    Files {
        /// Server certificate chain.
        cert: PathBuf,
        /// Server private key.
        key: PathBuf,
        /// CA used to verify client certificates.
        ca: Option<PathBuf>,
    },
}

/// TLS settings of the gRPC listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Identity source.
    pub mode: TlsMode,
    /// Request client certificates without requiring them.
    pub allow_no_client_auth: bool,
}

impl TlsSettings {
    /// Certificate and key files whose changes trigger a listener restart.
    #[must_use]
    pub const fn watched_files(&self) -> Option<(&PathBuf, &PathBuf)> {
        match &self.mode {
            TlsMode::Files { cert, key, .. } => Some((cert, key)),
            TlsMode::Disabled | TlsMode::SelfSigned => None,
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// gRPC listen address.
    pub listen: SocketAddr,
    /// Maximum concurrent sessions, 0 for unlimited.
    pub threshold: usize,
    /// HTTP/2 keep-alive interval and timeout, zero disables.
    pub idle_timeout: Duration,
    /// Listener TLS settings.
    pub tls: TlsSettings,
    /// Health and metrics HTTP port, 0 disables.
    pub health_port: u16,
    /// Redis URL of the connection registry.
    pub registry_url: Option<String>,
    /// Per-session delivery queue bound.
    pub queue_capacity: usize,
}

impl ServerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        let port: u16 = vars
            .required("TELEMETRY_PORT")?
            .parse()
            .map_err(|e| ConfigError::invalid("TELEMETRY_PORT", &e))?;
        if port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TELEMETRY_PORT".to_string(),
                reason: "port must be greater than zero".to_string(),
            });
        }
        let bind_addr = vars
            .parse("TELEMETRY_BIND_ADDR")?
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let insecure = vars.flag("TELEMETRY_INSECURE")?;
        let no_tls = vars.flag("TELEMETRY_NO_TLS")?;
        let mode = if no_tls {
            TlsMode::Disabled
        } else if insecure {
            TlsMode::SelfSigned
        } else {
            TlsMode::Files {
                cert: vars.required("TELEMETRY_SERVER_CRT")?.into(),
                key: vars.required("TELEMETRY_SERVER_KEY")?.into(),
                ca: vars.optional("TELEMETRY_CA_CRT").map(PathBuf::from),
            }
        };

        Ok(Self {
            listen: SocketAddr::new(bind_addr, port),
            threshold: vars.parse("TELEMETRY_THRESHOLD")?.unwrap_or(DEFAULT_THRESHOLD),
            idle_timeout: Duration::from_secs(
                vars.parse("TELEMETRY_IDLE_CONN_SECS")?
                    .unwrap_or(DEFAULT_IDLE_SECS),
            ),
            tls: TlsSettings {
                mode,
                allow_no_client_auth: vars.flag("TELEMETRY_ALLOW_NO_CLIENT_AUTH")?,
            },
            health_port: vars
                .parse("TELEMETRY_HEALTH_PORT")?
                .unwrap_or(DEFAULT_HEALTH_PORT),
            registry_url: vars.optional("TELEMETRY_REGISTRY_URL"),
            queue_capacity: vars
                .parse("TELEMETRY_QUEUE_CAPACITY")?
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Parse failure.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, reason: &impl std::fmt::Display) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(key)
            .map(|v| v.parse().map_err(|e| ConfigError::invalid(key, &e)))
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        let Some(value) = self.optional(key) else {
            return Ok(false);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::invalid(key, &"expected a boolean")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn parse(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<_, _> = vars.iter().copied().collect();
        ServerConfig::from_lookup(|k| vars.get(k).map(ToString::to_string))
    }

    #[test]
    fn defaults_with_certificate_files() {
        let config = parse(&[
            ("TELEMETRY_PORT", "50051"),
            ("TELEMETRY_SERVER_CRT", "/etc/sonic/telemetry/server.crt"),
            ("TELEMETRY_SERVER_KEY", "/etc/sonic/telemetry/server.key"),
        ])
        .unwrap();

        assert_eq!(config.listen, "0.0.0.0:50051".parse().unwrap());
        assert_eq!(config.threshold, 100);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.health_port, 8082);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.registry_url, None);
        assert!(!config.tls.allow_no_client_auth);
        assert_eq!(
            config.tls.watched_files(),
            Some((
                &PathBuf::from("/etc/sonic/telemetry/server.crt"),
                &PathBuf::from("/etc/sonic/telemetry/server.key")
            ))
        );
        assert_eq!(
            config.tls.mode,
            TlsMode::Files {
                cert: "/etc/sonic/telemetry/server.crt".into(),
                key: "/etc/sonic/telemetry/server.key".into(),
                ca: None,
            }
        );
    }

    #[test]
    fn overrides() {
        let config = parse(&[
            ("TELEMETRY_PORT", "8080"),
            ("TELEMETRY_BIND_ADDR", "127.0.0.1"),
            ("TELEMETRY_THRESHOLD", "0"),
            ("TELEMETRY_IDLE_CONN_SECS", "0"),
            ("TELEMETRY_INSECURE", "true"),
            ("TELEMETRY_ALLOW_NO_CLIENT_AUTH", "1"),
            ("TELEMETRY_HEALTH_PORT", "0"),
            ("TELEMETRY_REGISTRY_URL", "redis://127.0.0.1:6379/6"),
            ("TELEMETRY_QUEUE_CAPACITY", "64"),
        ])
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.threshold, 0);
        assert_eq!(config.idle_timeout, Duration::ZERO);
        assert_eq!(config.tls.mode, TlsMode::SelfSigned);
        assert!(config.tls.allow_no_client_auth);
        assert_eq!(config.tls.watched_files(), None);
        assert_eq!(config.health_port, 0);
        assert_eq!(config.registry_url.as_deref(), Some("redis://127.0.0.1:6379/6"));
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn no_tls_wins_over_insecure() {
        let config = parse(&[
            ("TELEMETRY_PORT", "8080"),
            ("TELEMETRY_INSECURE", "true"),
            ("TELEMETRY_NO_TLS", "true"),
        ])
        .unwrap();
        assert_eq!(config.tls.mode, TlsMode::Disabled);
    }

    #[test]
    fn missing_port() {
        assert_eq!(
            parse(&[]).unwrap_err(),
            ConfigError::MissingEnvVar("TELEMETRY_PORT".to_string())
        );
    }

    #[test]
    fn missing_key_file() {
        let err = parse(&[("TELEMETRY_PORT", "8080"), ("TELEMETRY_SERVER_CRT", "a.crt")]).unwrap_err();
        assert_eq!(err, ConfigError::MissingEnvVar("TELEMETRY_SERVER_KEY".to_string()));
    }

    #[test_case("TELEMETRY_PORT", "0"; "zero port")]
    #[test_case("TELEMETRY_PORT", "-8080"; "negative port")]
    #[test_case("TELEMETRY_THRESHOLD", "-1"; "negative threshold")]
    #[test_case("TELEMETRY_IDLE_CONN_SECS", "-5"; "negative idle")]
    #[test_case("TELEMETRY_BIND_ADDR", "localhost"; "hostname bind")]
    #[test_case("TELEMETRY_NO_TLS", "maybe"; "bad flag")]
    fn invalid_values(key: &str, value: &str) {
        let mut vars = vec![("TELEMETRY_PORT", "8080"), ("TELEMETRY_NO_TLS", "true")];
        vars.retain(|(k, _)| *k != key);
        vars.push((key, value));

        let err = parse(&vars).unwrap_err();
        assert!(
            matches!(&err, ConfigError::InvalidValue { key: k, .. } if k == key),
            "unexpected {err:?}"
        );
    }
}
