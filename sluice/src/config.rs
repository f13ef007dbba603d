//! Configuration for sluice components.
//!
//! Configuration is a JSON document whose every field has a default, so an
//! empty object `{}` is a valid config:
//!
//! ```json
//! {
//!   "redis": { "host": "localhost", "port": 6379 },
//!   "consumer": { "count": 10, "block": "5s", "recover_pending": true },
//!   "retention": { "streams": ["*"], "interval": "1m", "retention": "1m" }
//! }
//! ```
//!
//! Durations are written as an integer followed by a unit: `ms`, `s`, `m`,
//! `h` or `d`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consumer::ConsumeOptions;
use crate::error::ConfigError;
use crate::retention::RetentionPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Redis connection settings.
    pub redis: RedisConfig,
    /// Consume loop settings.
    pub consumer: ConsumeOptions,
    /// Retention loop settings.
    pub retention: RetentionPolicy,
}

impl Config {
    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, and
    /// [`ConfigError::Parse`] or [`ConfigError::InvalidValue`] if its
    /// contents are unacceptable.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&content)
    }

    /// Parses and validates a config document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::InvalidValue`] for out-of-range values.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse { source: e })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumer.count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.count",
                reason: "must be > 0".to_string(),
            });
        }
        if self.retention.streams.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "retention.streams",
                reason: "at least one stream name or \"*\" is required".to_string(),
            });
        }
        if self.retention.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "retention.interval",
                reason: "must be > 0".to_string(),
            });
        }
        if self.redis.host.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "redis.host",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Connection settings for [`RedisTransport`](crate::redis_transport::RedisTransport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Server hostname or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// ACL username.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Database index.
    pub database: u16,
    /// Use `rediss://`.
    pub tls: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            tls: false,
        }
    }
}

impl RedisConfig {
    /// Builds the driver's connection info.
    ///
    /// Credentials are passed through as-is, so passwords may contain
    /// characters that a URL would need escaped.
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        let addr = if self.tls {
            redis::ConnectionAddr::TcpTls {
                host: self.host.clone(),
                port: self.port,
                insecure: false,
                tls_params: None,
            }
        } else {
            redis::ConnectionAddr::Tcp(self.host.clone(), self.port)
        };

        redis::ConnectionInfo {
            addr,
            redis: redis::RedisConnectionInfo {
                db: i64::from(self.database),
                username: self.username.clone(),
                password: self.password.clone(),
                ..redis::RedisConnectionInfo::default()
            },
        }
    }
}

/// Parses a human-readable duration (e.g. `"250ms"`, `"5s"`, `"1m"`, `"7d"`).
///
/// # Errors
///
/// Returns [`ConfigError::InvalidDuration`] for empty input, a non-numeric
/// amount, or an unknown unit.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = |reason: String| ConfigError::InvalidDuration {
        input: s.to_string(),
        reason,
    };
    if s.is_empty() {
        return Err(invalid("empty duration string".to_string()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid("missing unit; use ms, s, m, h, or d".to_string()))?;
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|e| invalid(format!("bad amount: {e}")))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num.saturating_mul(60)),
        "h" => Duration::from_secs(num.saturating_mul(3600)),
        "d" => Duration::from_secs(num.saturating_mul(86400)),
        _ => return Err(invalid(format!("unknown unit '{unit}'; use ms, s, m, h, or d"))),
    };
    Ok(duration)
}

/// Formats a duration using the largest unit that divides it exactly.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = duration.as_secs();
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Serde adapter that reads and writes durations as strings like `"5s"`.
pub(crate) mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration(" 7d ").unwrap(), Duration::from_secs(7 * 86400));
    }

    #[test]
    fn test_parse_duration_rejects_bad_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("3w").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_format_duration_picks_largest_unit() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(172_800)), "2d");
    }

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.consumer.count, 10);
        assert_eq!(config.consumer.block, Duration::from_secs(5));
        assert_eq!(config.retention.streams, vec!["*".to_string()]);
    }

    #[test]
    fn test_partial_document_overrides() {
        let config = Config::from_json(
            r#"{
                "redis": { "host": "cache.internal", "port": 6380, "password": "s3cret" },
                "consumer": { "block": "250ms" },
                "retention": { "streams": ["orders", "audit"], "retention": "2h" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.redis.host, "cache.internal");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.redis.password.as_deref(), Some("s3cret"));
        assert_eq!(config.consumer.count, 10);
        assert_eq!(config.consumer.block, Duration::from_millis(250));
        assert_eq!(config.retention.streams, vec!["orders", "audit"]);
        assert_eq!(config.retention.interval, Duration::from_secs(60));
        assert_eq!(config.retention.retention, Duration::from_secs(7200));
    }

    #[test]
    fn test_validation_failures() {
        let err = Config::from_json(r#"{"consumer": {"count": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "consumer.count", .. }));

        let err = Config::from_json(r#"{"retention": {"streams": []}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "retention.streams", .. }));

        let err = Config::from_json(r#"{"retention": {"interval": "soon"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_connection_info_forms() {
        let mut config = RedisConfig::default();
        let info = config.connection_info();
        assert!(matches!(&info.addr, redis::ConnectionAddr::Tcp(host, 6379) if host.as_str() == "localhost"));
        assert_eq!(info.redis.db, 0);
        assert!(info.redis.username.is_none());
        assert!(info.redis.password.is_none());

        config.username = Some("app".to_string());
        config.password = Some("p@ss/w:rd#1".to_string());
        config.tls = true;
        config.database = 3;
        let info = config.connection_info();
        assert!(matches!(
            &info.addr,
            redis::ConnectionAddr::TcpTls { host, port: 6379, insecure: false, .. } if host.as_str() == "localhost"
        ));
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.username.as_deref(), Some("app"));
        assert_eq!(info.redis.password.as_deref(), Some("p@ss/w:rd#1"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.json");
        std::fs::write(&path, r#"{"retention": {"interval": "30s"}}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.retention.interval, Duration::from_secs(30));

        let missing = Config::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
