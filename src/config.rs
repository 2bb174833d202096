//! Configuration document model, decoded from YAML.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root proxy configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerOpts,
    pub entrypoints: HashMap<String, Entrypoint>,
    pub backends: HashMap<String, Backend>,
    pub routes: HashMap<String, Route>,
}

impl Config {
    /// Reads and decodes the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&raw)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Config, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Server-wide timeouts and observability switches.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerOpts {
    #[serde(with = "duration::option")]
    pub read_timeout: Option<Duration>,

    #[serde(with = "duration::option")]
    pub write_timeout: Option<Duration>,

    #[serde(with = "duration::option")]
    pub idle_timeout: Option<Duration>,

    pub access_log: bool,
}

/// A named listening endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Entrypoint {
    pub address: String,

    #[serde(default)]
    pub tls: Option<Certificate>,
}

impl Entrypoint {
    pub fn is_tls(&self) -> bool {
        matches!(&self.tls, Some(cert) if cert.is_configured())
    }
}

/// Certificate material for a TLS entrypoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Certificate {
    #[serde(rename = "cert")]
    pub cert_file: PathBuf,

    #[serde(rename = "key")]
    pub key_file: PathBuf,
}

impl Certificate {
    pub fn is_configured(&self) -> bool {
        !self.cert_file.as_os_str().is_empty() && !self.key_file.as_os_str().is_empty()
    }
}

/// A named ordered pool of upstream origins.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Backend {
    pub servers: Vec<String>,

    #[serde(with = "duration::option")]
    pub timeout: Option<Duration>,
}

/// A pattern routed to a backend through a middleware chain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Route {
    pub pattern: String,
    pub backend: String,

    #[serde(default)]
    pub middleware: Vec<MiddlewareSpec>,
}

/// One middleware declaration, dispatched on its `type` key. An unknown
/// type fails configuration decoding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MiddlewareSpec {
    Cache {
        #[serde(default, with = "duration::option")]
        expiry: Option<Duration>,

        #[serde(default, with = "duration::option")]
        purge: Option<Duration>,

        #[serde(default, rename = "ignoreHeaders")]
        ignore_headers: bool,
    },
    Location {
        path: String,
    },
}

/// Duration fields accept Go-style strings (`30s`, `1m30s`, `100ms`,
/// decimals allowed) or a bare number of seconds.
pub(crate) mod duration {
    use std::time::Duration;

    pub fn parse(input: &str) -> Result<Duration, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty duration".to_string());
        }
        if input == "0" {
            return Ok(Duration::ZERO);
        }

        let mut total = Duration::ZERO;
        let mut rest = input;
        while !rest.is_empty() {
            let number_end = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(|| format!("missing unit in duration '{input}'"))?;
            if number_end == 0 {
                return Err(format!("invalid duration '{input}'"));
            }
            let value: f64 = rest[..number_end]
                .parse()
                .map_err(|_| format!("invalid duration '{input}'"))?;
            rest = &rest[number_end..];

            let unit_end = rest
                .find(|c: char| c.is_ascii_digit())
                .unwrap_or(rest.len());
            let unit = &rest[..unit_end];
            rest = &rest[unit_end..];

            let scale = match unit {
                "ns" => 1e-9,
                "us" | "µs" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                _ => return Err(format!("unknown unit '{unit}' in duration '{input}'")),
            };
            total += Duration::from_secs_f64(value * scale);
        }
        Ok(total)
    }

    pub(crate) mod option {
        use std::fmt;
        use std::time::Duration;

        use serde::de::{Deserializer, Error, Visitor};

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(DurationVisitor)
        }

        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Option<Duration>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string or a number of seconds")
            }

            fn visit_str<E: Error>(self, value: &str) -> Result<Self::Value, E> {
                super::parse(value).map(Some).map_err(E::custom)
            }

            fn visit_u64<E: Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Some(Duration::from_secs(value)))
            }

            fn visit_i64<E: Error>(self, value: i64) -> Result<Self::Value, E> {
                if value < 0 {
                    return Err(E::custom("negative duration"));
                }
                Ok(Some(Duration::from_secs(value as u64)))
            }

            fn visit_f64<E: Error>(self, value: f64) -> Result<Self::Value, E> {
                if !value.is_finite() || value < 0.0 {
                    return Err(E::custom("invalid duration"));
                }
                Ok(Some(Duration::from_secs_f64(value)))
            }

            fn visit_unit<E: Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_none<E: Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_document() {
        let raw = r#"
server:
  readTimeout: 30s
  writeTimeout: 30s
  idleTimeout: 1s
  accessLog: true
entrypoints:
  http:
    address: ":8080"
  https:
    address: ":8443"
    tls:
      cert: ./testdata/cert.pem
      key: ./testdata/key.pem
backends:
  test-server:
    servers: ["http://127.0.0.1:9080", "http://127.0.0.1:9081"]
    timeout: 1s
routes:
  test-route:
    pattern: "test1.dev/test"
    backend: test-server
    middleware:
      - type: cache
        expiry: 10s
        purge: 1m
        ignoreHeaders: true
"#;
        let config = Config::from_str(raw).unwrap();

        assert_eq!(config.server.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.server.write_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.server.idle_timeout, Some(Duration::from_secs(1)));
        assert!(config.server.access_log);

        let http = &config.entrypoints["http"];
        assert_eq!(http.address, ":8080");
        assert!(!http.is_tls());

        let https = &config.entrypoints["https"];
        assert_eq!(https.address, ":8443");
        assert!(https.is_tls());
        assert_eq!(
            https.tls.as_ref().unwrap().cert_file,
            PathBuf::from("./testdata/cert.pem")
        );

        let backend = &config.backends["test-server"];
        assert_eq!(
            backend.servers,
            ["http://127.0.0.1:9080", "http://127.0.0.1:9081"]
        );
        assert_eq!(backend.timeout, Some(Duration::from_secs(1)));

        let route = &config.routes["test-route"];
        assert_eq!(route.pattern, "test1.dev/test");
        assert_eq!(route.backend, "test-server");
        assert_eq!(
            route.middleware,
            [MiddlewareSpec::Cache {
                expiry: Some(Duration::from_secs(10)),
                purge: Some(Duration::from_secs(60)),
                ignore_headers: true,
            }]
        );
    }

    #[test]
    fn location_middleware_decodes() {
        let raw = r#"
routes:
  r:
    pattern: "/"
    backend: b
    middleware:
      - type: location
        path: /new/path
"#;
        let config = Config::from_str(raw).unwrap();
        assert_eq!(
            config.routes["r"].middleware,
            [MiddlewareSpec::Location {
                path: "/new/path".to_string()
            }]
        );
    }

    #[test]
    fn unknown_middleware_type_is_rejected() {
        let raw = r#"
routes:
  r:
    pattern: "/"
    backend: b
    middleware:
      - type: gzip
"#;
        assert!(Config::from_str(raw).is_err());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn duration_strings_parse() {
        assert_eq!(duration::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(duration::parse("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(duration::parse("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(
            duration::parse("100ms").unwrap(),
            Duration::from_millis(100)
        );
        assert_eq!(
            duration::parse("1.5s").unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(duration::parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(duration::parse("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn bad_durations_are_rejected() {
        for input in ["", "10", "s", "xyz", "10x", "1.2.3s"] {
            assert!(duration::parse(input).is_err(), "accepted '{input}'");
        }
    }

    #[test]
    fn numeric_durations_mean_seconds() {
        let raw = "server:\n  readTimeout: 30\n";
        let config = Config::from_str(raw).unwrap();
        assert_eq!(config.server.read_timeout, Some(Duration::from_secs(30)));
    }
}
