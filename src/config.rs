use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both HAVEN_TLS_CERT and HAVEN_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read from `HAVEN_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls_cert = lookup("HAVEN_TLS_CERT");
        let tls_key = lookup("HAVEN_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }
        Ok(Self {
            port: parsed(&lookup, "HAVEN_PORT")?.unwrap_or(5433),
            bind: lookup("HAVEN_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("HAVEN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("HAVEN_PASSWORD").unwrap_or_else(|| "haven".into()),
            max_connections: parsed(&lookup, "HAVEN_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "HAVEN_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert,
            tls_key,
            metrics_port: parsed(&lookup, "HAVEN_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
