//! Client configuration: endpoint, credentials and tuning knobs.

use std::env;
use std::time::Duration;

use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Region used when none is configured.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Where the storage service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Use TLS.
    pub secure: bool,
    /// Signing region.
    pub region: String,
}

impl EndpointConfig {
    /// Parses `host[:port]`. The port defaults to 443 with TLS and 80 without.
    pub fn parse(endpoint: &str, secure: bool, region: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty endpoint".into()));
        }
        let default_port = if secure { 443 } else { 80 };
        let (host, port) = match endpoint.rsplit_once(':') {
            // Bare IPv6 addresses carry colons but no brackets.
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::InvalidArgument(format!("invalid port in endpoint {endpoint:?}"))
                })?;
                (host, port)
            }
            _ => (endpoint, default_port),
        };
        if host.is_empty() {
            return Err(Error::InvalidArgument(format!("missing host in endpoint {endpoint:?}")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            secure,
            region: region.into(),
        })
    }

    /// Value of the `host` header: the port is omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Host name without IPv6 brackets, as used for TCP connect and TLS SNI.
    pub fn connect_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

/// Configuration for an [`ObjectStorage`](crate::ObjectStorage) client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Service endpoint.
    pub endpoint: EndpointConfig,
    /// Initial credentials. They can be rotated later on the client.
    pub credentials: Credentials,
    /// Upper bound of a single transfer chunk in bytes.
    pub chunk_size: usize,
    /// Maximum number of connections checked out at the same time.
    pub max_connections: usize,
    /// Bounds pool checkout and connect of one attempt, and how long an attempt may go
    /// without sending a body chunk or, once the body is written, without a response head.
    pub attempt_timeout: Duration,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
    /// Retry and backoff settings.
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig {
                host: "localhost".to_string(),
                port: 9000,
                secure: false,
                region: DEFAULT_REGION.to_string(),
            },
            credentials: Credentials::new("minioadmin", "minioadmin"),
            chunk_size: 64 * 1024, // 64KiB
            max_connections: 16,
            attempt_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from `MINIO_*` environment variables, falling back to defaults
    /// for anything unset or empty.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let secure = match get("MINIO_SECURE", "false").to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                return Err(Error::InvalidArgument(format!("invalid MINIO_SECURE value {other:?}")));
            }
        };
        let endpoint = EndpointConfig::parse(
            &get("MINIO_ENDPOINT", "localhost:9000"),
            secure,
            get("MINIO_REGION", DEFAULT_REGION),
        )?;
        let mut credentials = Credentials::new(
            get("MINIO_ACCESS_KEY", "minioadmin"),
            get("MINIO_SECRET_KEY", "minioadmin"),
        );
        if let Some(token) = lookup("MINIO_SESSION_TOKEN").filter(|v| !v.is_empty()) {
            credentials = credentials.with_session_token(token);
        }
        Ok(Self {
            endpoint,
            credentials,
            ..Self::default()
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk_size must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidArgument("max_connections must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidArgument("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}
