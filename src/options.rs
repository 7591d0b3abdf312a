//! The user-editable web server options file (`zenwebserver.conf`)
//!
//! Line oriented: `<key> <value>`, blank lines and `#` comments ignored.
//! Keys other than the recognized ones are kept so templates can reference
//! them by name.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

pub const USE_SSL: &str = "useSSL";
pub const HTTP_PORT: &str = "httpPort";
pub const SSL_PORT: &str = "sslPort";
pub const SSL_CERT: &str = "sslCert";
pub const SSL_KEY: &str = "sslKey";
pub const SSL_USER: &str = "sslUser";

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_SSL_PORT: u16 = 443;

/// Parsed options keyed by option name (later duplicates win)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    values: BTreeMap<String, String>,
}

/// Where the proxy is reachable from the outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub use_ssl: bool,
    pub port: u16,
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_ssl { "https" } else { "http" };
        write!(f, "{} on port {}", scheme, self.port)
    }
}

impl Options {
    pub fn parse(content: &str) -> Self {
        let mut values = BTreeMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(char::is_whitespace) {
                Some((key, value)) if !value.trim().is_empty() => {
                    values.insert(key.to_string(), value.trim().to_string());
                }
                _ => {
                    warn!(line = lineno + 1, content = %line, "Ignoring option without a value");
                }
            }
        }
        Self { values }
    }

    /// Load options from `path`; a missing or unreadable file yields defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Options file not found; using default values");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read options file; using default values");
                Self::default()
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// TLS is on only when `useSSL` is present and case-insensitively "true"
    pub fn use_ssl(&self) -> bool {
        self.get(USE_SSL)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn http_port(&self) -> u16 {
        self.port_or(HTTP_PORT, DEFAULT_HTTP_PORT)
    }

    pub fn ssl_port(&self) -> u16 {
        self.port_or(SSL_PORT, DEFAULT_SSL_PORT)
    }

    /// Public scheme and port, as used to build URLs that go through the proxy
    pub fn endpoint(&self) -> ProxyEndpoint {
        let use_ssl = self.use_ssl();
        ProxyEndpoint {
            use_ssl,
            port: if use_ssl { self.ssl_port() } else { self.http_port() },
        }
    }

    fn port_or(&self, key: &str, default: u16) -> u16 {
        match self.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(key, value = raw, default, "Invalid port in options file; using default");
                default
            }),
            None => default,
        }
    }
}
