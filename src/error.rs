//! Error taxonomy for configuration derivation, persistence and reload

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for webscale operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the configuration engine
///
/// Discovery problems are not errors; see [`DiscoveryWarning`].
#[derive(Debug, Error)]
pub enum Error {
    /// Writing a configuration file (or restoring its backup) failed
    #[error("failed to write {target} at {path}: {message}")]
    ConfigWrite {
        /// What was being written (a fragment id or "nginx.conf")
        target: String,
        /// Destination path
        path: PathBuf,
        /// Underlying cause, including restore status when relevant
        message: String,
    },

    /// The template references a placeholder the substitution table lacks
    #[error("unresolved placeholder '{{{name}}}' in template")]
    UnresolvedPlaceholder {
        /// Placeholder name without braces
        name: String,
    },

    /// The template has an unmatched brace
    #[error("malformed template at byte {offset}: {message}")]
    MalformedTemplate { offset: usize, message: String },

    /// Template file could not be read
    #[error("could not find template at {path}: {source}")]
    TemplateMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// nginx ran but rejected the configuration
    #[error("nginx rejected the configuration: {diagnostic}")]
    ConfigValidation {
        /// Combined stdout/stderr of the failing command
        diagnostic: String,
    },

    /// nginx control command could not be started
    #[error("could not run '{command}': {source}")]
    ReloadExecution {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// nginx control command did not finish in time
    #[error("'{command}' did not finish within {}s", .timeout.as_secs())]
    ReloadTimeout { command: String, timeout: Duration },

    /// Backend id cannot be used as a route prefix or file name
    #[error("invalid backend id '{0}': use ASCII letters, digits, '.', '_' or '-'")]
    InvalidBackendId(String),

    /// Hostname cannot be placed in a proxy_pass directive
    #[error("invalid backend hostname '{0}'")]
    InvalidHostname(String),

    /// Settings file could not be loaded or failed validation
    #[error("settings error: {0}")]
    Settings(String),

    /// Other filesystem errors (reading fragments, listing directories)
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures that come from nginx itself rather than from the
    /// files this crate manages
    pub fn is_reload_failure(&self) -> bool {
        matches!(
            self,
            Error::ConfigValidation { .. } | Error::ReloadExecution { .. } | Error::ReloadTimeout { .. }
        )
    }
}

/// A non-fatal problem found while discovering topology
///
/// Partial topology is still useful, so these are logged and carried in the
/// snapshot rather than failing the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryWarning {
    /// File the problem was found in
    pub path: PathBuf,
    /// What was wrong with it
    pub message: String,
}

impl fmt::Display for DiscoveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}
