//! Discovery of the primary and secondary application server ports
//!
//! The primary server's port comes from `zope.conf`; each secondary instance
//! has its own `*.conf` file declaring a `port-base` offset from that port.
//! Nothing here fails the caller: unreadable or malformed input degrades to
//! defaults and a [`DiscoveryWarning`].

use crate::config::Settings;
use crate::error::DiscoveryWarning;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_HTTP_BASE_PORT: u16 = 8080;

const PORT_BASE_DIRECTIVE: &str = "port-base";

/// The backend ports visible at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    /// Port of the primary application server
    pub base_port: u16,
    /// Ports of the configured secondary instances
    pub secondary_ports: BTreeSet<u16>,
    /// Files that were skipped during discovery
    pub warnings: Vec<DiscoveryWarning>,
}

impl TopologySnapshot {
    pub fn contains(&self, port: u16) -> bool {
        self.secondary_ports.contains(&port)
    }
}

/// Reads topology from the application server configuration on disk
#[derive(Debug, Clone)]
pub struct TopologySource {
    zope_conf: PathBuf,
    zope_config_dir: PathBuf,
    daemons_file: PathBuf,
}

impl TopologySource {
    pub fn new(
        zope_conf: impl Into<PathBuf>,
        zope_config_dir: impl Into<PathBuf>,
        daemons_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            zope_conf: zope_conf.into(),
            zope_config_dir: zope_config_dir.into(),
            daemons_file: daemons_file.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.paths.zope_conf(),
            settings.paths.zope_config_dir(),
            settings.paths.daemons_file(),
        )
    }

    pub fn discover(&self) -> TopologySnapshot {
        let base_port = self.base_port();
        let mut secondary_ports = BTreeSet::new();
        let mut warnings = Vec::new();

        for path in self.secondary_config_files() {
            match read_port_base(&path) {
                Ok(offset) => match offset_port(base_port, offset) {
                    Some(port) => {
                        debug!(path = %path.display(), port, "Discovered secondary instance");
                        secondary_ports.insert(port);
                    }
                    None => warnings.push(skip(
                        &path,
                        format!("port-base {} does not give a valid port above {}", offset, base_port),
                    )),
                },
                Err(message) => warnings.push(skip(&path, message)),
            }
        }

        TopologySnapshot {
            base_port,
            secondary_ports,
            warnings,
        }
    }

    /// Port of the primary server, 8080 when it cannot be determined
    pub fn base_port(&self) -> u16 {
        match std::fs::read_to_string(&self.zope_conf) {
            Ok(content) => parse_http_server_port(&content).unwrap_or_else(|| {
                debug!(path = %self.zope_conf.display(), "No HTTP server address; using default port");
                DEFAULT_HTTP_BASE_PORT
            }),
            Err(e) => {
                debug!(path = %self.zope_conf.display(), error = %e, "Primary config unreadable; using default port");
                DEFAULT_HTTP_BASE_PORT
            }
        }
    }

    /// True when more than one secondary instance already runs under a
    /// scheme this system did not set up
    ///
    /// Errs on the side of caution: either several discovered secondaries or
    /// several `zope` entries in the daemons list count.
    pub fn has_multiple_secondaries(&self) -> bool {
        if self.discover().secondary_ports.len() > 1 {
            return true;
        }
        match std::fs::read_to_string(&self.daemons_file) {
            Ok(content) => content.lines().filter(|l| l.contains("zope")).count() > 1,
            // Default daemons only
            Err(_) => false,
        }
    }

    fn secondary_config_files(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.zope_config_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.zope_config_dir.display(), error = %e, "No secondary instance directory");
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "conf"))
            .collect();
        files.sort();
        files
    }
}

fn skip(path: &Path, message: String) -> DiscoveryWarning {
    warn!(path = %path.display(), reason = %message, "Skipping secondary instance config");
    DiscoveryWarning {
        path: path.to_path_buf(),
        message,
    }
}

/// First `port-base` line of a secondary instance file
fn read_port_base(path: &Path) -> Result<i32, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("unreadable: {}", e))?;
    let line = content
        .lines()
        .find(|l| l.starts_with(PORT_BASE_DIRECTIVE))
        .ok_or_else(|| "no port-base line".to_string())?;
    let value = line[PORT_BASE_DIRECTIVE.len()..].trim();
    value
        .parse()
        .map_err(|_| format!("unable to read port from line: {}", line.trim()))
}

/// Secondary port for `offset`; offsets that do not land above `base` are
/// rejected so a secondary never aliases the primary
fn offset_port(base: u16, offset: i32) -> Option<u16> {
    if offset <= 0 {
        return None;
    }
    u16::try_from(i32::from(base) + offset).ok()
}

/// Port of the `address` directive in the `<http-server>` section
///
/// Falls back to the first `address` line when the file has no section
/// markers. Accepts both `address 8080` and `address host:8080`.
fn parse_http_server_port(content: &str) -> Option<u16> {
    let has_section = content.lines().any(|l| l.trim().starts_with("<http-server"));
    let mut in_section = !has_section;

    for line in content.lines().map(str::trim) {
        if line.starts_with("<http-server") {
            in_section = true;
            continue;
        }
        if line.starts_with("</http-server") {
            if has_section {
                in_section = false;
            }
            continue;
        }
        if in_section && line.starts_with("address") {
            let value = line.split_whitespace().last()?;
            let port = value.rsplit(':').next()?;
            return port.parse().ok();
        }
    }
    None
}
