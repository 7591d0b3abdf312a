//! Per-backend routing fragments
//!
//! Each remote collector or hub gets one nginx `location` block in its own
//! file, `proxy-<kind>-<id>.conf`. The fragment directory is the registry of
//! routed backends: there is no in-memory copy, and the file name alone
//! identifies the backend, so an update is an overwrite and a removal is an
//! exact delete.

use crate::error::{Error, Result};
use crate::writer::atomic_write;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Render daemon port on a remote collector
pub const COLLECTOR_PORT: u16 = 8091;

/// Render daemon port on a remote hub
pub const HUB_PORT: u16 = 8090;

const FILE_PREFIX: &str = "proxy-";
const FILE_SUFFIX: &str = ".conf";

/// Kind of dynamically registered backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Collector,
    Hub,
}

impl BackendKind {
    /// Well-known port the proxy forwards to for this kind
    pub fn port(&self) -> u16 {
        match self {
            BackendKind::Collector => COLLECTOR_PORT,
            BackendKind::Hub => HUB_PORT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Collector => "collector",
            BackendKind::Hub => "hub",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "collector" => Ok(BackendKind::Collector),
            "hub" => Ok(BackendKind::Hub),
            other => Err(format!("unknown backend kind '{}' (expected collector or hub)", other)),
        }
    }
}

/// One routed backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteFragment {
    pub kind: BackendKind,
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl RouteFragment {
    /// Fragment for `id` on `host`, using the kind's well-known port
    pub fn new(kind: BackendKind, id: impl Into<String>, host: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_id(&id)?;
        let host = host.into();
        validate_host(&host)?;
        Ok(Self {
            kind,
            port: kind.port(),
            id,
            host,
        })
    }

    /// URL prefix under which the proxy exposes this backend
    pub fn render_url_prefix(&self) -> String {
        format!("/remote-{}/{}", self.kind, self.id)
    }

    pub fn file_name(&self) -> String {
        file_name(self.kind, &self.id)
    }

    /// nginx `location` block for this backend
    pub fn render(&self) -> String {
        let prefix = self.render_url_prefix();
        format!(
            "location ^~ {prefix}/ {{\n\
             \x20   rewrite ^{prefix}/(.*)$ /$1 break;\n\
             \x20   proxy_pass http://{host}:{port};\n\
             \x20   proxy_set_header        Host    $host;\n\
             \x20   proxy_set_header        X-Real-IP $remote_addr;\n\
             \x20   proxy_set_header        X-Forwarded-For $proxy_add_x_forwarded_for;\n\
             }}\n",
            prefix = prefix,
            host = self.host,
            port = self.port,
        )
    }

    /// Recover a fragment from its file contents
    pub fn parse(kind: BackendKind, id: &str, content: &str) -> Option<Self> {
        let target = content.lines().map(str::trim).find_map(|line| {
            line.strip_prefix("proxy_pass")
                .map(|rest| rest.trim().trim_end_matches(';').trim())
        })?;
        let authority = target.strip_prefix("http://")?.trim_end_matches('/');
        let (host, port) = authority.rsplit_once(':')?;
        Some(Self {
            kind,
            id: id.to_string(),
            host: host.to_string(),
            port: port.parse().ok()?,
        })
    }
}

/// Canonical file name for a backend
pub fn file_name(kind: BackendKind, id: &str) -> String {
    format!("{}{}-{}{}", FILE_PREFIX, kind, id, FILE_SUFFIX)
}

/// Inverse of [`file_name`]
pub fn parse_file_name(name: &str) -> Option<(BackendKind, String)> {
    let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    let (kind, id) = stem.split_once('-')?;
    let kind = kind.parse().ok()?;
    validate_id(id).ok()?;
    Some((kind, id.to_string()))
}

/// Ids become both a URL path segment and part of a file name
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidBackendId(id.to_string()))
    }
}

/// Hosts end up verbatim in `proxy_pass http://<host>:<port>;`
///
/// Accepts a DNS name, an IPv4 address or a bracketed IPv6 address.
pub fn validate_host(host: &str) -> Result<()> {
    let valid = match host.strip_prefix('[') {
        Some(rest) => rest.strip_suffix(']').is_some_and(|inner| {
            inner.contains(':')
                && inner
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
        }),
        None => {
            host.len() <= 253
                && host.split('.').all(|label| {
                    !label.is_empty()
                        && label.len() <= 63
                        && !label.starts_with('-')
                        && !label.ends_with('-')
                        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                })
        }
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidHostname(host.to_string()))
    }
}

fn describe(kind: BackendKind, id: &str) -> String {
    format!("{} '{}'", kind, id)
}

/// Storage for route fragments
///
/// Event handling only talks to this trait, so the on-disk layout can be
/// replaced or faked.
pub trait FragmentRepository {
    /// All registered backends, ordered by kind then id
    fn list(&self) -> Result<Vec<RouteFragment>>;

    /// Every backend that has a fragment, including fragments whose
    /// contents cannot be parsed back
    fn registered(&self) -> Result<Vec<(BackendKind, String)>> {
        Ok(self.list()?.into_iter().map(|f| (f.kind, f.id)).collect())
    }

    fn get(&self, kind: BackendKind, id: &str) -> Result<Option<RouteFragment>>;

    /// Create or overwrite the fragment for `fragment.kind`/`fragment.id`
    fn put(&self, fragment: &RouteFragment) -> Result<()>;

    /// Remove a fragment; returns false when there was nothing to remove
    fn delete(&self, kind: BackendKind, id: &str) -> Result<bool>;
}

/// Fragments stored as files in one directory
#[derive(Debug, Clone)]
pub struct FsFragmentStore {
    dir: PathBuf,
}

impl FsFragmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical path of a backend's fragment
    pub fn path_for(&self, kind: BackendKind, id: &str) -> PathBuf {
        self.dir.join(file_name(kind, id))
    }

    fn read(&self, kind: BackendKind, id: &str, path: &Path) -> Result<Option<RouteFragment>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, e)),
        };
        let fragment = RouteFragment::parse(kind, id, &content);
        if fragment.is_none() {
            warn!(path = %path.display(), "Fragment has no usable proxy_pass directive");
        }
        Ok(fragment)
    }
}

impl FragmentRepository for FsFragmentStore {
    fn list(&self) -> Result<Vec<RouteFragment>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };

        let mut fragments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some((kind, id)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            if let Some(fragment) = self.read(kind, &id, &entry.path())? {
                fragments.push(fragment);
            }
        }

        fragments.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));
        Ok(fragments)
    }

    fn registered(&self) -> Result<Vec<(BackendKind, String)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            if let Some(name) = entry.file_name().to_str().and_then(parse_file_name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn get(&self, kind: BackendKind, id: &str) -> Result<Option<RouteFragment>> {
        validate_id(id)?;
        self.read(kind, id, &self.path_for(kind, id))
    }

    fn put(&self, fragment: &RouteFragment) -> Result<()> {
        validate_id(&fragment.id)?;
        let path = self.path_for(fragment.kind, &fragment.id);
        let write_err = |message: String| Error::ConfigWrite {
            target: describe(fragment.kind, &fragment.id),
            path: path.clone(),
            message,
        };

        std::fs::create_dir_all(&self.dir).map_err(|e| write_err(e.to_string()))?;
        atomic_write(&path, &fragment.render()).map_err(|e| write_err(e.to_string()))?;

        info!(
            kind = %fragment.kind,
            id = %fragment.id,
            host = %fragment.host,
            path = %path.display(),
            "Wrote proxy fragment"
        );
        Ok(())
    }

    fn delete(&self, kind: BackendKind, id: &str) -> Result<bool> {
        validate_id(id)?;
        let path = self.path_for(kind, id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(kind = %kind, id, path = %path.display(), "Removed proxy fragment");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(kind = %kind, id, "No proxy fragment to remove");
                Ok(false)
            }
            Err(e) => Err(Error::ConfigWrite {
                target: describe(kind, id),
                path,
                message: e.to_string(),
            }),
        }
    }
}
