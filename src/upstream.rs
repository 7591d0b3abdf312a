//! `server host:port;` directives in the primary routing file
//!
//! The primary routing file (`nginx-zope.conf`) holds the upstream block for
//! the application tier. It is only read here, plus one targeted rewrite used
//! by migrations to drop an obsolete port.

use crate::error::{Error, Result};
use crate::writer::atomic_write;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// An upstream server address found in the primary routing file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Upstream servers in file order; a missing file has none
pub fn list_servers(path: &Path) -> Result<Vec<ServerAddress>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(path, e)),
    };
    Ok(content.lines().filter_map(parse_server).collect())
}

/// Drop every server line whose port is `port`
///
/// The rewrite goes through a temp file and an atomic rename. Returns false,
/// leaving the file untouched, when the file is missing or nothing matches.
pub fn remove_server_by_port(path: &Path, port: u16) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

    let mut kept = String::with_capacity(content.len());
    let mut modified = false;
    for line in content.split_inclusive('\n') {
        match parse_server(line) {
            Some(server) if server.port == port => {
                info!(path = %path.display(), server = %server, "Removing server with port");
                modified = true;
            }
            _ => kept.push_str(line),
        }
    }

    if !modified {
        return Ok(false);
    }

    atomic_write(path, &kept).map_err(|e| Error::ConfigWrite {
        target: "upstream servers".to_string(),
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(true)
}

/// Parse a `server <host>:<port>;` line; other lines yield None
fn parse_server(line: &str) -> Option<ServerAddress> {
    let rest = line.trim_start().strip_prefix("server")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    // Parameters such as `weight=2` may follow the address
    let (directive, _) = rest.split_once(';')?;
    let definition = directive.split_whitespace().next()?;

    let Some((host, port)) = definition.rsplit_once(':') else {
        warn!(line = line.trim(), "Unknown server definition");
        return None;
    };
    match port.parse() {
        Ok(port) => Some(ServerAddress {
            host: host.to_string(),
            port,
        }),
        Err(_) => {
            warn!(port, "Invalid port number");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const UPSTREAM: &str = "upstream zopes {\n    server 10.0.0.1:9090;\n    server 10.0.0.2:8080;\n}\n";

    #[test]
    fn test_parse_server_lines() {
        assert_eq!(
            parse_server("    server 10.0.0.1:9090;"),
            Some(ServerAddress {
                host: "10.0.0.1".to_string(),
                port: 9090
            })
        );
        assert_eq!(
            parse_server("server [::1]:8080 ;").map(|s| s.host),
            Some("[::1]".to_string())
        );
        assert_eq!(
            parse_server("server 127.0.0.1:9080 weight=2 max_fails=3;").map(|s| s.port),
            Some(9080)
        );
        assert_eq!(parse_server("server {"), None);
        assert_eq!(parse_server("server_name localhost;"), None);
        assert_eq!(parse_server("server localhost;"), None);
        assert_eq!(parse_server("server 10.0.0.1:http;"), None);
        assert_eq!(parse_server("# server 10.0.0.1:9090;"), None);
    }

    #[test]
    fn test_list_servers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nginx-zope.conf");
        fs::write(&path, UPSTREAM).unwrap();

        let servers = list_servers(&path).unwrap();
        let ports: Vec<_> = servers.iter().map(|s| s.port).collect();
        assert_eq!(ports, vec![9090, 8080]);
        assert_eq!(servers[0].to_string(), "10.0.0.1:9090");
    }

    #[test]
    fn test_list_servers_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(list_servers(&tmp.path().join("absent.conf")).unwrap().is_empty());
    }

    #[test]
    fn test_remove_server_by_port() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nginx-zope.conf");
        fs::write(&path, UPSTREAM).unwrap();

        assert!(remove_server_by_port(&path, 9090).unwrap());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "upstream zopes {\n    server 10.0.0.2:8080;\n}\n"
        );
        let servers = list_servers(&path).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].port, 8080);
    }

    #[test]
    fn test_remove_unknown_port_leaves_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nginx-zope.conf");
        fs::write(&path, UPSTREAM).unwrap();

        assert!(!remove_server_by_port(&path, 7777).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), UPSTREAM);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_remove_from_missing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nginx-zope.conf");
        assert!(!remove_server_by_port(&path, 9090).unwrap());
        assert!(!path.exists());
    }
}
