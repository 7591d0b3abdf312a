//! Version migrations of managed configuration

use crate::error::Result;
use crate::topology::TopologySource;
use crate::upstream::remove_server_by_port;
use std::path::Path;
use tracing::info;

/// Port that older releases routed to without any instance behind it
pub const UNUSED_PORT: u16 = 9090;

/// Drop `port` from the primary routing file unless a secondary instance
/// really listens on it
///
/// Returns whether the routing file changed.
pub fn remove_unused_port(topology: &TopologySource, upstream_file: &Path, port: u16) -> Result<bool> {
    if topology.discover().contains(port) {
        info!(port, "Port is used by a configured instance; keeping it");
        return Ok(false);
    }
    let removed = remove_server_by_port(upstream_file, port)?;
    if removed {
        info!(port, path = %upstream_file.display(), "Removed unused upstream port");
    }
    Ok(removed)
}
