//! Webscale - nginx configuration management for a Zope web tier
//!
//! This library keeps an nginx reverse proxy in step with its backends:
//! - Discovers the primary and secondary application server ports
//! - Renders nginx.conf from a template and the zenwebserver.conf options
//! - Writes configuration atomically, keeping the previous file as a backup
//! - Maintains one routing fragment per remote collector or hub
//! - Reloads nginx with a bounded wait and reports failures to the operator

pub mod config;
pub mod error;
pub mod events;
pub mod fragment;
pub mod generate;
pub mod migrate;
pub mod options;
pub mod reload;
pub mod template;
pub mod topology;
pub mod upstream;
pub mod writer;

pub use error::{Error, Result};
