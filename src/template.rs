//! Rendering of the global nginx configuration
//!
//! Templates use `{NAME}` placeholders and `{{` / `}}` for literal braces, so
//! nginx blocks in a template are written with doubled braces. Every
//! placeholder must resolve against the [`SubstitutionTable`]; a missing key
//! is an error rather than a literal token in the output.
//!
//! The table is built in three layers: defaults, then the options file, then
//! the TLS-derived values. The derived blocks are themselves small templates
//! rendered against the table before they are merged, so the final render is a
//! single substitution pass.

use crate::error::{Error, Result};
use crate::options::{self, Options};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub const INSTANCE_HOME: &str = "INSTANCE_HOME";
pub const CONFIG_ROOT: &str = "CONFIG_ROOT";
pub const FRAGMENT_DIR: &str = "FRAGMENT_DIR";
pub const HTTP_PORT: &str = "HTTP_PORT";
pub const SSL_PORT: &str = "SSL_PORT";
pub const PORT: &str = "PORT";
pub const PROTOCOL: &str = "PROTOCOL";
pub const SSL_CERT: &str = "SSL_CERT";
pub const SSL_KEY: &str = "SSL_KEY";
pub const SSL_USER: &str = "SSL_USER";
pub const FILE_BEGIN: &str = "FILE_BEGIN";
pub const PRE_SERVERBLOCK: &str = "PRE_SERVERBLOCK";
pub const SSL_CONFIG: &str = "SSL_CONFIG";
pub const SSL_LISTEN: &str = "SSL_LISTEN";

const PLAIN_PROTOCOL: &str = "http";
const SECURE_PROTOCOL: &str = "HTTPS";
const DEFAULT_SSL_USER: &str = "zenoss zenoss";

const FILE_BEGIN_TEMPLATE: &str = "
#####################################################################################
#  SSL Configuration for zenwebserver
#####################################################################################
user {SSL_USER};
";

const PRE_SERVERBLOCK_TEMPLATE: &str = "
    server {{
        listen 80;
        rewrite ^(.*)$ https://$host:{SSL_PORT}$1 break;
    }}

    server {{
        listen {HTTP_PORT};
        rewrite ^(.*)$ https://$host:{SSL_PORT}$1 break;
    }}
";

const SSL_CONFIG_TEMPLATE: &str = "
        # The names/paths of your certificate files
        {SSL_CERT};
        {SSL_KEY};
        ssl_protocols TLSv1.2 TLSv1.3;
        ssl_ciphers HIGH:!aNULL:!MD5;
        ssl_prefer_server_ciphers on;
        ssl_session_cache shared:SSL:10m;
        ssl_session_timeout 10m;
";

/// Placeholder name to replacement text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutionTable {
    values: BTreeMap<String, String>,
}

impl SubstitutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for a deployment rooted at `instance_home`
    ///
    /// `fragment_dir` is where backend fragments are written; the template
    /// includes `proxy-*.conf` from there.
    pub fn defaults(instance_home: &Path, config_root: &Path, fragment_dir: &Path) -> Self {
        let mut table = Self::new();
        table.insert(INSTANCE_HOME, instance_home.display().to_string());
        table.insert(CONFIG_ROOT, config_root.display().to_string());
        table.insert(FRAGMENT_DIR, fragment_dir.display().to_string());
        table.insert(SSL_PORT, options::DEFAULT_SSL_PORT.to_string());
        table.insert(PORT, options::DEFAULT_HTTP_PORT.to_string());
        table.insert(HTTP_PORT, options::DEFAULT_HTTP_PORT.to_string());
        table.insert(PROTOCOL, PLAIN_PROTOCOL);
        table.insert(
            SSL_CERT,
            format!("ssl_certificate {}", config_root.join("ssl").join("zenoss.crt").display()),
        );
        table.insert(
            SSL_KEY,
            format!("ssl_certificate_key {}", config_root.join("ssl").join("zenoss.key").display()),
        );
        table.insert(SSL_USER, DEFAULT_SSL_USER);
        table.insert(FILE_BEGIN, "");
        table.insert(PRE_SERVERBLOCK, "");
        table.insert(SSL_CONFIG, "");
        table.insert(SSL_LISTEN, "");
        table
    }

    /// Full table for `options`: defaults, then option values, then the
    /// TLS-derived values
    pub fn from_options(
        options: &Options,
        instance_home: &Path,
        config_root: &Path,
        fragment_dir: &Path,
    ) -> Result<Self> {
        let mut table = Self::defaults(instance_home, config_root, fragment_dir);

        for (key, value) in options.iter() {
            match key {
                options::USE_SSL => {}
                options::HTTP_PORT => {
                    table.insert(HTTP_PORT, value);
                    table.insert(PORT, value);
                }
                options::SSL_PORT => table.insert(SSL_PORT, value),
                options::SSL_CERT => table.insert(SSL_CERT, directive("ssl_certificate", value)),
                options::SSL_KEY => table.insert(SSL_KEY, directive("ssl_certificate_key", value)),
                options::SSL_USER => table.insert(SSL_USER, value),
                other => table.insert(other, value),
            }
        }

        let derived = TlsValues::derive(options.use_ssl(), &table)?;
        table.merge(derived.into_table());
        Ok(table)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Overwrite same-named entries with those of `other`
    pub fn merge(&mut self, other: SubstitutionTable) {
        self.values.extend(other.values);
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SubstitutionTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Values that depend on whether TLS is enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsValues {
    pub protocol: String,
    pub port: String,
    pub file_begin: String,
    pub pre_server_block: String,
    pub ssl_config: String,
    pub ssl_listen: String,
}

impl TlsValues {
    /// Derive against `base`, which must already hold the port, cert, key and
    /// user entries
    pub fn derive(use_ssl: bool, base: &SubstitutionTable) -> Result<Self> {
        if !use_ssl {
            let http_port = lookup(base, HTTP_PORT)?;
            return Ok(Self {
                protocol: PLAIN_PROTOCOL.to_string(),
                port: http_port.to_string(),
                file_begin: String::new(),
                pre_server_block: String::new(),
                ssl_config: String::new(),
                ssl_listen: String::new(),
            });
        }

        Ok(Self {
            protocol: SECURE_PROTOCOL.to_string(),
            port: lookup(base, SSL_PORT)?.to_string(),
            file_begin: substitute(FILE_BEGIN_TEMPLATE, base)?,
            pre_server_block: substitute(PRE_SERVERBLOCK_TEMPLATE, base)?,
            ssl_config: substitute(SSL_CONFIG_TEMPLATE, base)?,
            ssl_listen: " ssl".to_string(),
        })
    }

    fn into_table(self) -> SubstitutionTable {
        SubstitutionTable::from_iter([
            (PROTOCOL, self.protocol),
            (PORT, self.port),
            (FILE_BEGIN, self.file_begin),
            (PRE_SERVERBLOCK, self.pre_server_block),
            (SSL_CONFIG, self.ssl_config),
            (SSL_LISTEN, self.ssl_listen),
        ])
    }
}

/// Generated configuration text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    /// Generated-file banner; may carry a timestamp
    pub header: String,
    /// Substituted template; deterministic for a given template and table
    pub body: String,
}

impl fmt::Display for RenderedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header)?;
        f.write_str(&self.body)
    }
}

/// Render `template` against `table`
///
/// A first line starting with `#` is a template-authoring note and is dropped.
pub fn render(template: &str, table: &SubstitutionTable) -> Result<RenderedConfig> {
    let body = substitute(strip_leading_comment(template), table)?;
    Ok(RenderedConfig {
        header: banner(table),
        body,
    })
}

fn banner(table: &SubstitutionTable) -> String {
    let options_file = match table.get(CONFIG_ROOT) {
        Some(root) => format!("{}/zenwebserver.conf", root),
        None => "zenwebserver.conf".to_string(),
    };
    format!(
        "\n#####################################################################################\n\
         # GENERATED FILE, DO NOT MODIFY. USE {} to set options\n\
         # Generated {}\n\
         #####################################################################################\n",
        options_file,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}

fn strip_leading_comment(template: &str) -> &str {
    if !template.starts_with('#') {
        return template;
    }
    match template.find('\n') {
        Some(end) => &template[end + 1..],
        None => "",
    }
}

/// One substitution pass of `template` against `table`
pub fn substitute(template: &str, table: &SubstitutionTable) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        let consumed = if tail.starts_with("{{") {
            out.push('{');
            2
        } else if tail.starts_with("}}") {
            out.push('}');
            2
        } else if tail.starts_with('}') {
            return Err(Error::MalformedTemplate {
                offset: offset + pos,
                message: "single '}' (use '}}' for a literal brace)".to_string(),
            });
        } else {
            let end = tail[1..].find('}').ok_or_else(|| Error::MalformedTemplate {
                offset: offset + pos,
                message: "unmatched '{' (use '{{' for a literal brace)".to_string(),
            })?;
            let name = &tail[1..1 + end];
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::MalformedTemplate {
                    offset: offset + pos,
                    message: format!("invalid placeholder '{{{}}}'", name),
                });
            }
            out.push_str(lookup(table, name)?);
            end + 2
        };

        rest = &tail[consumed..];
        offset += pos + consumed;
    }

    out.push_str(rest);
    Ok(out)
}

fn lookup<'a>(table: &'a SubstitutionTable, name: &str) -> Result<&'a str> {
    table.get(name).ok_or_else(|| Error::UnresolvedPlaceholder {
        name: name.to_string(),
    })
}

/// Accept either a bare path or a complete directive
fn directive(name: &str, value: &str) -> String {
    let value = value.trim().trim_end_matches(';');
    if value.split_whitespace().next() == Some(name) {
        value.to_string()
    } else {
        format!("{} {}", name, value)
    }
}
