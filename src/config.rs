use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process settings: where the managed files live and how nginx is driven
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// File locations
    #[serde(default)]
    pub paths: PathSettings,

    /// nginx control settings
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathSettings {
    /// Instance home (substituted as INSTANCE_HOME in templates)
    #[serde(default = "default_instance_home")]
    pub instance_home: PathBuf,

    /// Directory holding generated and user-editable config (default: <instance_home>/etc)
    pub config_root: Option<PathBuf>,

    /// nginx.conf template (default: <config_root>/nginx.conf.template)
    pub template: Option<PathBuf>,

    /// Primary application server config (default: <config_root>/zope.conf)
    pub zope_conf: Option<PathBuf>,

    /// Secondary instance directory (default: <config_root>/zope)
    pub zope_config_dir: Option<PathBuf>,

    /// Daemons list (default: <config_root>/daemons.txt)
    pub daemons_file: Option<PathBuf>,

    /// Directory for per-backend fragments (default: <config_root>)
    pub fragment_dir: Option<PathBuf>,

    /// Primary routing file with the upstream block (default: <config_root>/nginx-zope.conf)
    pub upstream_file: Option<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            instance_home: default_instance_home(),
            config_root: None,
            template: None,
            zope_conf: None,
            zope_config_dir: None,
            daemons_file: None,
            fragment_dir: None,
            upstream_file: None,
        }
    }
}

impl PathSettings {
    pub fn config_root(&self) -> PathBuf {
        self.config_root
            .clone()
            .unwrap_or_else(|| self.instance_home.join("etc"))
    }

    pub fn template(&self) -> PathBuf {
        self.template
            .clone()
            .unwrap_or_else(|| self.config_root().join("nginx.conf.template"))
    }

    pub fn options_file(&self) -> PathBuf {
        self.config_root().join("zenwebserver.conf")
    }

    pub fn output(&self) -> PathBuf {
        self.config_root().join("nginx.conf")
    }

    pub fn zope_conf(&self) -> PathBuf {
        self.zope_conf
            .clone()
            .unwrap_or_else(|| self.config_root().join("zope.conf"))
    }

    pub fn zope_config_dir(&self) -> PathBuf {
        self.zope_config_dir
            .clone()
            .unwrap_or_else(|| self.config_root().join("zope"))
    }

    pub fn daemons_file(&self) -> PathBuf {
        self.daemons_file
            .clone()
            .unwrap_or_else(|| self.config_root().join("daemons.txt"))
    }

    pub fn fragment_dir(&self) -> PathBuf {
        self.fragment_dir.clone().unwrap_or_else(|| self.config_root())
    }

    pub fn upstream_file(&self) -> PathBuf {
        self.upstream_file
            .clone()
            .unwrap_or_else(|| self.config_root().join("nginx-zope.conf"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// nginx binary used for the default reload command (default: "nginx" on PATH)
    #[serde(default = "default_nginx_binary")]
    pub nginx_binary: String,

    /// Reload command line (default: "<nginx_binary> -s reload -c <config_root>/nginx.conf")
    pub reload_command: Option<String>,

    /// Optional verify command line run before every reload (e.g. "nginx -t -c ...")
    pub verify_command: Option<String>,

    /// Maximum time to wait for a verify or reload command
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,

    /// Issue a best-effort reload after a backend fragment is removed
    #[serde(default = "default_reload_on_remove")]
    pub reload_on_remove: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            nginx_binary: default_nginx_binary(),
            reload_command: None,
            verify_command: None,
            reload_timeout_secs: default_reload_timeout(),
            reload_on_remove: default_reload_on_remove(),
        }
    }
}

impl ProxySettings {
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }
}

fn default_instance_home() -> PathBuf {
    PathBuf::from("/opt/zenoss")
}

fn default_nginx_binary() -> String {
    "nginx".to_string()
}

fn default_reload_timeout() -> u64 {
    30
}

fn default_reload_on_remove() -> bool {
    true
}

impl Settings {
    /// Settings rooted at `instance_home` with everything else defaulted
    pub fn with_instance_home(instance_home: impl Into<PathBuf>) -> Self {
        Self {
            paths: PathSettings {
                instance_home: instance_home.into(),
                ..PathSettings::default()
            },
            proxy: ProxySettings::default(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| Error::Settings(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolved reload command line, split into program and arguments
    pub fn reload_command(&self) -> Result<Vec<String>> {
        match &self.proxy.reload_command {
            Some(line) => split_command("reload_command", line),
            None => Ok(vec![
                self.proxy.nginx_binary.clone(),
                "-s".to_string(),
                "reload".to_string(),
                "-c".to_string(),
                self.paths.output().display().to_string(),
            ]),
        }
    }

    /// Resolved verify command line, if one is configured
    pub fn verify_command(&self) -> Result<Option<Vec<String>>> {
        self.proxy
            .verify_command
            .as_deref()
            .map(|line| split_command("verify_command", line))
            .transpose()
    }

    /// Validate all settings, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.reload_command() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.verify_command() {
            errors.push(e.to_string());
        }
        if self.proxy.reload_timeout_secs == 0 {
            errors.push("'reload_timeout_secs' must be greater than 0".to_string());
        }
        if self.proxy.nginx_binary.trim().is_empty() {
            errors.push("'nginx_binary' must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(Error::Settings(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}

fn split_command(field: &str, line: &str) -> Result<Vec<String>> {
    let words = shell_words::split(line)
        .map_err(|e| Error::Settings(format!("'{}' is not a valid command line: {}", field, e)))?;
    if words.is_empty() {
        return Err(Error::Settings(format!("'{}' must not be empty", field)));
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings() {
        let toml = r#"
[paths]
instance_home = "/srv/zenoss"
template = "/srv/templates/nginx.conf.template"

[proxy]
nginx_binary = "/srv/zenoss/bin/nginx"
verify_command = "/srv/zenoss/bin/nginx -t -c '/srv/zenoss/etc/nginx.conf'"
reload_timeout_secs = 10
reload_on_remove = false
"#;

        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(settings.paths.config_root(), PathBuf::from("/srv/zenoss/etc"));
        assert_eq!(
            settings.paths.template(),
            PathBuf::from("/srv/templates/nginx.conf.template")
        );
        assert_eq!(settings.proxy.reload_timeout(), Duration::from_secs(10));
        assert!(!settings.proxy.reload_on_remove);
        assert_eq!(
            settings.verify_command().unwrap().unwrap(),
            vec!["/srv/zenoss/bin/nginx", "-t", "-c", "/srv/zenoss/etc/nginx.conf"]
        );
    }

    #[test]
    fn test_default_paths_follow_instance_home() {
        let settings = Settings::with_instance_home("/opt/zen");
        let paths = &settings.paths;
        assert_eq!(paths.options_file(), PathBuf::from("/opt/zen/etc/zenwebserver.conf"));
        assert_eq!(paths.output(), PathBuf::from("/opt/zen/etc/nginx.conf"));
        assert_eq!(paths.zope_conf(), PathBuf::from("/opt/zen/etc/zope.conf"));
        assert_eq!(paths.zope_config_dir(), PathBuf::from("/opt/zen/etc/zope"));
        assert_eq!(paths.daemons_file(), PathBuf::from("/opt/zen/etc/daemons.txt"));
        assert_eq!(paths.fragment_dir(), PathBuf::from("/opt/zen/etc"));
        assert_eq!(paths.upstream_file(), PathBuf::from("/opt/zen/etc/nginx-zope.conf"));
    }

    #[test]
    fn test_default_proxy_settings() {
        let settings = Settings::with_instance_home("/opt/zen");
        assert_eq!(settings.proxy.reload_timeout_secs, 30);
        assert!(settings.proxy.reload_on_remove);
        assert_eq!(
            settings.reload_command().unwrap(),
            vec!["nginx", "-s", "reload", "-c", "/opt/zen/etc/nginx.conf"]
        );
        assert!(settings.verify_command().unwrap().is_none());
    }

    #[test]
    fn test_empty_settings_use_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.paths.instance_home, PathBuf::from("/opt/zenoss"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_all_errors() {
        let toml = r#"
[proxy]
reload_command = "nginx -s 'reload"
verify_command = ""
reload_timeout_secs = 0
"#;
        let settings: Settings = toml::from_str(toml).unwrap();
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("'reload_command' is not a valid command line"));
        assert!(err.contains("'verify_command' must not be empty"));
        assert!(err.contains("'reload_timeout_secs' must be greater than 0"));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("webscale.toml");
        std::fs::write(&path, "[paths]\ninstance_home = \"/data/zenoss\"\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.paths.output(), PathBuf::from("/data/zenoss/etc/nginx.conf"));
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = Settings::load(tmp.path().join("absent.toml"));
        assert!(matches!(result, Err(Error::Io { .. })));
    }
}
