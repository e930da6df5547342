//! Settings file and filesystem-layout defaults for metashell, rooted at
//! `~/.metashell` unless overridden.
//!
//! Grounded on `examples/original_source/internal/config/config.go`: same
//! root-directory default and the same "missing file falls back to
//! defaults" behavior, though the on-disk format is TOML rather than YAML
//! (the format itself is out of scope; what matters is the settings surface
//! and the root-dir convention, both of which this module preserves).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "DaemonConfig::default_socket_name")]
    pub socket_name: String,
    #[serde(default = "DaemonConfig::default_plugins_dir_name")]
    pub plugins_dir_name: String,
    #[serde(default = "DaemonConfig::default_pid_file_name")]
    pub pid_file_name: String,
}

impl DaemonConfig {
    fn default_socket_name() -> String {
        "daemon.sock".to_string()
    }

    fn default_plugins_dir_name() -> String {
        "plugins".to_string()
    }

    fn default_pid_file_name() -> String {
        "daemon.pid".to_string()
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_name: Self::default_socket_name(),
            plugins_dir_name: Self::default_plugins_dir_name(),
            pid_file_name: Self::default_pid_file_name(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MetaShellConfig {
    #[serde(default = "MetaShellConfig::default_shell")]
    pub shell: String,
    #[serde(default = "MetaShellConfig::default_prompt")]
    pub prompt: String,
    #[serde(default = "MetaShellConfig::default_plugin_name_delim")]
    pub plugin_name_delim: String,
}

impl MetaShellConfig {
    fn default_shell() -> String {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
    }

    fn default_prompt() -> String {
        "> ".to_string()
    }

    fn default_plugin_name_delim() -> String {
        "::".to_string()
    }
}

impl Default for MetaShellConfig {
    fn default() -> Self {
        Self {
            shell: Self::default_shell(),
            prompt: Self::default_prompt(),
            plugin_name_delim: Self::default_plugin_name_delim(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub metashell: MetaShellConfig,
    #[serde(default = "ConfigFile::default_log_level")]
    pub log_level: String,
}

impl ConfigFile {
    fn default_log_level() -> String {
        "INFO".to_string()
    }
}

/// The resolved, filesystem-anchored configuration: the parsed (or
/// defaulted) settings plus the root directory they're relative to.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub root_dir: PathBuf,
    pub file: ConfigFile,
}

impl Config {
    pub fn socket_path(&self) -> PathBuf {
        self.root_dir.join(&self.file.daemon.socket_name)
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root_dir.join(&self.file.daemon.plugins_dir_name)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root_dir.join("logs")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_dir.join("config.toml")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root_dir.join(&self.file.daemon.pid_file_name)
    }
}

/// `~/.metashell`, matching `ParseConfig`'s `filepath.Join(homeDir, ".metashell")`.
pub fn default_root_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".metashell"))
}

/// Creates `path` (and its parents) with `0700` permissions if it doesn't
/// already exist; a no-op otherwise. Matches `EnsureDir` in the original
/// implementation.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Resolves `root_dir` (defaulting to [`default_root_dir`]), ensures it
/// exists, and loads `config.toml` from it. A missing config file is not an
/// error: it yields an all-defaults [`ConfigFile`], same as the original's
/// "file doesn't exist yet" path.
pub fn load(root_dir: Option<PathBuf>) -> Result<Config> {
    let root_dir = match root_dir {
        Some(dir) => dir,
        None => default_root_dir()?,
    };
    ensure_dir(&root_dir).with_context(|| format!("creating root dir {}", root_dir.display()))?;

    let config_path = root_dir.join("config.toml");
    let file = match std::fs::read_to_string(&config_path) {
        Ok(content) => toml::from_str(&content)
            .with_context(|| format!("parsing {}", config_path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(target: "config", path = %config_path.display(), "no config file found, using defaults");
            ConfigFile::default()
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", config_path.display())),
    };

    Ok(Config { root_dir, file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = load(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.log_level, "INFO");
        assert_eq!(cfg.file.daemon.socket_name, "daemon.sock");
        assert_eq!(cfg.file.metashell.prompt, "> ");
    }

    #[test]
    fn partial_overrides_keep_remaining_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "log_level = \"DEBUG\"\n[metashell]\nprompt = \"$ \"\n",
        )
        .unwrap();
        let cfg = load(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.log_level, "DEBUG");
        assert_eq!(cfg.file.metashell.prompt, "$ ");
        assert_eq!(cfg.file.daemon.socket_name, "daemon.sock");
        assert_eq!(cfg.file.metashell.plugin_name_delim, "::");
    }

    #[test]
    fn socket_and_plugins_dir_are_relative_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = load(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.socket_path(), tmp.path().join("daemon.sock"));
        assert_eq!(cfg.plugins_dir(), tmp.path().join("plugins"));
        assert_eq!(cfg.pid_path(), tmp.path().join("daemon.pid"));
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn malformed_config_file_is_a_reported_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "not valid = [toml").unwrap();
        assert!(load(Some(tmp.path().to_path_buf())).is_err());
    }
}
