//! File configuration for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use fdroid_repo::download::ProxyConfig;

/// TOML-backed file configuration. Every field is optional; CLI flags win.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Repository database location.
    pub db_path: Option<PathBuf>,
    /// Where entry and index downloads are staged.
    pub temp_dir: Option<PathBuf>,
    /// `http://host:port` or `socks5://host:port`.
    pub proxy: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub onion_connect_timeout_secs: Option<u64>,
    /// Use the long Tor timeouts everywhere.
    pub high_timeouts: Option<bool>,
    /// Locale for repository and app texts, e.g. `de-DE`.
    pub locale: Option<String>,
    pub disallow_unknown_sources: Option<bool>,
    /// `random` or `parameters`.
    pub mirror_strategy: Option<String>,
    pub prefer_foreign_mirrors: Option<bool>,
    /// ISO 3166 country code of the current location.
    pub current_location: Option<String>,
}

impl FileConfig {
    /// Validates config values against runtime constraints.
    pub fn validate(&self) -> Result<()> {
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        validate_timeout_secs(
            "onion_connect_timeout_secs",
            self.onion_connect_timeout_secs,
        )?;

        if let Some(proxy) = &self.proxy {
            proxy
                .parse::<ProxyConfig>()
                .with_context(|| format!("Invalid config value for `proxy`: {proxy}"))?;
        }

        if let Some(strategy) = &self.mirror_strategy
            && MirrorStrategy::parse(strategy).is_none()
        {
            bail!(
                "Invalid config value for `mirror_strategy`: {strategy}. Expected `random` or `parameters`"
            );
        }

        if let Some(location) = &self.current_location
            && !(location.len() == 2 && location.chars().all(|c| c.is_ascii_alphabetic()))
        {
            bail!(
                "Invalid config value for `current_location`: {location}. Expected a two-letter country code"
            );
        }

        Ok(())
    }

    pub fn mirror_strategy(&self) -> MirrorStrategy {
        self.mirror_strategy
            .as_deref()
            .and_then(MirrorStrategy::parse)
            .unwrap_or_default()
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// How mirrors are ordered for each download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MirrorStrategy {
    #[default]
    Random,
    Parameters,
}

impl MirrorStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "random" => Some(Self::Random),
            "parameters" => Some(Self::Parameters),
            _ => None,
        }
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/fdroid-repo/config.toml`
/// 2. `$HOME/.config/fdroid-repo/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("fdroid-repo")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("fdroid-repo")
            .join("config.toml"),
    )
}

/// Default database location next to the config directory.
#[must_use]
pub fn resolve_default_db_path() -> PathBuf {
    if let Some(data_home) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join("fdroid-repo").join("repos.db");
    }
    env_var_non_empty_os("HOME").map_or_else(
        || PathBuf::from("repos.db"),
        |home| {
            PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("fdroid-repo")
                .join("repos.db")
        },
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from `explicit` or the default path. A missing default file
/// yields the default config; a missing explicit file is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let (path, required) = match explicit {
        Some(path) => (Some(path.to_path_buf()), true),
        None => (resolve_default_config_path(), false),
    };
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    if !required && !path.exists() {
        return Ok(FileConfig::default());
    }
    load_file_config(&path)
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    let config = parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
    Ok(config)
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}
