// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::CpufreqError;
use crate::error::Result;

/// Governor that hands frequency selection to userspace.
pub const USERSPACE_GOVERNOR: &str = "userspace";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/scxfreq.toml";

lazy_static::lazy_static! {
    pub static ref ROOT_PREFIX: String =
        env::var("SCX_SYSFS_PREFIX").unwrap_or("".to_string());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `online` and the `cpu<N>/cpufreq/` trees.
    pub sysfs_root: PathBuf,
    /// Governor written to every CPU for the lifetime of a session.
    pub governor: String,
    /// Verify each declared frequency by setting it and reading it back.
    /// When off, the declared list is trusted as is.
    pub probe: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sysfs_root: PathBuf::from(format!("{}/sys/devices/system/cpu", *ROOT_PREFIX)),
            governor: USERSPACE_GOVERNOR.to_string(),
            probe: true,
        }
    }
}

/// Load the config at `path` if given, otherwise the system config if it
/// exists, otherwise fall back to the defaults.
pub fn init_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => parse_config_file(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            parse_config_file(Path::new(DEFAULT_CONFIG_PATH))
        }
        None => Ok(Config::default()),
    }
}

pub fn parse_config_file(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|e| CpufreqError::io(path, e))?;
    parse_config_content(&content)
}

fn parse_config_content(content: &str) -> Result<Config> {
    if content.trim().is_empty() {
        return Err(CpufreqError::Config("the config file is empty".to_string()));
    }
    let config: Config =
        toml::from_str(content).map_err(|e| CpufreqError::Config(e.to_string()))?;
    if config.governor.trim().is_empty() {
        return Err(CpufreqError::Config("governor must not be empty".to_string()));
    }
    Ok(config)
}
