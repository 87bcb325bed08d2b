// vtmctl - CLI for the Virtual Traffic Manager REST API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Context, Result};
use dirs::home_dir;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_URL: &str = "http://localhost:9070/";
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "default";
pub const DEFAULT_API_VERSION: &str = "3.8";

const FILE_NAME: &str = ".vtmctl.yaml";

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_tls: Option<bool>,
}

impl Config {
    pub fn masked(&self) -> Config {
        let mut masked = self.clone();
        if masked.password.is_some() {
            masked.password = Some("*****".into());
        }
        masked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    User,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not locate the home directory of the current user")]
    MissingHomeDir,
    #[error("config file {0:?} does not exist")]
    MissingFile(PathBuf),
    #[error("invalid API URL `{0}`; expected something like http://localhost:9070/")]
    InvalidUrl(String),
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_version: Option<String>,
    pub verify_tls: bool,
}

#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub api_version: String,
    pub verify_tls: bool,
}

pub fn config_path(scope: Scope, cwd: &Path) -> Result<PathBuf> {
    match scope {
        Scope::Local => Ok(cwd.join(FILE_NAME)),
        Scope::User => {
            if let Ok(custom) = env::var("VTMCTL_CONFIG_DIR") {
                return Ok(PathBuf::from(custom).join("config.yaml"));
            }
            let home = home_dir().ok_or(ConfigError::MissingHomeDir)?;
            Ok(home.join(FILE_NAME))
        }
    }
}

/// Merged file configuration. An explicit file replaces the user and local
/// scopes entirely.
pub fn load(cwd: &Path, explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return read_if_exists(path)?.ok_or_else(|| ConfigError::MissingFile(path.into()).into());
    }
    let user = read_if_exists(&config_path(Scope::User, cwd)?)?.unwrap_or_default();
    let local = read_if_exists(&config_path(Scope::Local, cwd)?)?.unwrap_or_default();
    Ok(merge(user, local))
}

pub fn load_scope(scope: Scope, cwd: &Path) -> Result<Config> {
    Ok(read_if_exists(&config_path(scope, cwd)?)?.unwrap_or_default())
}

pub fn save(scope: Scope, config: &Config, cwd: &Path) -> Result<PathBuf> {
    let path = config_path(scope, cwd)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
    }
    let serialized = serde_yaml::to_string(config).context("serializing config")?;
    fs::write(&path, serialized).with_context(|| format!("writing {:?}", path))?;
    Ok(path)
}

pub fn resolve(cwd: &Path, overrides: Overrides) -> Result<EffectiveConfig> {
    let merged = load(cwd, overrides.config_file.as_deref())?;

    let url = overrides
        .url
        .or(merged.url)
        .map(|u| u.trim().to_string())
        .unwrap_or_else(|| DEFAULT_URL.to_string());
    if Url::parse(&url).is_err() {
        return Err(ConfigError::InvalidUrl(url).into());
    }

    Ok(EffectiveConfig {
        url,
        username: overrides
            .username
            .or(merged.username)
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
        password: overrides
            .password
            .or(merged.password)
            .unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
        api_version: overrides
            .api_version
            .or(merged.api_version)
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        verify_tls: overrides.verify_tls || merged.verify_tls.unwrap_or(false),
    })
}

fn read_if_exists(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let config = serde_yaml::from_str(&contents).with_context(|| format!("parsing {:?}", path))?;
    info!("Using config file: {}", path.display());
    Ok(Some(config))
}

fn merge(user: Config, local: Config) -> Config {
    Config {
        url: local.url.or(user.url),
        username: local.username.or(user.username),
        password: local.password.or(user.password),
        api_version: local.api_version.or(user.api_version),
        verify_tls: local.verify_tls.or(user.verify_tls),
    }
}
