//! Where uploaded photos go.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_FOLDER: &str = "images";
pub const DEFAULT_ENDPOINT: &str = "https://firebasestorage.googleapis.com";
pub const GOOGLE_SERVICES_FILE: &str = "google-services.json";

/// Photos always land in [`DEFAULT_FOLDER`]; only the bucket and the
/// endpoint are configurable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// e.g. `my-project.appspot.com`; empty when nothing configured one.
    pub bucket: String,
    pub endpoint: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            bucket: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

/// Where [`StorageConfig::load`] found the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Environment,
    BuildEnvironment,
    GoogleServices(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Environment => write!(f, "process environment"),
            ConfigSource::BuildEnvironment => write!(f, "build environment"),
            ConfigSource::GoogleServices(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Deserialize)]
struct GoogleServices {
    project_info: ProjectInfo,
}

#[derive(Deserialize)]
struct ProjectInfo {
    #[serde(default)]
    storage_bucket: Option<String>,
}

impl StorageConfig {
    /// Resolves the bucket from, in order: the process environment, the
    /// environment at build time, `google-services.json` in `search_dir`.
    pub fn load(search_dir: &Path) -> Result<(Self, ConfigSource)> {
        if let Some(config) = Self::from_vars(|key| std::env::var(key).ok()) {
            return Ok((config, ConfigSource::Environment));
        }
        if let Some(config) = Self::from_vars(build_time_var) {
            return Ok((config, ConfigSource::BuildEnvironment));
        }
        let path = search_dir.join(GOOGLE_SERVICES_FILE);
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("no storage bucket configured and {} unreadable", path.display()))?;
        Ok((Self::from_google_services(&json)?, ConfigSource::GoogleServices(path)))
    }

    /// `FIREBASE_STORAGE_BUCKET` is required, the endpoint falls back to
    /// Firebase's.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let bucket = lookup("FIREBASE_STORAGE_BUCKET").filter(|b| !b.trim().is_empty())?;
        Some(StorageConfig {
            bucket: bucket.trim().to_string(),
            endpoint: lookup("FIREBASE_STORAGE_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        })
    }

    pub fn from_google_services(json: &str) -> Result<Self> {
        let services: GoogleServices =
            serde_json::from_str(json).context("malformed google-services.json")?;
        let bucket = services
            .project_info
            .storage_bucket
            .filter(|b| !b.is_empty())
            .ok_or_else(|| anyhow!("google-services.json has no project_info.storage_bucket"))?;
        Ok(StorageConfig {
            bucket,
            ..StorageConfig::default()
        })
    }
}

fn build_time_var(key: &str) -> Option<String> {
    match key {
        "FIREBASE_STORAGE_BUCKET" => option_env!("FIREBASE_STORAGE_BUCKET"),
        "FIREBASE_STORAGE_ENDPOINT" => option_env!("FIREBASE_STORAGE_ENDPOINT"),
        _ => None,
    }
    .map(str::to_string)
}
