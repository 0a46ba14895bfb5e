use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;

use recipetuner_core::paths::{StorageRoot, StorePath};

const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;

/// Persistent documents root: the platform data directory, never a cache
/// directory the OS may purge.
pub struct PlatformRoot;

impl StorageRoot for PlatformRoot {
    fn documents_root(&self) -> Option<PathBuf> {
        ProjectDirs::from("", "", "recipetuner").map(|dirs| dirs.data_dir().to_path_buf())
    }
}

pub struct RemoteConfig {
    /// Base URL of the REST endpoint, e.g. `https://example.supabase.co/rest/v1`.
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
}

pub struct Config {
    pub data_dir: PathBuf,
    pub remote: Option<RemoteConfig>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let data_dir = PlatformRoot
            .documents_root()
            .context("Could not determine home directory")?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let remote = remote_from_env(
            std::env::var("RECIPETUNER_REMOTE_URL").ok(),
            std::env::var("RECIPETUNER_REMOTE_KEY").ok(),
            std::env::var("RECIPETUNER_REMOTE_TIMEOUT_SECS").ok(),
        )?;

        Ok(Config { data_dir, remote })
    }

    /// Store location, resolved from the platform root on first open.
    pub fn store_path() -> StorePath {
        StorePath::new(Arc::new(PlatformRoot))
    }
}

fn remote_from_env(
    url: Option<String>,
    key: Option<String>,
    timeout: Option<String>,
) -> Result<Option<RemoteConfig>> {
    let url = url.map(|u| u.trim().trim_end_matches('/').to_string());
    let key = key.map(|k| k.trim().to_string());
    let (url, api_key) = match (url, key) {
        (None, None) => return Ok(None),
        (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => (url, key),
        _ => bail!("RECIPETUNER_REMOTE_URL and RECIPETUNER_REMOTE_KEY must be set together"),
    };
    if !url.starts_with("http://") && !url.starts_with("https://") {
        bail!("Invalid RECIPETUNER_REMOTE_URL '{url}'. Use an http(s) URL");
    }

    let secs = match timeout {
        None => DEFAULT_REMOTE_TIMEOUT_SECS,
        Some(s) => s.trim().parse::<u64>().ok().filter(|&n| n > 0).with_context(|| {
            format!("Invalid RECIPETUNER_REMOTE_TIMEOUT_SECS '{s}'. Use a positive number")
        })?,
    };

    Ok(Some(RemoteConfig {
        url,
        api_key,
        timeout: Duration::from_secs(secs),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn test_remote_not_configured() {
        assert!(remote_from_env(None, None, None).unwrap().is_none());
    }

    #[test]
    fn test_remote_defaults() {
        let remote = remote_from_env(some("https://db.example.com/rest/v1/"), some(" key "), None)
            .unwrap()
            .unwrap();
        assert_eq!(remote.url, "https://db.example.com/rest/v1");
        assert_eq!(remote.api_key, "key");
        assert_eq!(remote.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_remote_timeout_override() {
        let remote = remote_from_env(some("http://localhost:3000"), some("k"), some("3"))
            .unwrap()
            .unwrap();
        assert_eq!(remote.timeout, Duration::from_secs(3));
        assert!(remote_from_env(some("http://localhost:3000"), some("k"), some("0")).is_err());
        assert!(remote_from_env(some("http://localhost:3000"), some("k"), some("soon")).is_err());
    }

    #[test]
    fn test_remote_half_configured() {
        assert!(remote_from_env(some("https://db.example.com"), None, None).is_err());
        assert!(remote_from_env(None, some("k"), None).is_err());
        assert!(remote_from_env(some("db.example.com"), some("k"), None).is_err());
    }
}
