//! Optional file-based configuration.
//!
//! CLI arguments (with env-var fallbacks) always win; the config file fills
//! the gaps. The file is plain JSON so it round-trips with the same parser
//! as everything else in the tree.

use crate::error::SyncError;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// Extractor enable/disable/order settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractorSettings {
    /// Extractor names to leave out of the active set.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Explicit run order; unlisted extractors follow by (priority, name).
    #[serde(default)]
    pub order: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    pub url: Option<String>,
    pub auth_type: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub verify_tls: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchSection {
    /// Poll interval in seconds.
    pub poll_interval: Option<u64>,
    /// Debounce interval in seconds.
    pub debounce: Option<u64>,
}

/// Top-level config file shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub watch: WatchSection,
    #[serde(default)]
    pub extractors: ExtractorSettings,
}

/// Load the config file if `path` is given and exists. A missing explicit
/// path is a configuration error; no path at all means defaults.
pub fn load_config(path: Option<&Path>) -> Result<FileConfig, SyncError> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    if !path.exists() {
        return Err(SyncError::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }
    let text = std::fs::read_to_string(path)?;
    let config: FileConfig = serde_json::from_str(&text)
        .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/flowsync.json"))).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn parses_partial_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server": {{"url": "http://example:1880"}}, "extractors": {{"disabled": ["template"]}}}}"#
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.server.url.as_deref(), Some("http://example:1880"));
        assert_eq!(config.extractors.disabled, vec!["template"]);
        assert!(config.watch.poll_interval.is_none());
    }
}
