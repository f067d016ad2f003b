use crate::models::DownloadRequest;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const MAX_MAX_CONCURRENCY: usize = 16;

/// Read-only engine settings handed to the `EngineContext` at start-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub socket_timeout_secs: u64,
    pub retries: u32,
    pub fragment_retries: u32,
    pub file_access_retries: u32,
    pub retry_sleep_secs: u64,
    pub geo_bypass_country: String,
    pub force_ipv4: bool,
    pub default_resolution: String,
    pub default_output_format: String,
    pub default_audio_format: String,
    pub default_audio_bitrate: String,
    /// Backoff before retrying after the destination file was locked.
    pub rename_backoff_ms: u64,
    /// Also surface the transient `Connecting` / `Processing` states.
    pub emit_narrative_states: bool,
    pub ffmpeg_location: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            socket_timeout_secs: 10,
            retries: 10,
            fragment_retries: 10,
            file_access_retries: 5,
            retry_sleep_secs: 2,
            geo_bypass_country: "US".to_string(),
            force_ipv4: true,
            default_resolution: "720p".to_string(),
            default_output_format: "mp4".to_string(),
            default_audio_format: "mp3".to_string(),
            default_audio_bitrate: "320".to_string(),
            rename_backoff_ms: 2_000,
            emit_narrative_states: false,
            ffmpeg_location: None,
        }
    }
}

impl EngineConfig {
    pub fn clamped_concurrency(&self) -> usize {
        clamp_concurrency(self.max_concurrency)
    }

    /// A video request filled in from the configured resolution/format policy.
    pub fn default_request(&self, url: impl Into<String>, destination: impl Into<PathBuf>) -> DownloadRequest {
        DownloadRequest {
            audio_format: Some(self.default_audio_format.clone()),
            ..DownloadRequest::video(url, self.default_resolution.clone(), destination)
                .with_output_format(self.default_output_format.clone())
                .with_audio_bitrate(self.default_audio_bitrate.clone())
        }
    }
}

pub fn clamp_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_MAX_CONCURRENCY)
}

pub fn load_engine_config(paths: &AppPaths) -> Result<EngineConfig> {
    let path = paths.engine_config_path();
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: EngineConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::ConfigInvalid(format!(
            "failed to parse engine config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_engine_config(paths: &AppPaths, config: &EngineConfig) -> Result<()> {
    let path = paths.engine_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
