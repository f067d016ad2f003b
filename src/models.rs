use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "No Title";
pub const DEFAULT_CHANNEL: &str = "Unknown Channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque caller-side correlation token (e.g. a table row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowToken(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    /// Target height label such as "720p". Ignored for audio-only requests.
    pub resolution: String,
    pub audio_only: bool,
    pub destination: PathBuf,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub playlist: bool,
    #[serde(default)]
    pub subtitles: bool,
    pub output_format: String,
    #[serde(default)]
    pub audio_format: Option<String>,
    pub audio_bitrate: String,
}

impl DownloadRequest {
    pub fn video(url: impl Into<String>, resolution: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            resolution: resolution.into(),
            audio_only: false,
            destination: destination.into(),
            proxy: None,
            playlist: false,
            subtitles: false,
            output_format: "mp4".to_string(),
            audio_format: None,
            audio_bitrate: "320".to_string(),
        }
    }

    pub fn audio(url: impl Into<String>, audio_format: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            audio_only: true,
            audio_format: Some(audio_format.into()),
            ..Self::video(url, "720p", destination)
        }
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_playlist(mut self, playlist: bool) -> Self {
        self.playlist = playlist;
        self
    }

    pub fn with_subtitles(mut self, subtitles: bool) -> Self {
        self.subtitles = subtitles;
        self
    }

    pub fn with_output_format(mut self, output_format: impl Into<String>) -> Self {
        self.output_format = output_format.into();
        self
    }

    pub fn with_audio_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.audio_bitrate = bitrate.into();
        self
    }

    /// Requested audio format, lowercased, defaulting to mp3.
    pub fn effective_audio_format(&self) -> String {
        self.audio_format
            .as_deref()
            .map(|f| f.trim().to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| "mp3".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Connecting,
    FetchingInfo,
    Downloading,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Connecting => "connecting",
            DownloadStatus::FetchingInfo => "fetching_info",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Processing => "processing",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DownloadStatus::Pending),
            "connecting" => Some(DownloadStatus::Connecting),
            "fetching_info" => Some(DownloadStatus::FetchingInfo),
            "downloading" => Some(DownloadStatus::Downloading),
            "processing" => Some(DownloadStatus::Processing),
            "completed" => Some(DownloadStatus::Completed),
            "failed" => Some(DownloadStatus::Failed),
            "cancelled" => Some(DownloadStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// States during which the task holds an engine slot.
    pub fn is_engine_active(&self) -> bool {
        matches!(
            self,
            DownloadStatus::FetchingInfo | DownloadStatus::Downloading | DownloadStatus::Processing
        )
    }

    /// Forward edges of the lifecycle. `Downloading -> Downloading` is the
    /// retry edge and is only taken through `DownloadTask::begin_retry`.
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match (self, next) {
            (Pending, Connecting | FetchingInfo) => true,
            (Connecting, FetchingInfo) => true,
            (FetchingInfo, Downloading) => true,
            (Downloading, Processing) => true,
            (Downloading | Processing, Completed) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bps: f64,
    pub eta_secs: u64,
    pub percentage: f64,
}

impl DownloadProgress {
    pub fn new(downloaded_bytes: u64, total_bytes: Option<u64>, speed_bps: f64, eta_secs: u64) -> Self {
        let percentage = match total_bytes {
            Some(total) if total > 0 => downloaded_bytes as f64 / total as f64 * 100.0,
            _ => 0.0,
        };
        Self {
            downloaded_bytes,
            total_bytes,
            speed_bps,
            eta_secs,
            percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub channel: String,
    pub duration: Option<String>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
    pub view_count: Option<u64>,
}

impl VideoInfo {
    pub fn from_raw(raw: &RawMetadata) -> Self {
        Self {
            title: raw.title.clone().unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            channel: raw
                .uploader
                .clone()
                .or_else(|| raw.channel.clone())
                .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            duration: raw.duration_string.clone(),
            thumbnail: raw.thumbnail.clone(),
            description: raw.description.clone(),
            view_count: raw.view_count,
        }
    }
}

/// Metadata as returned by the extraction engine, before it is reduced to
/// a `VideoInfo`. Field names follow the yt-dlp info dict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMetadata {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub duration_string: Option<String>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
    pub view_count: Option<u64>,
    pub webpage_url: Option<String>,
    pub entries: Option<Vec<Option<RawMetadata>>>,
    pub formats: Vec<RawFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
}

impl RawFormat {
    pub fn has_video_and_audio(&self) -> bool {
        let present = |codec: &Option<String>| codec.as_deref().is_some_and(|c| c != "none");
        present(&self.vcodec) && present(&self.acodec)
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec > 1_000_000.0 {
        format!("{:.2} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec > 1_000.0 {
        format!("{:.2} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{bytes_per_sec:.0} B/s")
    }
}

pub fn format_eta(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
