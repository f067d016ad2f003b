use crate::models::DownloadRequest;
use crate::{EngineError, Result};
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

pub const SUPPORTED_RESOLUTIONS: [(&str, u32); 9] = [
    ("144p", 144),
    ("240p", 240),
    ("360p", 360),
    ("480p", 480),
    ("720p", 720),
    ("1080p", 1080),
    ("1440p", 1440),
    ("2160p", 2160),
    ("4320p", 4320),
];

const KNOWN_PLATFORM_DOMAINS: [&str; 10] = [
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "dailymotion.com",
    "twitch.tv",
    "facebook.com",
    "instagram.com",
    "tiktok.com",
    "soundcloud.com",
    "bandcamp.com",
];

const MIN_AUDIO_BITRATE_KBPS: u32 = 64;
const MAX_AUDIO_BITRATE_KBPS: u32 = 320;

static PROXY_RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();

pub fn resolution_height(label: &str) -> Option<u32> {
    SUPPORTED_RESOLUTIONS
        .iter()
        .find(|(name, _)| *name == label)
        .map(|(_, height)| *height)
}

pub fn validate_request(request: &DownloadRequest) -> Result<()> {
    validate_url(&request.url)?;

    if request.destination.as_os_str().is_empty() {
        return Err(invalid("destination directory cannot be empty"));
    }

    if !request.audio_only && resolution_height(&request.resolution).is_none() {
        let names: Vec<&str> = SUPPORTED_RESOLUTIONS.iter().map(|(n, _)| *n).collect();
        return Err(invalid(format!(
            "unsupported resolution {:?}; must be one of: {}",
            request.resolution,
            names.join(", ")
        )));
    }

    if request.audio_only {
        validate_audio_bitrate(&request.audio_bitrate)?;
    }

    if let Some(proxy) = request.proxy.as_deref() {
        validate_proxy(proxy)?;
    }

    Ok(())
}

pub fn validate_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("URL cannot be empty"));
    }
    let url = Url::parse(trimmed).map_err(|e| invalid(format!("invalid URL {trimmed:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("URL must start with http:// or https://"));
    }
    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
        _ => return Err(invalid("URL has no host")),
    };
    if !KNOWN_PLATFORM_DOMAINS.iter().any(|d| host == *d || host.ends_with(&format!(".{d}"))) {
        tracing::warn!(%host, "URL may not be from a supported platform");
    }
    Ok(url)
}

fn validate_audio_bitrate(raw: &str) -> Result<()> {
    let kbps: u32 = raw
        .trim()
        .parse()
        .map_err(|_| invalid(format!("audio bitrate must be a number, got {raw:?}")))?;
    if !(MIN_AUDIO_BITRATE_KBPS..=MAX_AUDIO_BITRATE_KBPS).contains(&kbps) {
        return Err(invalid(format!(
            "audio bitrate must be between {MIN_AUDIO_BITRATE_KBPS} and {MAX_AUDIO_BITRATE_KBPS} kbps"
        )));
    }
    Ok(())
}

fn validate_proxy(raw: &str) -> Result<()> {
    let re = PROXY_RE
        .get_or_init(|| Regex::new(r"^(https?|socks[45]?)://[^:/\s]+:\d+$"))
        .as_ref()
        .map_err(|e| invalid(format!("proxy pattern failed to compile: {e}")))?;
    if !re.is_match(raw.trim()) {
        return Err(invalid(format!(
            "invalid proxy {raw:?}; use protocol://host:port"
        )));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidRequest(msg.into())
}
