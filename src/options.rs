use crate::config::EngineConfig;
use crate::models::DownloadRequest;
use crate::validation::resolution_height;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;

pub const EXTRACT_AUDIO_PP: &str = "FFmpegExtractAudio";
pub const VIDEO_REMUXER_PP: &str = "FFmpegVideoRemuxer";

/// Audio formats the engine can keep without re-encoding.
const NATIVE_AUDIO_FORMATS: [&str; 3] = ["m4a", "aac", "opus"];

/// Opaque engine invocation parameters, keyed the way the engine names them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineOptions(Map<String, Value>);

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn postprocessors(&self) -> Vec<Value> {
        self.0
            .get("postprocessors")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_postprocessor(&self, key: &str) -> bool {
        self.postprocessors()
            .iter()
            .any(|pp| pp.get("key").and_then(Value::as_str) == Some(key))
    }

    pub fn remove_postprocessor(&mut self, key: &str) {
        let kept: Vec<Value> = self
            .postprocessors()
            .into_iter()
            .filter(|pp| pp.get("key").and_then(Value::as_str) != Some(key))
            .collect();
        if kept.is_empty() {
            self.0.remove("postprocessors");
        } else {
            self.0.insert("postprocessors".to_string(), Value::Array(kept));
        }
    }
}

/// Turns requests into engine invocation parameters.
#[derive(Debug, Clone)]
pub struct OptionsResolver {
    config: EngineConfig,
}

impl OptionsResolver {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Metadata-only invocation.
    pub fn build_info_options(&self, request: &DownloadRequest, cookie_file: Option<&Path>) -> EngineOptions {
        let mut opts = self.base_options(request, cookie_file);
        opts.set("skip_download", true);
        if request.playlist {
            opts.set("playlist_items", "1");
        }
        opts
    }

    /// Full invocation writing into `output_dir`. Progress is reported through
    /// the engine sink, not through the options.
    pub fn build_transfer_options(
        &self,
        request: &DownloadRequest,
        output_dir: &Path,
        cookie_file: Option<&Path>,
    ) -> EngineOptions {
        let mut opts = self.base_options(request, cookie_file);
        let template = output_dir.join("%(title)s.%(ext)s");
        opts.set("outtmpl", template.to_string_lossy().to_string());

        if let Some(proxy) = request.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            opts.set("proxy", proxy.trim());
        }
        if request.playlist {
            opts.set("playlist_items", "1");
        }
        if request.subtitles {
            opts.set("writesubtitles", true);
            opts.set("allsubtitles", true);
        }

        if request.audio_only {
            self.apply_audio_format(&mut opts, request);
        } else {
            apply_video_format(&mut opts, request);
        }
        opts
    }

    fn base_options(&self, request: &DownloadRequest, cookie_file: Option<&Path>) -> EngineOptions {
        let cfg = &self.config;
        let mut opts = EngineOptions::new();
        if let Some(path) = cookie_file {
            opts.set("cookiefile", path.to_string_lossy().to_string());
        }
        opts.set("quiet", false);
        opts.set("no_warnings", false);
        opts.set("socket_timeout", cfg.socket_timeout_secs);
        opts.set("updatetime", false);
        opts.set("geo_bypass", true);
        opts.set("geo_bypass_country", cfg.geo_bypass_country.clone());
        opts.set("force_ipv4", cfg.force_ipv4);
        opts.set("retries", cfg.retries);
        opts.set("fragment_retries", cfg.fragment_retries);
        opts.set("file_access_retries", cfg.file_access_retries);
        opts.set("retry_sleep", cfg.retry_sleep_secs);
        opts.set("prefer_ffmpeg", true);
        if let Some(loc) = cfg.ffmpeg_location.as_deref().filter(|s| !s.trim().is_empty()) {
            opts.set("ffmpeg_location", loc);
        }
        opts.set("noplaylist", !request.playlist);
        opts
    }

    fn apply_audio_format(&self, opts: &mut EngineOptions, request: &DownloadRequest) {
        let format = request.effective_audio_format();
        if NATIVE_AUDIO_FORMATS.contains(&format.as_str()) {
            opts.set("format", format!("ba[acodec^={format}]/ba/best"));
            opts.set("final_ext", format.clone());
            opts.set(
                "postprocessors",
                json!([{ "key": EXTRACT_AUDIO_PP, "preferredcodec": "copy" }]),
            );
        } else {
            let bitrate = request.audio_bitrate.trim();
            let bitrate = if bitrate.is_empty() {
                self.config.default_audio_bitrate.as_str()
            } else {
                bitrate
            };
            opts.set("format", "ba/best");
            opts.set(
                "postprocessors",
                json!([{
                    "key": EXTRACT_AUDIO_PP,
                    "preferredcodec": format,
                    "preferredquality": bitrate,
                }]),
            );
        }
    }
}

fn apply_video_format(opts: &mut EngineOptions, request: &DownloadRequest) {
    let selector = match resolution_height(&request.resolution) {
        Some(h) => format!("(bestvideo[height<={h}]+bestaudio/best[height<={h}]/best)"),
        None => "bestvideo+bestaudio/best".to_string(),
    };
    let container = request.output_format.trim().to_ascii_lowercase();
    let container = if container.is_empty() { "mp4".to_string() } else { container };

    opts.set("format", selector);
    opts.set("format_sort", json!(["res", "ext:mp4:m4a", "size", "br", "asr"]));
    opts.set("prefer_free_formats", false);
    opts.set("merge_output_format", container.clone());
    opts.set(
        "postprocessors",
        json!([{ "key": VIDEO_REMUXER_PP, "preferedformat": container }]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn resolver() -> OptionsResolver {
        OptionsResolver::new(EngineConfig::default())
    }

    #[test]
    fn info_options_skip_download_and_carry_base() {
        let req = DownloadRequest::video("https://youtu.be/a", "720p", "/tmp/dl");
        let cookie = PathBuf::from("/tmp/c.cookies");
        let opts = resolver().build_info_options(&req, Some(&cookie));
        assert_eq!(opts.get_bool("skip_download"), Some(true));
        assert_eq!(opts.get_bool("noplaylist"), Some(true));
        assert_eq!(opts.get_str("cookiefile"), Some("/tmp/c.cookies"));
        assert_eq!(opts.get("socket_timeout"), Some(&json!(10)));
        assert!(!opts.contains("playlist_items"));
        assert!(!opts.contains("outtmpl"));
    }

    #[test]
    fn playlist_requests_take_first_entry_only() {
        let req = DownloadRequest::video("https://youtu.be/a", "720p", "/tmp/dl").with_playlist(true);
        let r = resolver();
        let info = r.build_info_options(&req, None);
        let transfer = r.build_transfer_options(&req, Path::new("/tmp/dl/list"), None);
        assert_eq!(info.get_str("playlist_items"), Some("1"));
        assert_eq!(transfer.get_str("playlist_items"), Some("1"));
        assert_eq!(transfer.get_bool("noplaylist"), Some(false));
    }

    #[test]
    fn video_selector_is_capped_at_requested_height() {
        let req = DownloadRequest::video("https://youtu.be/a", "1080p", "/tmp/dl").with_output_format("MKV");
        let opts = resolver().build_transfer_options(&req, Path::new("/tmp/dl"), None);
        assert_eq!(
            opts.get_str("format"),
            Some("(bestvideo[height<=1080]+bestaudio/best[height<=1080]/best)")
        );
        assert_eq!(opts.get_str("merge_output_format"), Some("mkv"));
        assert!(opts.has_postprocessor(VIDEO_REMUXER_PP));
        assert!(opts.get_str("outtmpl").unwrap_or_default().ends_with("%(title)s.%(ext)s"));
    }

    #[test]
    fn native_audio_uses_copy_path() {
        let req = DownloadRequest::audio("https://youtu.be/a", "M4A", "/tmp/dl");
        let opts = resolver().build_transfer_options(&req, Path::new("/tmp/dl"), None);
        assert_eq!(opts.get_str("format"), Some("ba[acodec^=m4a]/ba/best"));
        assert_eq!(opts.get_str("final_ext"), Some("m4a"));
        let pps = opts.postprocessors();
        assert_eq!(pps[0]["preferredcodec"], json!("copy"));
    }

    #[test]
    fn other_audio_is_reencoded_at_bitrate() {
        let req = DownloadRequest::audio("https://youtu.be/a", "mp3", "/tmp/dl").with_audio_bitrate("192");
        let opts = resolver().build_transfer_options(&req, Path::new("/tmp/dl"), None);
        assert_eq!(opts.get_str("format"), Some("ba/best"));
        let pps = opts.postprocessors();
        assert_eq!(pps[0]["key"], json!(EXTRACT_AUDIO_PP));
        assert_eq!(pps[0]["preferredcodec"], json!("mp3"));
        assert_eq!(pps[0]["preferredquality"], json!("192"));
        assert!(!opts.contains("merge_output_format"));
    }

    #[test]
    fn proxy_and_subtitles_are_forwarded() {
        let req = DownloadRequest::video("https://youtu.be/a", "720p", "/tmp/dl")
            .with_proxy("socks5://127.0.0.1:1080")
            .with_subtitles(true);
        let opts = resolver().build_transfer_options(&req, Path::new("/tmp/dl"), None);
        assert_eq!(opts.get_str("proxy"), Some("socks5://127.0.0.1:1080"));
        assert_eq!(opts.get_bool("writesubtitles"), Some(true));
        assert_eq!(opts.get_bool("allsubtitles"), Some(true));
    }

    #[test]
    fn remove_postprocessor_drops_empty_list() {
        let req = DownloadRequest::video("https://youtu.be/a", "720p", "/tmp/dl");
        let mut opts = resolver().build_transfer_options(&req, Path::new("/tmp/dl"), None);
        opts.remove_postprocessor(VIDEO_REMUXER_PP);
        assert!(!opts.contains("postprocessors"));
    }
}
