//! Contract of the external extraction engine (metadata resolution and
//! transfer). Implementations block the calling worker thread and call back
//! into the [`EngineSink`] on that same thread.

use crate::events::LogLevel;
use crate::models::RawMetadata;
use crate::options::EngineOptions;
use std::fmt;

/// One progress callback from the engine during a transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bps: f64,
    pub eta_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressControl {
    Continue,
    /// The engine must stop the transfer and return an error.
    Abort,
}

/// Receives engine output for the task currently being executed.
pub trait EngineSink {
    fn log(&mut self, level: LogLevel, line: &str);

    fn progress(&mut self, update: ProgressUpdate) -> ProgressControl;

    /// The engine finished transferring and started a post-processing step.
    fn post_processing(&mut self, step: &str);
}

/// A failure reported by the engine. The message is what failure
/// classification matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub message: String,
    pub error_type: Option<String>,
    pub http_status: Option<u16>,
}

impl EngineFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            http_status: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn aborted() -> Self {
        Self::new("transfer aborted by progress callback").with_type("Aborted")
    }

    /// Multi-line description surfaced on a failed task.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Error Type: {}\nError Details: {}",
            self.error_type.as_deref().unwrap_or("DownloadError"),
            self.message
        );
        if let Some(code) = self.http_status {
            out.push_str(&format!("\nHTTP Status Code: {code}"));
        }
        out
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineFailure {}

pub type EngineResult<T> = std::result::Result<T, EngineFailure>;

pub trait ExtractionEngine: Send + Sync {
    /// Name of the engine (for logging).
    fn name(&self) -> &'static str;

    /// Resolves metadata without transferring media. `Ok(None)` means the
    /// engine ran but found nothing at the URL.
    fn resolve_metadata(
        &self,
        url: &str,
        options: &EngineOptions,
        sink: &mut dyn EngineSink,
    ) -> EngineResult<Option<RawMetadata>>;

    fn transfer(&self, url: &str, options: &EngineOptions, sink: &mut dyn EngineSink) -> EngineResult<()>;
}
