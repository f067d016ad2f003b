//! Drives one [`DownloadTask`] from `Pending` to a terminal status.
//!
//! The executor is the only place engine failures are interpreted. Every
//! exit path ends with a terminal `StatusChanged` event followed by
//! `Completed`, and the task's session resources are released before
//! `execute` returns.

use crate::config::EngineConfig;
use crate::engine::{EngineFailure, EngineSink, ExtractionEngine, ProgressControl, ProgressUpdate};
use crate::events::{Event, EventBus, EventPayload, LogLevel, TaskRef};
use crate::history::{HistoryEntry, HistoryStore};
use crate::models::{format_eta, format_speed, DownloadProgress, DownloadStatus, RawMetadata, VideoInfo};
use crate::options::{EngineOptions, OptionsResolver};
use crate::paths::AppPaths;
use crate::retry::{classify_failure, remedy_for, FailureClass};
use crate::session::TaskSession;
use crate::task::{DownloadTask, TaskOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const EVENT_SOURCE: &str = "executor";
const DEFAULT_PLAYLIST_DIR: &str = "playlist";
const BACKOFF_POLL: Duration = Duration::from_millis(50);

/// Everything a task needs at run time, built once at start-up.
pub struct EngineContext {
    pub paths: AppPaths,
    pub config: EngineConfig,
    pub engine: Arc<dyn ExtractionEngine>,
    pub history: Arc<dyn HistoryStore>,
    pub bus: EventBus,
    pub resolver: OptionsResolver,
}

impl EngineContext {
    pub fn new(
        paths: AppPaths,
        config: EngineConfig,
        engine: Arc<dyn ExtractionEngine>,
        history: Arc<dyn HistoryStore>,
        bus: EventBus,
    ) -> Self {
        let resolver = OptionsResolver::new(config.clone());
        Self {
            paths,
            config,
            engine,
            history,
            bus,
            resolver,
        }
    }
}

/// Publishes events on behalf of one task.
#[derive(Clone, Copy)]
pub(crate) struct Reporter<'a> {
    bus: &'a EventBus,
    task: TaskRef,
    source: &'static str,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(bus: &'a EventBus, task: TaskRef, source: &'static str) -> Self {
        Self { bus, task, source }
    }

    fn publish(&self, payload: EventPayload) {
        self.bus.publish(Event::new(self.task, payload, self.source));
    }

    pub(crate) fn status(&self, status: DownloadStatus) {
        self.publish(EventPayload::StatusChanged { status });
    }

    pub(crate) fn log(&self, level: LogLevel, text: impl Into<String>) {
        self.publish(EventPayload::LogMessage {
            text: text.into(),
            level,
        });
    }

    fn progress(&self, progress: DownloadProgress) {
        self.publish(EventPayload::ProgressUpdated { progress });
    }

    fn info(&self, info: VideoInfo) {
        self.publish(EventPayload::InfoExtracted { info });
    }

    pub(crate) fn completed(&self, status: DownloadStatus, error: Option<String>) {
        self.publish(EventPayload::Completed {
            success: status == DownloadStatus::Completed,
            status,
            error,
        });
    }
}

enum Finish {
    Completed,
    Failed(String),
    Cancelled,
}

pub struct TaskExecutor {
    ctx: Arc<EngineContext>,
}

impl TaskExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Runs the task to a terminal status. Never returns a non-terminal
    /// outcome and never panics on engine errors.
    pub fn execute(&self, mut task: DownloadTask) -> TaskOutcome {
        let reporter = Reporter::new(&self.ctx.bus, task.task_ref(), EVENT_SOURCE);
        let task_id = task.id();
        tracing::info!(task_id = %task_id, url = %task.request().url, "task started");

        let finish = if task.is_cancel_requested() {
            Finish::Cancelled
        } else {
            self.drive(&mut task, reporter)
        };
        self.finalize(&mut task, reporter, finish);

        tracing::info!(task_id = %task_id, status = %task.status(), "task finished");
        task.outcome()
    }

    fn drive(&self, task: &mut DownloadTask, reporter: Reporter<'_>) -> Finish {
        let ctx = &*self.ctx;
        let narrative = ctx.config.emit_narrative_states;

        if narrative {
            if let Err(e) = advance(task, reporter, DownloadStatus::Connecting) {
                return Finish::Failed(e.to_string());
            }
        }

        let task_key = task.id().to_string();
        let session = match TaskSession::open(&ctx.paths, &task_key) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(task_id = %task_key, error = %e, "failed to create session cookie file");
                reporter.log(LogLevel::Warning, format!("Failed to create cookie file: {e}"));
                None
            }
        };
        let cookie_file = session.as_ref().map(TaskSession::cookie_path);

        if let Err(e) = advance(task, reporter, DownloadStatus::FetchingInfo) {
            return Finish::Failed(e.to_string());
        }

        let url = task.request().url.clone();
        let info_opts = ctx.resolver.build_info_options(task.request(), cookie_file);
        let resolved = {
            let mut sink = TaskSink::new(task, reporter, ctx.engine.name(), narrative);
            ctx.engine.resolve_metadata(&url, &info_opts, &mut sink)
        };

        let raw = match resolved {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                if task.is_cancel_requested() {
                    return Finish::Cancelled;
                }
                return Finish::Failed(no_metadata_failure(&url).describe());
            }
            Err(failure) => {
                if task.is_cancel_requested() {
                    return Finish::Cancelled;
                }
                tracing::warn!(task_id = %task_key, error = %failure, "metadata resolution failed");
                return Finish::Failed(failure.describe());
            }
        };

        if task.is_cancel_requested() {
            return Finish::Cancelled;
        }

        let (entry, output_dir) = match self.select_entry(task, reporter, raw) {
            Ok(selected) => selected,
            Err(message) => return Finish::Failed(message),
        };

        let info = VideoInfo::from_raw(&entry);
        if let Err(e) = task.set_info(info.clone()) {
            return Finish::Failed(e.to_string());
        }
        reporter.info(info.clone());
        log_combined_formats(reporter, &entry);
        self.record_history(reporter, &task_key, &info, &url);

        if task.is_cancel_requested() {
            return Finish::Cancelled;
        }

        if let Err(message) = ensure_output_dir(reporter, &output_dir) {
            return Finish::Failed(message);
        }
        task.set_output_dir(output_dir.clone());

        if let Err(e) = advance(task, reporter, DownloadStatus::Downloading) {
            return Finish::Failed(e.to_string());
        }
        reporter.log(
            LogLevel::Info,
            format!("Starting download to: {}", output_dir.display()),
        );

        let mut opts = ctx
            .resolver
            .build_transfer_options(task.request(), &output_dir, cookie_file);
        self.transfer_with_retry(task, reporter, &url, &mut opts)
    }

    fn transfer_with_retry(
        &self,
        task: &mut DownloadTask,
        reporter: Reporter<'_>,
        url: &str,
        opts: &mut EngineOptions,
    ) -> Finish {
        let ctx = &*self.ctx;
        let narrative = ctx.config.emit_narrative_states;
        let backoff = Duration::from_millis(ctx.config.rename_backoff_ms);

        loop {
            let result = {
                let mut sink = TaskSink::new(task, reporter, ctx.engine.name(), narrative);
                ctx.engine.transfer(url, opts, &mut sink)
            };

            let failure = match result {
                Ok(()) => return Finish::Completed,
                Err(failure) => failure,
            };

            let variant = match classify_failure(&failure, task.is_cancel_requested()) {
                FailureClass::Cancelled => return Finish::Cancelled,
                FailureClass::Fatal => return Finish::Failed(failure.describe()),
                FailureClass::Retryable(variant) => variant,
            };

            if let Some(used) = task.retry_used() {
                reporter.log(
                    LogLevel::Warning,
                    format!("Retry already used ({used}); not retrying {variant}"),
                );
                return Finish::Failed(failure.describe());
            }

            let remedy = remedy_for(variant, opts, backoff);
            tracing::warn!(
                task_id = %task.id(),
                variant = %variant,
                error = %failure,
                "transfer failed, retrying once"
            );
            reporter.log(LogLevel::Warning, format!("Fallback ({variant}): {}", remedy.note));

            sleep_unless_cancelled(task, remedy.backoff);
            if task.is_cancel_requested() {
                return Finish::Cancelled;
            }
            if let Err(e) = task.begin_retry(variant) {
                return Finish::Failed(e.to_string());
            }
            reporter.status(DownloadStatus::Downloading);
            *opts = remedy.options;
        }
    }

    /// Picks the metadata the rest of the task works with. Multi-entry
    /// results are truncated to their first entry; only playlist requests
    /// download into a directory named after the playlist.
    fn select_entry(
        &self,
        task: &DownloadTask,
        reporter: Reporter<'_>,
        mut raw: RawMetadata,
    ) -> std::result::Result<(RawMetadata, PathBuf), String> {
        let destination = task.request().destination.clone();
        let Some(entries) = raw.entries.take() else {
            return Ok((raw, destination));
        };

        let playlist_title = raw.title.clone().unwrap_or_default();
        let Some(first) = entries.into_iter().flatten().next() else {
            return Err(EngineFailure::new("playlist has no entries")
                .with_type("DownloadError")
                .describe());
        };

        if !task.request().playlist {
            return Ok((first, destination));
        }

        let dir = destination.join(sanitize_dir_name(&playlist_title));
        reporter.log(
            LogLevel::Info,
            format!(
                "Playlist {:?}: downloading the first entry only",
                playlist_title
            ),
        );
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .map_err(|e| format!("failed to create playlist directory {}: {e}", dir.display()))?;
            reporter.log(
                LogLevel::Info,
                format!("Created playlist directory: {}", dir.display()),
            );
        }
        Ok((first, dir))
    }

    fn record_history(&self, reporter: Reporter<'_>, task_key: &str, info: &VideoInfo, url: &str) {
        let entry = HistoryEntry {
            title: info.title.clone(),
            channel: info.channel.clone(),
            url: url.to_string(),
        };
        if let Err(e) = self.ctx.history.append(&entry) {
            tracing::warn!(task_id = %task_key, error = %e, "failed to record history");
            reporter.log(LogLevel::Warning, format!("Failed to record history: {e}"));
        }
    }

    fn finalize(&self, task: &mut DownloadTask, reporter: Reporter<'_>, finish: Finish) {
        let (status, error) = match finish {
            Finish::Completed => (DownloadStatus::Completed, None),
            Finish::Failed(message) => (DownloadStatus::Failed, Some(message)),
            Finish::Cancelled => (DownloadStatus::Cancelled, None),
        };

        let (status, error) = match task.transition(status) {
            Ok(()) => (status, error),
            Err(e) => {
                // Only completion has preconditions; anything non-terminal may fail.
                tracing::error!(task_id = %task.id(), error = %e, "invalid terminal transition");
                let _ = task.transition(DownloadStatus::Failed);
                (DownloadStatus::Failed, Some(e.to_string()))
            }
        };

        match (&status, &error) {
            (DownloadStatus::Failed, Some(message)) => {
                task.set_error(message.clone());
                tracing::warn!(task_id = %task.id(), error = %message, "task failed");
                reporter.log(LogLevel::Error, message.clone());
            }
            (DownloadStatus::Cancelled, _) => {
                reporter.log(LogLevel::Info, "Download cancelled");
            }
            (DownloadStatus::Completed, _) => {
                reporter.log(LogLevel::Info, "Download completed");
            }
            _ => {}
        }
        reporter.status(status);
        reporter.completed(status, error);
    }
}

/// Sleeps out a retry backoff, waking early once the task is cancelled.
fn sleep_unless_cancelled(task: &DownloadTask, backoff: Duration) {
    let deadline = Instant::now() + backoff;
    while !task.is_cancel_requested() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        std::thread::sleep(left.min(BACKOFF_POLL));
    }
}

fn advance(task: &mut DownloadTask, reporter: Reporter<'_>, next: DownloadStatus) -> crate::Result<()> {
    task.transition(next)?;
    reporter.status(next);
    Ok(())
}

fn ensure_output_dir(reporter: Reporter<'_>, dir: &Path) -> std::result::Result<(), String> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("failed to create download directory {}: {e}", dir.display()))?;
    reporter.log(
        LogLevel::Info,
        format!("Created download directory: {}", dir.display()),
    );
    Ok(())
}

fn log_combined_formats(reporter: Reporter<'_>, raw: &RawMetadata) {
    let combined: Vec<String> = raw
        .formats
        .iter()
        .filter(|f| f.has_video_and_audio())
        .map(|f| {
            format!(
                "{} ({}, {}x{})",
                f.format_id.as_deref().unwrap_or("?"),
                f.ext.as_deref().unwrap_or("?"),
                f.width.unwrap_or(0),
                f.height.unwrap_or(0)
            )
        })
        .collect();
    if !combined.is_empty() {
        reporter.log(
            LogLevel::Debug,
            format!("Formats with video and audio: {}", combined.join(", ")),
        );
    }
}

fn no_metadata_failure(url: &str) -> EngineFailure {
    EngineFailure::new(format!(
        "no metadata could be resolved for {url}; the content may be missing, private or blocked"
    ))
    .with_type("ExtractorError")
    .with_http_status(404)
}

fn sanitize_dir_name(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for ch in title.trim().chars() {
        if ch.is_control() || matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    let trimmed = out.trim_matches(|ch: char| ch == '.' || ch.is_whitespace());
    if trimmed.is_empty() {
        DEFAULT_PLAYLIST_DIR.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Engine callbacks for the task being executed. Runs on the worker thread
/// that called into the engine.
struct TaskSink<'t, 'r> {
    task: &'t mut DownloadTask,
    reporter: Reporter<'r>,
    engine_name: &'static str,
    narrative: bool,
}

impl<'t, 'r> TaskSink<'t, 'r> {
    fn new(task: &'t mut DownloadTask, reporter: Reporter<'r>, engine_name: &'static str, narrative: bool) -> Self {
        Self {
            task,
            reporter,
            engine_name,
            narrative,
        }
    }
}

impl EngineSink for TaskSink<'_, '_> {
    fn log(&mut self, level: LogLevel, line: &str) {
        self.reporter.log(
            level,
            format!("[{} {}] {}", self.engine_name, level.engine_label(), line),
        );
    }

    fn progress(&mut self, update: ProgressUpdate) -> ProgressControl {
        if self.task.is_cancel_requested() {
            return ProgressControl::Abort;
        }
        let progress = DownloadProgress::new(
            update.downloaded_bytes,
            update.total_bytes,
            update.speed_bps,
            update.eta_secs,
        );
        self.task.update_progress(progress.clone());
        let line = format!(
            "Downloading... {:.1}% | Speed: {} | ETA: {}",
            progress.percentage,
            format_speed(progress.speed_bps),
            format_eta(progress.eta_secs)
        );
        self.reporter.progress(progress);
        self.reporter.log(LogLevel::Debug, line);
        ProgressControl::Continue
    }

    fn post_processing(&mut self, step: &str) {
        self.reporter
            .log(LogLevel::Info, format!("Post-processing: {step}"));
        if self.narrative
            && self.task.status() == DownloadStatus::Downloading
            && self.task.transition(DownloadStatus::Processing).is_ok()
        {
            self.reporter.status(DownloadStatus::Processing);
        }
    }
}
