use crate::events::TaskRef;
use crate::models::{DownloadProgress, DownloadRequest, DownloadStatus, RowToken, TaskId, VideoInfo};
use crate::retry::{RetryBudget, RetryVariant};
use crate::{EngineError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a task and its handles.
/// Setting it never interrupts an engine call; the executor observes it at
/// its checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller-side reference to a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    row: Option<RowToken>,
    cancel: CancelToken,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn row(&self) -> Option<RowToken> {
        self.row
    }

    /// Requests cancellation. Prefer `WorkerPool::cancel` for queued tasks so
    /// they are finalized without waiting for a slot.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Final report of an executed task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub id: TaskId,
    pub row: Option<RowToken>,
    pub status: DownloadStatus,
    pub error: Option<String>,
    pub info: Option<VideoInfo>,
    pub retry: Option<RetryVariant>,
    pub output_dir: Option<PathBuf>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == DownloadStatus::Completed
    }
}

/// Mutable execution state of one request. Owned by the executing thread
/// once dispatched.
#[derive(Debug)]
pub struct DownloadTask {
    id: TaskId,
    row: Option<RowToken>,
    request: DownloadRequest,
    status: DownloadStatus,
    progress: Option<DownloadProgress>,
    info: Option<VideoInfo>,
    error: Option<String>,
    cancel: CancelToken,
    output_dir: Option<PathBuf>,
    retry: RetryBudget,
}

impl DownloadTask {
    pub fn new(request: DownloadRequest, row: Option<RowToken>) -> Self {
        Self {
            id: TaskId::new(),
            row,
            request,
            status: DownloadStatus::Pending,
            progress: None,
            info: None,
            error: None,
            cancel: CancelToken::new(),
            output_dir: None,
            retry: RetryBudget::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn row(&self) -> Option<RowToken> {
        self.row
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            id: self.id,
            row: self.row,
        }
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    pub fn progress(&self) -> Option<&DownloadProgress> {
        self.progress.as_ref()
    }

    pub fn info(&self) -> Option<&VideoInfo> {
        self.info.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn output_dir(&self) -> Option<&PathBuf> {
        self.output_dir.as_ref()
    }

    pub fn set_output_dir(&mut self, dir: PathBuf) {
        self.output_dir = Some(dir);
    }

    pub fn retry_used(&self) -> Option<RetryVariant> {
        self.retry.used()
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            row: self.row,
            cancel: self.cancel.clone(),
        }
    }

    pub fn transition(&mut self, next: DownloadStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Takes the single retry and re-enters `Downloading`.
    pub fn begin_retry(&mut self, variant: RetryVariant) -> Result<()> {
        if !matches!(
            self.status,
            DownloadStatus::Downloading | DownloadStatus::Processing
        ) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: DownloadStatus::Downloading,
            });
        }
        if !self.retry.try_consume(variant) {
            return Err(EngineError::RetryExhausted);
        }
        self.status = DownloadStatus::Downloading;
        Ok(())
    }

    pub fn set_info(&mut self, info: VideoInfo) -> Result<()> {
        if self.info.is_some() {
            return Err(EngineError::InfoAlreadySet);
        }
        self.info = Some(info);
        Ok(())
    }

    pub fn update_progress(&mut self, progress: DownloadProgress) {
        self.progress = Some(progress);
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            id: self.id,
            row: self.row,
            status: self.status,
            error: self.error.clone(),
            info: self.info.clone(),
            retry: self.retry.used(),
            output_dir: self.output_dir.clone(),
        }
    }
}
