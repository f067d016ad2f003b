//! Per-task JSONL log files fed from the event bus.

use crate::events::{now_ms, Event, EventBus, EventPayload, LogLevel, Subscription};
use crate::paths::AppPaths;
use crate::Result;
use std::io::Write;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

const TASK_LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const TASK_LOG_MAX_BACKUPS: usize = 3;
const TASK_LOG_MAX_AGE_DAYS: u64 = 30;
const TASK_LOG_TOTAL_CAP_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLogRetentionPolicy {
    pub rotate_bytes: u64,
    pub max_backups: usize,
    pub max_age_days: u64,
    pub total_cap_bytes: u64,
}

impl Default for TaskLogRetentionPolicy {
    fn default() -> Self {
        Self {
            rotate_bytes: TASK_LOG_ROTATE_BYTES,
            max_backups: TASK_LOG_MAX_BACKUPS,
            max_age_days: TASK_LOG_MAX_AGE_DAYS,
            total_cap_bytes: TASK_LOG_TOTAL_CAP_BYTES,
        }
    }
}

/// Appends one JSON object per event to `<base>/logs/tasks/<task_id>.jsonl`.
#[derive(Debug, Clone)]
pub struct TaskLogWriter {
    paths: AppPaths,
    policy: TaskLogRetentionPolicy,
}

impl TaskLogWriter {
    pub fn new(paths: AppPaths, policy: TaskLogRetentionPolicy) -> Self {
        Self { paths, policy }
    }

    /// Subscribes to every event on `bus`. Logging stops when the returned
    /// subscription is dropped.
    pub fn attach(self, bus: &EventBus) -> Subscription {
        bus.subscribe_all(move |event: &Event| {
            self.write_event(event)?;
            Ok(())
        })
    }

    pub fn write_event(&self, event: &Event) -> Result<()> {
        let task_id = event.task.id.to_string();
        let line = serde_json::json!({
            "ts_ms": event.timestamp_ms,
            "logged_at_ms": now_ms(),
            "task_id": task_id,
            "row": event.task.row.map(|r| r.0),
            "level": event_level(event).as_str(),
            "event": event.kind().as_str(),
            "source": event.source,
            "data": serde_json::to_value(&event.payload)?,
        })
        .to_string();

        let dir = self.paths.task_logs_dir();
        std::fs::create_dir_all(&dir)?;
        rotate_task_log(&self.paths, &task_id, &self.policy)?;
        let path = self.paths.task_log_path(&task_id);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }
}

fn event_level(event: &Event) -> LogLevel {
    match &event.payload {
        EventPayload::LogMessage { level, .. } => *level,
        EventPayload::ProgressUpdated { .. } => LogLevel::Debug,
        EventPayload::Completed { success: false, .. } => LogLevel::Warning,
        _ => LogLevel::Info,
    }
}

/// Reads back the current (unrotated) log of a task.
pub fn read_task_log(paths: &AppPaths, task_id: &str) -> Result<Vec<serde_json::Value>> {
    let path = paths.task_log_path(task_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        out.push(serde_json::from_str(line)?);
    }
    Ok(out)
}

/// Removes a task's log and its rotated backups. Returns how many files
/// were deleted.
pub fn remove_task_log(paths: &AppPaths, task_id: &str, policy: &TaskLogRetentionPolicy) -> usize {
    std::iter::once(paths.task_log_path(task_id))
        .chain((1..=policy.max_backups).map(|n| paths.task_log_backup_path(task_id, n)))
        .filter(|path| std::fs::remove_file(path).is_ok())
        .count()
}

/// The files belonging to one task: its current log plus rotated backups.
#[derive(Debug, Default)]
struct TaskLogSet {
    files: Vec<PathBuf>,
    newest: Option<SystemTime>,
    bytes: u64,
}

impl TaskLogSet {
    fn add(&mut self, path: PathBuf, modified: SystemTime, bytes: u64) {
        self.files.push(path);
        self.newest = Some(self.newest.map_or(modified, |n| n.max(modified)));
        self.bytes += bytes;
    }

    fn remove(self) -> usize {
        self.files
            .iter()
            .filter(|path| std::fs::remove_file(path).is_ok())
            .count()
    }
}

/// Task id of a file in the task-log directory: `<id>.jsonl` or
/// `<id>.<n>.jsonl`. Anything else is not ours.
fn task_log_owner(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(".jsonl")?;
    let owner = match stem.rsplit_once('.') {
        Some((id, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => id,
        _ => stem,
    };
    (!owner.is_empty()).then_some(owner)
}

/// Prunes whole tasks at a time, so a backup never outlives its current
/// log. Tasks whose newest file is past the age limit go first, then the
/// least recently written tasks until the directory fits the byte cap.
/// Returns how many files were deleted.
pub fn prune_task_logs(paths: &AppPaths, policy: &TaskLogRetentionPolicy) -> Result<usize> {
    let dir = paths.task_logs_dir();
    if !dir.exists() {
        return Ok(0);
    }

    let mut sets: HashMap<String, TaskLogSet> = HashMap::new();
    for entry in std::fs::read_dir(&dir)?.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(owner) = task_log_owner(&name) else {
            continue;
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        sets.entry(owner.to_string())
            .or_default()
            .add(entry.path(), modified, meta.len());
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(policy.max_age_days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let (expired, mut kept): (Vec<_>, Vec<_>) = sets
        .into_values()
        .partition(|set| set.newest.is_some_and(|t| t < cutoff));

    let mut removed: usize = expired.into_iter().map(TaskLogSet::remove).sum();

    kept.sort_by_key(|set| set.newest);
    let mut total: u64 = kept.iter().map(|set| set.bytes).sum();
    for set in kept {
        if total <= policy.total_cap_bytes {
            break;
        }
        total = total.saturating_sub(set.bytes);
        removed += set.remove();
    }

    if removed > 0 {
        tracing::info!(removed, dir = %dir.display(), "pruned task logs");
    }
    Ok(removed)
}

/// Moves the current log to backup 1 once it reaches the size threshold,
/// shifting older backups up and dropping the one past `max_backups`.
fn rotate_task_log(paths: &AppPaths, task_id: &str, policy: &TaskLogRetentionPolicy) -> Result<()> {
    let current = paths.task_log_path(task_id);
    let len = match std::fs::metadata(&current) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };
    if len < policy.rotate_bytes {
        return Ok(());
    }
    if policy.max_backups == 0 {
        std::fs::remove_file(&current)?;
        return Ok(());
    }

    match std::fs::remove_file(paths.task_log_backup_path(task_id, policy.max_backups)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    for n in (1..policy.max_backups).rev() {
        let from = paths.task_log_backup_path(task_id, n);
        if from.exists() {
            std::fs::rename(&from, paths.task_log_backup_path(task_id, n + 1))?;
        }
    }
    std::fs::rename(&current, paths.task_log_backup_path(task_id, 1))?;
    Ok(())
}
