#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use toklabs_engine::config::EngineConfig;
use toklabs_engine::engine::{
    EngineFailure, EngineResult, EngineSink, ExtractionEngine, ProgressControl, ProgressUpdate,
};
use toklabs_engine::events::{Event, EventBus, EventPayload, LogLevel, Subscription};
use toklabs_engine::executor::EngineContext;
use toklabs_engine::history::MemoryHistory;
use toklabs_engine::models::{DownloadRequest, DownloadStatus, RawMetadata, TaskId};
use toklabs_engine::options::EngineOptions;
use toklabs_engine::paths::AppPaths;
use toklabs_engine::pool::WorkerPool;

pub const WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub enum Step {
    /// Report progress in chunks, then succeed.
    Succeed,
    Fail(&'static str),
    /// Report zero progress until released or aborted.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Resolve,
    Transfer,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub url: String,
    pub kind: CallKind,
    pub format: Option<String>,
    pub cookie_file_existed: bool,
}

type Hook = Box<dyn Fn() + Send>;

pub struct ScriptedEngine {
    resolve_hooks: Mutex<HashMap<String, Hook>>,
    transfer_hooks: Mutex<HashMap<String, Hook>>,
    plans: Mutex<HashMap<String, VecDeque<Step>>>,
    unresolvable: Mutex<HashSet<String>>,
    empty: Mutex<HashSet<String>>,
    playlists: Mutex<HashMap<String, RawMetadata>>,
    pub total_bytes: u64,
    pub chunks: u64,
    pub chunk_delay: Duration,
    active: AtomicUsize,
    high_water: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    released: Mutex<bool>,
    release_cv: Condvar,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self {
            resolve_hooks: Mutex::new(HashMap::new()),
            transfer_hooks: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            unresolvable: Mutex::new(HashSet::new()),
            empty: Mutex::new(HashSet::new()),
            playlists: Mutex::new(HashMap::new()),
            total_bytes: 4_000,
            chunks: 4,
            chunk_delay: Duration::from_millis(15),
            active: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            released: Mutex::new(false),
            release_cv: Condvar::new(),
        }
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(self, url: &str, steps: Vec<Step>) -> Self {
        self.plans.lock().unwrap().insert(url.to_string(), steps.into());
        self
    }

    pub fn unresolvable(self, url: &str) -> Self {
        self.unresolvable.lock().unwrap().insert(url.to_string());
        self
    }

    /// Resolution succeeds but finds nothing.
    pub fn empty(self, url: &str) -> Self {
        self.empty.lock().unwrap().insert(url.to_string());
        self
    }

    pub fn playlist(self, url: &str, raw: RawMetadata) -> Self {
        self.playlists.lock().unwrap().insert(url.to_string(), raw);
        self
    }

    /// Runs `hook` at the start of every metadata lookup for `url`.
    pub fn on_resolve(&self, url: &str, hook: impl Fn() + Send + 'static) {
        self.resolve_hooks.lock().unwrap().insert(url.to_string(), Box::new(hook));
    }

    /// Runs `hook` at the start of every transfer of `url`.
    pub fn on_transfer(&self, url: &str, hook: impl Fn() + Send + 'static) {
        self.transfer_hooks.lock().unwrap().insert(url.to_string(), Box::new(hook));
    }

    fn run_hook(hooks: &Mutex<HashMap<String, Hook>>, url: &str) {
        if let Some(hook) = hooks.lock().unwrap().get(url) {
            hook();
        }
    }

    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.release_cv.notify_all();
    }

    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, url: &str, kind: CallKind) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.url == url && c.kind == kind)
            .collect()
    }

    fn record(&self, url: &str, kind: CallKind, options: &EngineOptions) {
        let cookie_file_existed = options
            .get_str("cookiefile")
            .map(|p| PathBuf::from(p).exists())
            .unwrap_or(false);
        self.calls.lock().unwrap().push(Call {
            url: url.to_string(),
            kind,
            format: options.get_str("format").map(str::to_string),
            cookie_file_existed,
        });
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(&self.active)
    }

    fn next_step(&self, url: &str) -> Step {
        self.plans
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExtractionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn resolve_metadata(
        &self,
        url: &str,
        options: &EngineOptions,
        sink: &mut dyn EngineSink,
    ) -> EngineResult<Option<RawMetadata>> {
        let _active = self.enter();
        self.record(url, CallKind::Resolve, options);
        Self::run_hook(&self.resolve_hooks, url);
        sink.log(LogLevel::Info, &format!("Extracting URL: {url}"));
        std::thread::sleep(self.chunk_delay);

        if self.unresolvable.lock().unwrap().contains(url) {
            return Err(EngineFailure::new("ERROR: Video unavailable").with_type("DownloadError"));
        }
        if self.empty.lock().unwrap().contains(url) {
            return Ok(None);
        }
        if let Some(raw) = self.playlists.lock().unwrap().get(url) {
            return Ok(Some(raw.clone()));
        }
        Ok(Some(RawMetadata {
            title: Some(format!("Title of {url}")),
            uploader: Some("Uploader".to_string()),
            ..RawMetadata::default()
        }))
    }

    fn transfer(&self, url: &str, options: &EngineOptions, sink: &mut dyn EngineSink) -> EngineResult<()> {
        let _active = self.enter();
        self.record(url, CallKind::Transfer, options);
        Self::run_hook(&self.transfer_hooks, url);

        match self.next_step(url) {
            Step::Succeed => {
                for i in 1..=self.chunks {
                    std::thread::sleep(self.chunk_delay);
                    let update = ProgressUpdate {
                        downloaded_bytes: self.total_bytes * i / self.chunks,
                        total_bytes: Some(self.total_bytes),
                        speed_bps: 1_500.0,
                        eta_secs: self.chunks - i,
                    };
                    if sink.progress(update) == ProgressControl::Abort {
                        return Err(EngineFailure::aborted());
                    }
                }
                sink.post_processing("Merger");
                Ok(())
            }
            Step::Fail(message) => {
                std::thread::sleep(self.chunk_delay);
                Err(EngineFailure::new(message))
            }
            Step::Block => {
                let mut released = self.released.lock().unwrap();
                loop {
                    if *released {
                        return Ok(());
                    }
                    let update = ProgressUpdate {
                        downloaded_bytes: 0,
                        total_bytes: None,
                        speed_bps: 0.0,
                        eta_secs: 0,
                    };
                    drop(released);
                    if sink.progress(update) == ProgressControl::Abort {
                        return Err(EngineFailure::aborted());
                    }
                    released = self.released.lock().unwrap();
                    released = self
                        .release_cv
                        .wait_timeout(released, Duration::from_millis(10))
                        .unwrap()
                        .0;
                }
            }
        }
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub paths: AppPaths,
    pub engine: Arc<ScriptedEngine>,
    pub history: Arc<MemoryHistory>,
    pub bus: EventBus,
    pub pool: WorkerPool,
    pub events: Receiver<Event>,
    _subscription: Subscription,
}

pub fn harness(concurrency: usize, engine: ScriptedEngine) -> Harness {
    harness_with(
        EngineConfig {
            max_concurrency: concurrency,
            rename_backoff_ms: 10,
            ..EngineConfig::default()
        },
        engine,
    )
}

pub fn harness_with(config: EngineConfig, engine: ScriptedEngine) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    let engine = Arc::new(engine);
    let history = Arc::new(MemoryHistory::new());
    let bus = EventBus::new();
    let (subscription, events) = bus.subscribe_channel(None);

    let ctx = EngineContext::new(
        paths.clone(),
        config,
        engine.clone(),
        history.clone(),
        bus.clone(),
    );
    let pool = WorkerPool::new(Arc::new(ctx));
    Harness {
        dir,
        paths,
        engine,
        history,
        bus,
        pool,
        events,
        _subscription: subscription,
    }
}

impl Harness {
    pub fn destination(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn request(&self, url: &str) -> DownloadRequest {
        DownloadRequest::video(url, "720p", self.destination())
    }

    /// Receives events until `completed` tasks have reported `Completed`.
    pub fn collect(&self, completed: usize) -> Vec<Event> {
        let deadline = Instant::now() + WAIT;
        let mut seen = 0;
        let mut out = Vec::new();
        while seen < completed {
            let left = deadline.saturating_duration_since(Instant::now());
            let event = self
                .events
                .recv_timeout(left)
                .unwrap_or_else(|_| panic!("timed out after {seen} of {completed} completions"));
            if matches!(event.payload, EventPayload::Completed { .. }) {
                seen += 1;
            }
            out.push(event);
        }
        out
    }

    /// Waits for a specific status of one task, returning the events seen.
    pub fn wait_for_status(&self, id: TaskId, status: DownloadStatus) -> Vec<Event> {
        let deadline = Instant::now() + WAIT;
        let mut out = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let event = self
                .events
                .recv_timeout(left)
                .unwrap_or_else(|_| panic!("timed out waiting for {status}"));
            let hit = event.task.id == id
                && matches!(&event.payload, EventPayload::StatusChanged { status: s } if *s == status);
            out.push(event);
            if hit {
                return out;
            }
        }
    }
}

pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn statuses_of(events: &[Event], id: TaskId) -> Vec<DownloadStatus> {
    events
        .iter()
        .filter(|e| e.task.id == id)
        .filter_map(|e| match &e.payload {
            EventPayload::StatusChanged { status } => Some(*status),
            _ => None,
        })
        .collect()
}

pub fn logs_of(events: &[Event], id: TaskId) -> Vec<(LogLevel, String)> {
    events
        .iter()
        .filter(|e| e.task.id == id)
        .filter_map(|e| match &e.payload {
            EventPayload::LogMessage { text, level } => Some((*level, text.clone())),
            _ => None,
        })
        .collect()
}
