use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use toklabs_engine::config::{self, EngineConfig};
use toklabs_engine::events::{EventBus, EventPayload, LogLevel};
use toklabs_engine::executor::EngineContext;
use toklabs_engine::history::SqliteHistory;
use toklabs_engine::models::{DownloadRequest, DownloadStatus, RowToken};
use toklabs_engine::paths::AppPaths;
use toklabs_engine::pool::WorkerPool;
use toklabs_engine::task_log::{prune_task_logs, TaskLogRetentionPolicy, TaskLogWriter};
use toklabs_engine::ytdlp::YtDlpCli;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut yt_dlp: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut resolution: Option<String> = None;
    let mut audio_format: Option<String> = None;
    let mut bitrate: Option<String> = None;
    let mut proxy: Option<String> = None;
    let mut concurrency: Option<usize> = None;
    let mut playlist = false;
    let mut subtitles = false;
    let mut verbose = false;
    let mut urls: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => base_dir = Some(PathBuf::from(value(&args, &mut i, "--base-dir")?)),
            "--yt-dlp" => yt_dlp = Some(PathBuf::from(value(&args, &mut i, "--yt-dlp")?)),
            "--output" | "-o" => output = Some(PathBuf::from(value(&args, &mut i, "--output")?)),
            "--resolution" => resolution = Some(value(&args, &mut i, "--resolution")?),
            "--audio" => audio_format = Some(value(&args, &mut i, "--audio")?),
            "--bitrate" => bitrate = Some(value(&args, &mut i, "--bitrate")?),
            "--proxy" => proxy = Some(value(&args, &mut i, "--proxy")?),
            "--concurrency" => {
                let v = value(&args, &mut i, "--concurrency")?;
                concurrency = Some(
                    v.parse()
                        .map_err(|_| format!("--concurrency expects a number, got {v:?}"))?,
                );
            }
            "--playlist" => playlist = true,
            "--subtitles" => subtitles = true,
            "--verbose" | "-v" => verbose = true,
            other if other.starts_with('-') => return Err(format!("unknown arg: {other} (try --help)")),
            url => urls.push(url.to_string()),
        }
        i += 1;
    }

    if urls.is_empty() {
        return Err("nothing to do (pass one or more URLs)".to_string());
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;

    let mut engine_config: EngineConfig = config::load_engine_config(&paths).map_err(|e| e.to_string())?;
    if let Some(n) = concurrency {
        engine_config.max_concurrency = n;
    }

    let retention = TaskLogRetentionPolicy::default();
    if let Err(e) = prune_task_logs(&paths, &retention) {
        eprintln!("warning: failed to prune task logs: {e}");
    }

    let engine = match yt_dlp {
        Some(program) => YtDlpCli::new(program),
        None => YtDlpCli::default(),
    };
    let version = engine.version().map_err(|e| e.to_string())?;
    let history = SqliteHistory::new(paths.clone()).map_err(|e| e.to_string())?;

    let bus = EventBus::new();
    let _task_logs = TaskLogWriter::new(paths.clone(), retention).attach(&bus);
    let (_console, events) = bus.subscribe_channel(None);

    let destination = output.unwrap_or_else(|| paths.default_download_dir());
    let ctx = EngineContext::new(
        paths.clone(),
        engine_config.clone(),
        Arc::new(engine),
        Arc::new(history),
        bus,
    );
    let pool = WorkerPool::new(Arc::new(ctx));

    println!("Base dir: {}", paths.base_dir.to_string_lossy());
    println!("yt-dlp: {version}");
    println!("Downloading to: {}", destination.to_string_lossy());
    println!("Concurrency: {}", pool.concurrency_limit());

    let mut submitted = 0_usize;
    for (row, url) in urls.iter().enumerate() {
        let mut request = match audio_format.as_deref() {
            Some(fmt) => DownloadRequest::audio(url.clone(), fmt, destination.clone())
                .with_audio_bitrate(bitrate.clone().unwrap_or_else(|| engine_config.default_audio_bitrate.clone())),
            None => engine_config.default_request(url.clone(), destination.clone()),
        };
        if let Some(res) = resolution.as_deref() {
            request.resolution = res.to_string();
        }
        if let Some(p) = proxy.as_deref() {
            request = request.with_proxy(p);
        }
        request = request.with_playlist(playlist).with_subtitles(subtitles);

        match pool.submit(request, Some(RowToken(row as u64))) {
            Ok(_) => submitted += 1,
            Err(e) => eprintln!("[{row}] rejected {url}: {e}"),
        }
    }

    let mut failed = 0_usize;
    let mut finished = 0_usize;
    while finished < submitted {
        let event = match events.recv_timeout(Duration::from_secs(3600)) {
            Ok(event) => event,
            Err(_) => break,
        };
        let row = event.task.row.map(|r| r.0).unwrap_or_default();
        match event.payload {
            EventPayload::StatusChanged { status } => println!("[{row}] {status}"),
            EventPayload::InfoExtracted { info } => println!("[{row}] {} ({})", info.title, info.channel),
            EventPayload::LogMessage { text, level } => {
                if verbose || matches!(level, LogLevel::Warning | LogLevel::Error) {
                    println!("[{row}] {}: {text}", level.as_str());
                }
            }
            EventPayload::ProgressUpdated { .. } => {}
            EventPayload::Completed { status, .. } => {
                finished += 1;
                if status != DownloadStatus::Completed {
                    failed += 1;
                }
            }
        }
    }

    pool.shutdown(Duration::from_secs(30));
    let succeeded = finished - failed;
    println!("Done: {succeeded} succeeded, {failed} failed or cancelled");
    if succeeded < urls.len() {
        return Err(format!(
            "{} of {} downloads did not complete",
            urls.len() - succeeded,
            urls.len()
        ));
    }
    Ok(())
}

fn value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("TOKLABS_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("toklabs"));
            }
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".toklabs"))
}

fn print_help() {
    println!(
        r#"toklabs_download

Downloads one or more URLs through yt-dlp, running up to N downloads at once.

Usage:
  cargo run --bin toklabs_download -- https://youtu.be/<id> [more urls...]
  cargo run --bin toklabs_download -- --audio mp3 --bitrate 192 https://youtu.be/<id>

Options:
  --base-dir <path>      Override base dir (default: $TOKLABS_BASE_DIR or ~/.toklabs)
  --yt-dlp <path>        yt-dlp executable (default: yt-dlp on PATH)
  -o, --output <dir>     Destination directory (default: <base-dir>/downloads)
  --resolution <label>   144p .. 4320p (default from config/engine.json)
  --audio <format>       Audio only, in the given format (mp3, m4a, opus, ...)
  --bitrate <kbps>       Audio bitrate, 64..320
  --proxy <uri>          scheme://host:port
  --concurrency <n>      Parallel downloads, 1..16
  --playlist             Treat URLs as playlists (first entry only)
  --subtitles            Also download subtitles
  -v, --verbose          Print every engine log line
"#
    );
}
