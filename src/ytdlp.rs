//! [`ExtractionEngine`] backed by the yt-dlp command line.
//!
//! Output is read on helper threads and handed back over a channel, so every
//! [`EngineSink`] callback happens on the thread that called into the engine.
//! There is no timeout: a child that never prints and never exits blocks the
//! calling worker until it is killed externally.

use crate::engine::{EngineFailure, EngineResult, EngineSink, ExtractionEngine, ProgressControl, ProgressUpdate};
use crate::events::LogLevel;
use crate::models::RawMetadata;
use crate::options::{EngineOptions, EXTRACT_AUDIO_PP, VIDEO_REMUXER_PP};
use crate::{EngineError, Result};
use regex::Regex;
use serde_json::Value;
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;

const PROGRESS_PREFIX: &str = "[progress]";
const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s";
const POSTPROCESSOR_TAGS: [&str; 10] = [
    "Merger",
    "ExtractAudio",
    "VideoRemuxer",
    "VideoConvertor",
    "FixupM4a",
    "FixupM3u8",
    "FixupStretched",
    "EmbedSubtitle",
    "Metadata",
    "MoveFiles",
];

static HTTP_ERROR_RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct YtDlpCli {
    program: PathBuf,
    prefix_args: Vec<String>,
}

impl Default for YtDlpCli {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl YtDlpCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    /// Runs yt-dlp as a module of the given interpreter, e.g. `python3 -m yt_dlp`.
    pub fn python_module(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            program: interpreter.into(),
            prefix_args: vec!["-m".to_string(), "yt_dlp".to_string()],
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// `yt-dlp --version`, used to check the tool is installed.
    pub fn version(&self) -> Result<String> {
        let tool = self.program.to_string_lossy().to_string();
        let output = self
            .command()
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing { tool: tool.clone() },
                _ => EngineError::Io(e),
            })?;
        if !output.status.success() {
            return Err(EngineError::ExternalToolFailed {
                tool,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn command(&self) -> Command {
        let mut cmd = background_command(&self.program);
        cmd.args(&self.prefix_args);
        cmd
    }

    fn run(&self, args: Vec<String>, mode: RunMode, sink: &mut dyn EngineSink) -> EngineResult<RunOutput> {
        let mut cmd = self.command();
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                "ExternalToolMissing"
            } else {
                "SpawnError"
            };
            EngineFailure::new(format!("could not start {}: {e}", self.program.display())).with_type(kind)
        })?;

        let (tx, rx) = mpsc::channel::<(Stream, String)>();
        let readers = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => [
                spawn_line_reader(stdout, Stream::Stdout, tx.clone()),
                spawn_line_reader(stderr, Stream::Stderr, tx),
            ],
            _ => {
                kill_child_process_tree(&mut child);
                return Err(EngineFailure::new("yt-dlp output pipes missing").with_type("SpawnError"));
            }
        };

        let mut out = RunOutput::default();
        for (stream, line) in rx {
            if out.aborted {
                continue;
            }
            match (mode, stream) {
                (RunMode::Capture, Stream::Stdout) => {
                    out.stdout.push_str(&line);
                    out.stdout.push('\n');
                }
                (RunMode::Progress, Stream::Stdout) if line.starts_with(PROGRESS_PREFIX) => {
                    if let Some(update) = parse_progress_line(&line) {
                        if sink.progress(update) == ProgressControl::Abort {
                            kill_child_process_tree(&mut child);
                            out.aborted = true;
                        }
                    }
                }
                _ => {
                    let level = line_level(&line);
                    if level == LogLevel::Error {
                        out.error_lines.push(line.clone());
                    }
                    if let Some(step) = postprocessor_step(&line) {
                        sink.post_processing(step);
                    }
                    sink.log(level, &line);
                }
            }
        }
        for handle in readers {
            let _ = handle.join();
        }

        let status = child
            .wait()
            .map_err(|e| EngineFailure::new(format!("failed waiting for yt-dlp: {e}")))?;
        out.status = Some(status);
        Ok(out)
    }
}

impl ExtractionEngine for YtDlpCli {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn resolve_metadata(
        &self,
        url: &str,
        options: &EngineOptions,
        sink: &mut dyn EngineSink,
    ) -> EngineResult<Option<RawMetadata>> {
        let mut args = vec!["-J".to_string()];
        args.extend(options_to_args(options));
        args.push("--".to_string());
        args.push(url.to_string());

        let out = self.run(args, RunMode::Capture, sink)?;
        if !out.succeeded() {
            return Err(failure_from_output(&out));
        }
        parse_metadata(&out.stdout)
    }

    fn transfer(&self, url: &str, options: &EngineOptions, sink: &mut dyn EngineSink) -> EngineResult<()> {
        let mut args = vec![
            "--newline".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
        ];
        args.extend(options_to_args(options));
        args.push("--".to_string());
        args.push(url.to_string());

        let out = self.run(args, RunMode::Progress, sink)?;
        if out.aborted {
            return Err(EngineFailure::aborted());
        }
        if !out.succeeded() {
            return Err(failure_from_output(&out));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Collect stdout (JSON dump).
    Capture,
    /// Parse progress lines from stdout.
    Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct RunOutput {
    status: Option<ExitStatus>,
    stdout: String,
    error_lines: Vec<String>,
    aborted: bool,
}

impl RunOutput {
    fn succeeded(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }
}

fn spawn_line_reader<R>(stream: R, tag: Stream, tx: mpsc::Sender<(Stream, String)>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        // Drain to EOF whatever the bytes are; a reader that stops early
        // leaves yt-dlp to die on a closed pipe.
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::new();
        let mut forwarding = true;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(stream = ?tag, error = %e, "failed reading yt-dlp output");
                    break;
                }
            }
            if !forwarding {
                continue;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if tx.send((tag, line.to_string())).is_err() {
                forwarding = false;
            }
        }
    })
}

fn background_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Keep console windows from popping up while yt-dlp runs.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

fn kill_child_process_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = background_command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .status();
    }

    let _ = child.kill();
}

/// Translates engine options into yt-dlp flags. Keys without a CLI
/// counterpart are skipped.
pub fn options_to_args(options: &EngineOptions) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    for (key, value) in options.iter() {
        match (key.as_str(), value) {
            ("cookiefile", Value::String(p)) => flag(&mut args, "--cookies", Some(p.clone())),
            ("quiet", Value::Bool(true)) => flag(&mut args, "--quiet", None),
            ("no_warnings", Value::Bool(true)) => flag(&mut args, "--no-warnings", None),
            ("socket_timeout", v) => flag(&mut args, "--socket-timeout", scalar(v)),
            ("updatetime", Value::Bool(false)) => flag(&mut args, "--no-mtime", None),
            ("geo_bypass", Value::Bool(true)) => flag(&mut args, "--geo-bypass", None),
            ("geo_bypass_country", v) => flag(&mut args, "--geo-bypass-country", scalar(v)),
            ("force_ipv4", Value::Bool(true)) => flag(&mut args, "--force-ipv4", None),
            ("retries", v) => flag(&mut args, "--retries", scalar(v)),
            ("fragment_retries", v) => flag(&mut args, "--fragment-retries", scalar(v)),
            ("file_access_retries", v) => flag(&mut args, "--file-access-retries", scalar(v)),
            ("retry_sleep", v) => flag(&mut args, "--retry-sleep", scalar(v)),
            ("ffmpeg_location", v) => flag(&mut args, "--ffmpeg-location", scalar(v)),
            ("noplaylist", Value::Bool(true)) => flag(&mut args, "--no-playlist", None),
            ("noplaylist", Value::Bool(false)) => flag(&mut args, "--yes-playlist", None),
            ("skip_download", Value::Bool(true)) => flag(&mut args, "--skip-download", None),
            ("playlist_items", v) => flag(&mut args, "--playlist-items", scalar(v)),
            ("outtmpl", v) => flag(&mut args, "--output", scalar(v)),
            ("proxy", v) => flag(&mut args, "--proxy", scalar(v)),
            ("writesubtitles", Value::Bool(true)) => flag(&mut args, "--write-subs", None),
            ("allsubtitles", Value::Bool(true)) => flag(&mut args, "--sub-langs", Some("all".to_string())),
            ("format", v) => flag(&mut args, "--format", scalar(v)),
            ("format_sort", Value::Array(fields)) => {
                let joined: Vec<String> = fields.iter().filter_map(scalar).collect();
                flag(&mut args, "--format-sort", Some(joined.join(",")));
            }
            ("prefer_free_formats", Value::Bool(true)) => flag(&mut args, "--prefer-free-formats", None),
            ("merge_output_format", v) => flag(&mut args, "--merge-output-format", scalar(v)),
            ("postprocessor_args", Value::Array(parts)) => {
                let joined: Vec<String> = parts.iter().filter_map(scalar).collect();
                flag(&mut args, "--postprocessor-args", Some(format!("ffmpeg:{}", joined.join(" "))));
            }
            ("postprocessors", Value::Array(pps)) => {
                for pp in pps {
                    postprocessor_args(&mut args, pp);
                }
            }
            _ => {}
        }
    }
    args
}

fn flag(args: &mut Vec<String>, name: &str, value: Option<String>) {
    args.push(name.to_string());
    if let Some(v) = value {
        args.push(v);
    }
}

fn postprocessor_args(args: &mut Vec<String>, pp: &Value) {
    let key = pp.get("key").and_then(Value::as_str).unwrap_or_default();
    if key == EXTRACT_AUDIO_PP {
        args.push("--extract-audio".to_string());
        let codec = pp.get("preferredcodec").and_then(Value::as_str).unwrap_or("best");
        args.push("--audio-format".to_string());
        args.push(if codec == "copy" { "best" } else { codec }.to_string());
        if let Some(quality) = pp.get("preferredquality").and_then(scalar) {
            args.push("--audio-quality".to_string());
            args.push(format!("{quality}K"));
        }
    } else if key == VIDEO_REMUXER_PP {
        if let Some(fmt) = pp.get("preferedformat").and_then(Value::as_str) {
            args.push("--remux-video".to_string());
            args.push(fmt.to_string());
        }
    } else {
        tracing::debug!(postprocessor = key, "no CLI mapping for postprocessor");
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses a line printed through `PROGRESS_TEMPLATE`. Unknown values are
/// printed by yt-dlp as `NA`.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.strip_prefix(PROGRESS_PREFIX)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let num = |s: &str| s.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0);

    let downloaded = num(fields[0])? as u64;
    let total = num(fields[1]).or_else(|| num(fields[2])).map(|v| v as u64);
    Some(ProgressUpdate {
        downloaded_bytes: downloaded,
        total_bytes: total,
        speed_bps: num(fields[3]).unwrap_or(0.0),
        eta_secs: num(fields[4]).map(|v| v as u64).unwrap_or(0),
    })
}

fn line_level(line: &str) -> LogLevel {
    if line.starts_with("ERROR:") {
        LogLevel::Error
    } else if line.starts_with("WARNING:") {
        LogLevel::Warning
    } else if line.starts_with("[debug]") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

fn postprocessor_step(line: &str) -> Option<&str> {
    let tag = line.strip_prefix('[')?.split(']').next()?;
    POSTPROCESSOR_TAGS.iter().copied().find(|t| *t == tag)
}

fn http_status(text: &str) -> Option<u16> {
    let re = match HTTP_ERROR_RE.get_or_init(|| Regex::new(r"(?i)HTTP Error (\d{3})")) {
        Ok(re) => re,
        Err(e) => {
            tracing::warn!(error = %e, "HTTP status pattern failed to compile");
            return None;
        }
    };
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

fn failure_from_output(out: &RunOutput) -> EngineFailure {
    let code = out.status.and_then(|s| s.code());
    failure_from_lines(&out.error_lines, code)
}

fn failure_from_lines(error_lines: &[String], code: Option<i32>) -> EngineFailure {
    let message = if error_lines.is_empty() {
        match code {
            Some(c) => format!("yt-dlp exited with code {c}"),
            None => "yt-dlp was terminated by a signal".to_string(),
        }
    } else {
        error_lines
            .iter()
            .map(|l| l.trim_start_matches("ERROR:").trim())
            .collect::<Vec<_>>()
            .join("\n")
    };
    let mut failure = EngineFailure::new(message).with_type("DownloadError");
    if let Some(status) = http_status(&failure.message) {
        failure = failure.with_type("HTTPError").with_http_status(status);
    }
    failure
}

fn parse_metadata(stdout: &str) -> EngineResult<Option<RawMetadata>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    serde_json::from_str::<RawMetadata>(trimmed)
        .map(Some)
        .map_err(|e| EngineFailure::new(format!("could not parse yt-dlp metadata: {e}")).with_type("JSONDecodeError"))
}
