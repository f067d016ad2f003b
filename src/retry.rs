//! Failure classification and the remedial adjustments applied before the
//! single retry a task is allowed.

use crate::engine::EngineFailure;
use crate::options::{EngineOptions, VIDEO_REMUXER_PP};
use serde_json::json;
use std::fmt;
use std::time::Duration;

const RENAME_SIGNATURES: [&str; 1] = ["unable to rename file"];
const AUDIO_CODEC_SIGNATURES: [&str; 1] = ["unable to obtain file audio codec"];
const FORMAT_SIGNATURES: [&str; 3] = [
    "requested format is not available",
    "requested format not available",
    "no video formats found",
];

pub const AUDIO_REENCODE_ARGS: [&str; 7] = ["-ar", "48000", "-ac", "2", "-b:a", "320k", "-vn"];
pub const FALLBACK_FORMAT: &str = "best";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryVariant {
    /// Destination file transiently locked by another process.
    RenameContention,
    AudioCodecUnresolved,
    FormatUnavailable,
}

impl RetryVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryVariant::RenameContention => "rename_contention",
            RetryVariant::AudioCodecUnresolved => "audio_codec_unresolved",
            RetryVariant::FormatUnavailable => "format_unavailable",
        }
    }
}

impl fmt::Display for RetryVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable(RetryVariant),
    Cancelled,
    Fatal,
}

/// Cancellation wins over any signature match.
pub fn classify_failure(failure: &EngineFailure, cancel_requested: bool) -> FailureClass {
    if cancel_requested {
        return FailureClass::Cancelled;
    }
    let msg = failure.message.to_ascii_lowercase();
    if matches_any(&msg, &RENAME_SIGNATURES) {
        FailureClass::Retryable(RetryVariant::RenameContention)
    } else if matches_any(&msg, &AUDIO_CODEC_SIGNATURES) {
        FailureClass::Retryable(RetryVariant::AudioCodecUnresolved)
    } else if matches_any(&msg, &FORMAT_SIGNATURES) {
        FailureClass::Retryable(RetryVariant::FormatUnavailable)
    } else {
        FailureClass::Fatal
    }
}

fn matches_any(message: &str, signatures: &[&str]) -> bool {
    signatures.iter().any(|sig| message.contains(sig))
}

/// What the executor does before re-entering the transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct Remedy {
    pub variant: RetryVariant,
    pub backoff: Duration,
    pub options: EngineOptions,
    /// Human-readable summary of the adjustment, logged at warning level.
    pub note: String,
}

/// Builds the adjusted options for `variant` from the options of the failed
/// attempt.
pub fn remedy_for(variant: RetryVariant, failed: &EngineOptions, rename_backoff: Duration) -> Remedy {
    let mut options = failed.clone();
    let (backoff, note) = match variant {
        RetryVariant::RenameContention => (
            rename_backoff,
            format!(
                "destination file locked; retrying in {} ms with identical options",
                rename_backoff.as_millis()
            ),
        ),
        RetryVariant::AudioCodecUnresolved => {
            options.set("postprocessor_args", json!(AUDIO_REENCODE_ARGS));
            (
                Duration::ZERO,
                format!(
                    "audio codec could not be determined; retrying with explicit re-encode ({})",
                    AUDIO_REENCODE_ARGS.join(" ")
                ),
            )
        }
        RetryVariant::FormatUnavailable => {
            let original = failed.get_str("format").unwrap_or("<engine default>").to_string();
            options.set("format", FALLBACK_FORMAT);
            options.remove("format_sort");
            options.remove("merge_output_format");
            options.remove("final_ext");
            options.remove_postprocessor(VIDEO_REMUXER_PP);
            (
                Duration::ZERO,
                format!("requested format unavailable; falling back from {original:?} to {FALLBACK_FORMAT:?}"),
            )
        }
    };
    Remedy {
        variant,
        backoff,
        options,
        note,
    }
}

/// One retry per task, regardless of variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryBudget {
    used: Option<RetryVariant>,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used(&self) -> Option<RetryVariant> {
        self.used
    }

    pub fn is_spent(&self) -> bool {
        self.used.is_some()
    }

    /// Returns false once the single retry has been taken.
    pub fn try_consume(&mut self, variant: RetryVariant) -> bool {
        if self.used.is_some() {
            return false;
        }
        self.used = Some(variant);
        true
    }
}
