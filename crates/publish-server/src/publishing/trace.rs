//! Curated failure traces
//!
//! A full backtrace is mostly async runtime and std frames. The import log
//! keeps the top frame plus a handful of frames from our own crates, with
//! memory addresses removed.

use regex::Regex;
use std::backtrace::BacktraceStatus;
use std::sync::OnceLock;

/// Frames from these paths never make it into the log.
const DENY_LIST: &[&str] = &[
    "tokio::",
    "core::",
    "std::",
    "alloc::",
    "anyhow::",
    "futures_util::",
    "__rust_begin_short_backtrace",
];

/// Marker for frames that belong to this workspace.
const OWN_CODE: &str = "publish_";

/// Frames kept in addition to the first one.
pub const MAX_EXTRA_FRAMES: usize = 5;

/// Failure message with the frames worth showing an operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CuratedTrace {
    pub summary: String,
    pub frames: Vec<String>,
}

fn address_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\s*\(?0x[0-9a-fA-F]+\)?").ok())
        .as_ref()
}

fn registry_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"at \S*/\.cargo/registry/src/[^/]+/").ok())
        .as_ref()
}

/// Remove anything that looks like a memory address.
pub fn strip_addresses(text: &str) -> String {
    match address_pattern() {
        Some(pattern) => pattern.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Split `std::backtrace::Backtrace` output into one string per frame,
/// joining each symbol line with its `at file:line` line.
pub fn parse_frames(backtrace: &str) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();

    for line in backtrace.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match trimmed.split_once(": ") {
            Some((index, symbol)) if index.chars().all(|c| c.is_ascii_digit()) => {
                frames.push(symbol.to_string());
            },
            _ => {
                if let Some(last) = frames.last_mut() {
                    let location = match registry_pattern() {
                        Some(pattern) => pattern.replace(trimmed, "at crate:").into_owned(),
                        None => trimmed.to_string(),
                    };
                    last.push(' ');
                    last.push_str(&location);
                }
            },
        }
    }

    frames
}

/// First frame, then up to [`MAX_EXTRA_FRAMES`] of our own frames.
pub fn curate_frames(frames: &[String]) -> Vec<String> {
    let Some((first, rest)) = frames.split_first() else {
        return Vec::new();
    };

    let mut kept = vec![strip_addresses(first)];
    kept.extend(
        rest.iter()
            .filter(|frame| frame.contains(OWN_CODE))
            .filter(|frame| !DENY_LIST.iter().any(|denied| frame.starts_with(denied)))
            .take(MAX_EXTRA_FRAMES)
            .map(|frame| strip_addresses(frame)),
    );
    kept
}

/// Build the trace for an error. Without a captured backtrace (the default
/// unless `RUST_BACKTRACE` is set) the error's cause chain stands in for it.
pub fn curate(err: &anyhow::Error) -> CuratedTrace {
    let summary = strip_addresses(&format!("{:#}", err));

    let backtrace = err.backtrace();
    let frames = if backtrace.status() == BacktraceStatus::Captured {
        curate_frames(&parse_frames(&backtrace.to_string()))
    } else {
        err.chain()
            .take(MAX_EXTRA_FRAMES + 1)
            .map(|cause| strip_addresses(&cause.to_string()))
            .collect()
    };

    CuratedTrace { summary, frames }
}
