//! Run journal: the explicit log sink threaded through the pipeline.
//!
//! Every stage appends structured [`JournalEvent`]s to a [`Journal`] passed
//! by `&mut`. Each event is also emitted through `tracing` and, when a
//! listener is attached, sent over an `mpsc` channel so the CLI can print
//! progress while the run is still going. At the end of a run the journal is
//! flushed to `<output_path>/<base_url>/YYYY-MM-DD-HHMMSS.log`, one line per
//! event.

use crate::cache::CacheStats;
use chrono::{DateTime, Local};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

/// One thing that happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEvent {
    CacheLoaded {
        path: PathBuf,
        records: usize,
        dropped: usize,
    },
    CacheMissing {
        path: PathBuf,
    },
    /// Unreadable cache file, treated as empty.
    CacheCorrupt {
        path: PathBuf,
        reason: String,
    },
    CacheBypassed,
    ChecksumChanged,
    Downloaded {
        url: String,
        path: PathBuf,
        reused: bool,
    },
    SourceSkipped {
        path: String,
        reason: String,
    },
    Discovered {
        sources: usize,
    },
    Planned {
        stats: CacheStats,
    },
    StaleOutput {
        source: String,
        output: String,
    },
    Created {
        index: usize,
        total: usize,
        source: String,
        task: String,
        width: u32,
        target: String,
    },
    Failed {
        index: usize,
        total: usize,
        source: String,
        task: String,
        width: u32,
        reason: String,
    },
    Unsupported {
        source: String,
        task: String,
        reason: String,
    },
    PersistFailed {
        reason: String,
    },
    Invalidated {
        key: String,
    },
    /// Record of an earlier version of a source that has since changed.
    Superseded {
        key: String,
        source: String,
        files_removed: usize,
    },
    InfoWritten {
        path: PathBuf,
        entries: usize,
    },
    InfoUnchanged {
        path: PathBuf,
    },
    InfoFailed {
        path: PathBuf,
        reason: String,
    },
    Cancelled {
        remaining: usize,
    },
    Done {
        stats: CacheStats,
    },
}

impl JournalEvent {
    /// Failures and recovered errors.
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            JournalEvent::CacheCorrupt { .. }
                | JournalEvent::SourceSkipped { .. }
                | JournalEvent::Failed { .. }
                | JournalEvent::Unsupported { .. }
                | JournalEvent::PersistFailed { .. }
                | JournalEvent::InfoFailed { .. }
        )
    }
}

impl fmt::Display for JournalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use JournalEvent::*;
        match self {
            CacheLoaded {
                path,
                records,
                dropped,
            } => {
                write!(f, "cache loaded: {} ({records} records", path.display())?;
                if *dropped > 0 {
                    write!(f, ", {dropped} unreadable dropped")?;
                }
                write!(f, ")")
            }
            CacheMissing { path } => write!(f, "cache missing: {} (cold start)", path.display()),
            CacheCorrupt { path, reason } => {
                write!(f, "cache unreadable: {} ({reason}), starting cold", path.display())
            }
            CacheBypassed => write!(f, "cache bypassed"),
            ChecksumChanged => write!(f, "configuration changed, cached outputs invalidated"),
            Downloaded { url, path, reused } => {
                let verb = if *reused { "reused" } else { "downloaded" };
                write!(f, "{verb}: {url} -> {}", path.display())
            }
            SourceSkipped { path, reason } => write!(f, "skipped source: {path} ({reason})"),
            Discovered { sources } => write!(f, "discovered {sources} source image(s)"),
            Planned { stats } => write!(
                f,
                "planned: {} satisfied, {} stale, {} needed",
                stats.satisfied, stats.stale, stats.needed
            ),
            StaleOutput { source, output } => write!(f, "stale: {source} {output}"),
            Created {
                index,
                total,
                source,
                task,
                width,
                target,
            } => write!(f, "[{index}/{total}] created {task}@{width} for {source}: {target}"),
            Failed {
                index,
                total,
                source,
                task,
                width,
                reason,
            } => write!(f, "[{index}/{total}] failed {task}@{width} for {source}: {reason}"),
            Unsupported {
                source,
                task,
                reason,
            } => write!(f, "unsupported: {task} for {source}: {reason}"),
            PersistFailed { reason } => write!(f, "cache write failed: {reason}"),
            Invalidated { key } => write!(f, "invalidated cache record {key}"),
            Superseded {
                key,
                source,
                files_removed,
            } => write!(
                f,
                "pruned record {key}: {source} changed ({files_removed} old file(s) removed)"
            ),
            InfoWritten { path, entries } => {
                write!(f, "info written: {} ({entries} entries)", path.display())
            }
            InfoUnchanged { path } => write!(f, "info unchanged: {}", path.display()),
            InfoFailed { path, reason } => {
                write!(f, "info write failed: {} ({reason})", path.display())
            }
            Cancelled { remaining } => write!(f, "cancelled with {remaining} job(s) remaining"),
            Done { stats } => write!(f, "done: {stats}"),
        }
    }
}

/// Append-only ordered list of events.
#[derive(Debug, Default)]
pub struct Journal {
    events: Vec<JournalEvent>,
    listener: Option<Sender<JournalEvent>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also forward every event to `listener`.
    pub fn with_listener(listener: Sender<JournalEvent>) -> Self {
        Self {
            events: Vec::new(),
            listener: Some(listener),
        }
    }

    pub fn push(&mut self, event: JournalEvent) {
        if event.is_problem() {
            tracing::warn!("{event}");
        } else {
            tracing::info!("{event}");
        }
        if let Some(listener) = &self.listener {
            // A gone receiver only means nobody is printing.
            let _ = listener.send(event.clone());
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[JournalEvent] {
        &self.events
    }

    pub fn problems(&self) -> impl Iterator<Item = &JournalEvent> {
        self.events.iter().filter(|e| e.is_problem())
    }

    /// Stop forwarding events; the printer sees its channel close.
    pub fn detach(&mut self) {
        self.listener = None;
    }

    /// Write every event to a dated log file in `dir`.
    pub fn flush(&self, dir: &Path) -> io::Result<PathBuf> {
        self.flush_at(dir, Local::now())
    }

    pub fn flush_at(&self, dir: &Path, at: DateTime<Local>) -> io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(log_file_name(at));
        let mut content = String::new();
        for event in &self.events {
            content.push_str(&event.to_string());
            content.push('\n');
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

/// `YYYY-MM-DD-HHMMSS.log`
pub fn log_file_name(at: DateTime<Local>) -> String {
    format!("{}.log", at.format("%Y-%m-%d-%H%M%S"))
}
