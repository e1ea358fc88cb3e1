//! Job planning.
//!
//! Cross-products tasks × widths × sources, resolves each output's identity
//! and classifies it against the cache and the filesystem:
//!
//! | Classification | Meaning | Job? |
//! |---|---|---|
//! | `Satisfied` | recorded under the active checksum and still present | no |
//! | `Stale` | recorded, but the file is gone or the inline payload is malformed | yes |
//! | `Needed` | never recorded (or recorded under another checksum / path) | yes |
//!
//! A file that exists on disk without a record is `Needed`: the cache is the
//! only proof of which bytes and settings produced it.
//!
//! Which tasks apply depends on the source: a source at or below the inline
//! task's `inline_below` gets only the inline output (at its first planned
//! width); every other source gets every file-backed task. Widths above the
//! source's intrinsic width are never planned.
//!
//! Ordering is task-declaration order, then width ascending, then source
//! discovery order.

use crate::cache::{CacheStats, DerivationCache};
use crate::config::{Config, TaskConfig};
use crate::imaging::planned_widths;
use crate::naming::{OutputDescriptor, Resolver};
use crate::source::SourceImage;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Satisfied,
    Stale,
    Needed,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Satisfied => write!(f, "satisfied"),
            Classification::Stale => write!(f, "stale"),
            Classification::Needed => write!(f, "needed"),
        }
    }
}

/// One output the task set calls for, with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOutput {
    /// Index into the source list the plan was built from.
    pub source: usize,
    /// Index into the configured task list.
    pub task: usize,
    pub descriptor: OutputDescriptor,
    pub classification: Classification,
}

impl PlannedOutput {
    pub fn is_job(&self) -> bool {
        self.classification != Classification::Satisfied
    }
}

/// Every planned output in job order.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub outputs: Vec<PlannedOutput>,
}

impl Plan {
    /// Outputs that must be produced, in order.
    pub fn jobs(&self) -> impl Iterator<Item = &PlannedOutput> {
        self.outputs.iter().filter(|o| o.is_job())
    }

    pub fn job_count(&self) -> usize {
        self.jobs().count()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for output in &self.outputs {
            match output.classification {
                Classification::Satisfied => stats.satisfied += 1,
                Classification::Stale => stats.stale += 1,
                Classification::Needed => stats.needed += 1,
            }
        }
        stats
    }
}

/// Widths of `task` that apply to `source`; empty when the task does not.
pub fn task_widths(config: &Config, task: &TaskConfig, source: &SourceImage) -> Vec<u32> {
    let inline_source = config.is_inline_source(source.size);
    match (task.is_inline(), inline_source) {
        (true, true) => planned_widths(&task.sizes, source.width)
            .into_iter()
            .take(1)
            .collect(),
        (false, false) => planned_widths(&task.sizes, source.width),
        _ => Vec::new(),
    }
}

/// Classify one descriptor against what the cache holds for its source.
pub fn classify(
    cache: &DerivationCache,
    source: &SourceImage,
    descriptor: &OutputDescriptor,
) -> Classification {
    let Some(record) = cache.current_record(source) else {
        return Classification::Needed;
    };
    let Some(output) = record.output(&descriptor.task, descriptor.width) else {
        return Classification::Needed;
    };
    if output.is_inline() != descriptor.is_inline() || output.output_path() != descriptor.file() {
        return Classification::Needed;
    }
    if output.is_present() {
        Classification::Satisfied
    } else {
        Classification::Stale
    }
}

/// Build the plan for `sources` under `config`.
pub fn plan(
    config: &Config,
    sources: &[SourceImage],
    cache: &DerivationCache,
    resolver: &Resolver,
) -> Plan {
    let mut outputs = Vec::new();
    for (task_index, task) in config.tasks.iter().enumerate() {
        let mut slots: Vec<(u32, usize)> = sources
            .iter()
            .enumerate()
            .flat_map(|(si, source)| {
                task_widths(config, task, source)
                    .into_iter()
                    .map(move |w| (w, si))
            })
            .collect();
        slots.sort_unstable();

        for (width, source_index) in slots {
            let source = &sources[source_index];
            let descriptor = resolver.resolve(source, task, width);
            let classification = classify(cache, source, &descriptor);
            outputs.push(PlannedOutput {
                source: source_index,
                task: task_index,
                descriptor,
                classification,
            });
        }
    }
    Plan { outputs }
}
