//! End-to-end orchestration.
//!
//! ```text
//! validate → lock → discover/fetch → load cache → plan → run → aggregate → publish → flush journal
//! ```
//!
//! Only configuration errors, an empty discovery and failure to lock the
//! cache end a run with `Err`. Everything recoverable (unreadable cache,
//! failed transcodes, failed writes) is journaled and counted in the
//! [`RunSummary`].

use crate::aggregate::{ImageInfo, aggregate, merge_by_url, write_info};
use crate::cache::{CacheError, CacheLock, CacheStats, DerivationCache, LoadStatus};
use crate::config::{Config, ConfigError, effective_workers};
use crate::imaging::Transcoder;
use crate::journal::{Journal, JournalEvent};
use crate::naming::{PathFn, Resolver};
use crate::plan::{Classification, Plan, plan, task_widths};
use crate::run::{CancelToken, Runner};
use crate::source::{SourceImage, discover_files, fetch_remote};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("No source images found")]
    DiscoveryEmpty,
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Per-invocation switches.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// `false` starts from an empty cache (everything is re-encoded).
    pub use_cache: bool,
    pub cancel: CancelToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            cancel: CancelToken::new(),
        }
    }
}

/// Outcome of a full run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub sources: usize,
    pub stats: CacheStats,
    pub info_written: usize,
    pub persist_failures: usize,
    pub cancelled: bool,
    pub log_file: Option<PathBuf>,
}

/// Sources and their classified outputs, without running anything.
#[derive(Debug)]
pub struct PlanReport {
    pub sources: Vec<SourceImage>,
    pub plan: Plan,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    transcoder: &'a dyn Transcoder,
    resolver: Resolver,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, transcoder: &'a dyn Transcoder) -> Self {
        Self {
            config,
            transcoder,
            resolver: Resolver::new(config),
        }
    }

    /// Route outputs through a custom path function.
    pub fn with_path_fn(mut self, path_fn: PathFn) -> Self {
        self.resolver = self.resolver.with_path_fn(path_fn);
        self
    }

    /// Discover, plan, transcode what is missing, publish info records.
    pub fn run(
        &self,
        options: &RunOptions,
        journal: &mut Journal,
    ) -> Result<RunSummary, PipelineError> {
        self.config.validate()?;
        let _lock = CacheLock::acquire(&self.config.cache_path())?;

        let sources = self.collect_sources(journal);
        if sources.is_empty() {
            self.flush(journal);
            return Err(PipelineError::DiscoveryEmpty);
        }

        let mut cache = self.open_cache(options.use_cache, journal);
        if cache.checksum_changed()
            && let Err(e) = cache.persist()
        {
            journal.push(JournalEvent::PersistFailed {
                reason: e.to_string(),
            });
        }

        match cache.prune_superseded(&sources) {
            Ok(pruned) => {
                for record in pruned {
                    journal.push(JournalEvent::Superseded {
                        key: record.key,
                        source: record.origin,
                        files_removed: record.files_removed,
                    });
                }
            }
            Err(e) => journal.push(JournalEvent::PersistFailed {
                reason: e.to_string(),
            }),
        }

        let plan = plan(self.config, &sources, &cache, &self.resolver);
        journal.push(JournalEvent::Planned { stats: plan.stats() });
        for output in plan.outputs.iter().filter(|o| o.classification == Classification::Stale) {
            journal.push(JournalEvent::StaleOutput {
                source: sources[output.source].name.clone(),
                output: output.descriptor.to_string(),
            });
        }

        let runner = Runner {
            transcoder: self.transcoder,
            tasks: &self.config.tasks,
            workers: effective_workers(self.config),
            cancel: options.cancel.clone(),
        };
        let report = runner.run(&plan, &sources, &mut cache, journal);

        let info_written = self.publish(&sources, &cache, journal);

        let mut stats = plan.stats();
        stats.failed = report.failed as u32;
        journal.push(JournalEvent::Done { stats });

        let log_file = self.flush(journal);
        Ok(RunSummary {
            sources: sources.len(),
            stats,
            info_written,
            persist_failures: report.persist_failures,
            cancelled: report.cancelled,
            log_file,
        })
    }

    /// Classify every output without transcoding or writing anything.
    pub fn plan(&self, options: &RunOptions, journal: &mut Journal) -> Result<PlanReport, PipelineError> {
        self.config.validate()?;
        let sources = self.collect_sources(journal);
        if sources.is_empty() {
            return Err(PipelineError::DiscoveryEmpty);
        }
        let cache = self.open_cache(options.use_cache, journal);
        let plan = plan(self.config, &sources, &cache, &self.resolver);
        journal.push(JournalEvent::Planned { stats: plan.stats() });
        Ok(PlanReport { sources, plan })
    }

    /// Keys of cache records that reference missing or malformed outputs.
    pub fn verify(&self) -> Result<BTreeSet<String>, PipelineError> {
        self.config.validate()?;
        Ok(DerivationCache::open(self.config).verify())
    }

    /// Drop every record [`verify`](Self::verify) flags, then run.
    pub fn rebuild(
        &self,
        options: &RunOptions,
        journal: &mut Journal,
    ) -> Result<RunSummary, PipelineError> {
        self.config.validate()?;
        {
            let _lock = CacheLock::acquire(&self.config.cache_path())?;
            let mut cache = DerivationCache::open(self.config);
            for key in cache.verify() {
                match cache.remove(&key) {
                    Ok(_) => journal.push(JournalEvent::Invalidated { key }),
                    Err(e) => journal.push(JournalEvent::PersistFailed {
                        reason: e.to_string(),
                    }),
                }
            }
        }
        self.run(options, journal)
    }

    fn open_cache(&self, use_cache: bool, journal: &mut Journal) -> DerivationCache {
        if !use_cache {
            journal.push(JournalEvent::CacheBypassed);
            return DerivationCache::open_bypassed(self.config);
        }
        let cache = DerivationCache::open(self.config);
        let path = cache.path().to_path_buf();
        match cache.status() {
            LoadStatus::Missing => journal.push(JournalEvent::CacheMissing { path }),
            LoadStatus::Corrupt(reason) => journal.push(JournalEvent::CacheCorrupt {
                path,
                reason: reason.clone(),
            }),
            LoadStatus::Loaded { records, dropped } => journal.push(JournalEvent::CacheLoaded {
                path,
                records: *records,
                dropped: *dropped,
            }),
            LoadStatus::Bypassed => journal.push(JournalEvent::CacheBypassed),
        }
        if cache.checksum_changed() {
            journal.push(JournalEvent::ChecksumChanged);
        }
        cache
    }

    /// Local files first (discovery order), then remote sources in
    /// configured order. Sources that would share output file names (same
    /// content hash, or same stem under basename naming) are processed once;
    /// the first one wins.
    fn collect_sources(&self, journal: &mut Journal) -> Vec<SourceImage> {
        let mut loaded = Vec::new();
        for path in discover_files(self.config) {
            match SourceImage::load(&path, self.transcoder) {
                Ok(source) => loaded.push(source),
                Err(e) => journal.push(JournalEvent::SourceSkipped {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        for url in &self.config.remote_sources {
            let fetched = fetch_remote(url, &self.config.output_path).and_then(|(path, downloaded)| {
                journal.push(JournalEvent::Downloaded {
                    url: url.clone(),
                    path: path.clone(),
                    reused: !downloaded,
                });
                SourceImage::load_remote(&path, url, self.transcoder)
            });
            match fetched {
                Ok(source) => loaded.push(source),
                Err(e) => journal.push(JournalEvent::SourceSkipped {
                    path: url.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        let mut seen = HashSet::new();
        let mut sources = Vec::new();
        for source in loaded {
            let token = self.resolver.output_token(&source).to_string();
            if seen.insert(token.clone()) {
                sources.push(source);
            } else {
                journal.push(JournalEvent::SourceSkipped {
                    path: source.origin(),
                    reason: format!("output names collide with an earlier source ({token})"),
                });
            }
        }
        journal.push(JournalEvent::Discovered {
            sources: sources.len(),
        });
        sources
    }

    /// Aggregate every source's present outputs and write info records.
    fn publish(
        &self,
        sources: &[SourceImage],
        cache: &DerivationCache,
        journal: &mut Journal,
    ) -> usize {
        let mut infos: Vec<ImageInfo> = Vec::new();
        let mut paths: BTreeMap<String, PathBuf> = BTreeMap::new();

        for source in sources {
            let Some(record) = cache.current_record(source) else {
                continue;
            };
            let wanted: HashSet<(&str, u32)> = self
                .config
                .tasks
                .iter()
                .flat_map(|task| {
                    task_widths(self.config, task, source)
                        .into_iter()
                        .map(move |w| (task.name.as_str(), w))
                })
                .collect();
            let outputs: Vec<_> = record
                .outputs
                .iter()
                .filter(|o| wanted.contains(&(o.task.as_str(), o.target_width)) && o.is_present())
                .cloned()
                .collect();
            if outputs.is_empty() {
                continue;
            }
            let url = self.resolver.published_url(source);
            paths
                .entry(url.clone())
                .or_insert_with(|| self.resolver.info_path(source));
            infos.extend(aggregate(&url, &self.config.tasks, &outputs));
        }

        let mut written = 0;
        for (url, list) in merge_by_url(infos) {
            let Some(path) = paths.get(&url) else {
                continue;
            };
            match write_info(path, &list) {
                Ok(true) => {
                    written += 1;
                    journal.push(JournalEvent::InfoWritten {
                        path: path.clone(),
                        entries: list.len(),
                    });
                }
                Ok(false) => journal.push(JournalEvent::InfoUnchanged { path: path.clone() }),
                Err(e) => journal.push(JournalEvent::InfoFailed {
                    path: path.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        written
    }

    fn flush(&self, journal: &mut Journal) -> Option<PathBuf> {
        if !self.config.logging {
            return None;
        }
        match journal.flush(&self.config.base_dir()) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "could not write run log");
                None
            }
        }
    }
}
