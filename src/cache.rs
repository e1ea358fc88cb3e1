//! Derivation cache for incremental builds.
//!
//! Transcoding is the bottleneck of the pipeline. This module records every
//! output produced for a source so the next run only schedules what is
//! missing or stale.
//!
//! # Storage
//!
//! One JSON object per output tree, at `<output_path>/<cache_file>`:
//!
//! ```json
//! {
//!   "checksum": "<sha256 of the active task set>",
//!   "<record key>": { "source": {...}, "checksum": "...", "is_inline": false, "outputs": [...] }
//! }
//! ```
//!
//! The record key is the source's content hash or file name, depending on
//! the naming policy. Records are read one by one: a record that fails to
//! parse is dropped (it will simply be rebuilt) and a file that is not a JSON
//! object is treated as a cold cache. Loading never fails.
//!
//! # Validity
//!
//! A record is valid for a source when
//! 1. its checksum matches the active configuration checksum and it was
//!    produced from the same source bytes,
//! 2. no output it references is stale (file gone, or inline payload that is
//!    not a data URI), and
//! 3. every output the task set requires is present: the inline output for
//!    inline sources, otherwise one output per file task per planned width.
//!
//! # Checksum changes
//!
//! Each record carries the checksum it was produced under. When the
//! configuration changes, the top-level checksum is updated on open but no
//! record is deleted; records with the old checksum are simply invalid and
//! get replaced as their sources are reprocessed.
//!
//! # Writes
//!
//! Every mutation rewrites the whole file through a temp file + rename, so a
//! crash leaves either the old or the new content. Single writer: the
//! pipeline holds a [`CacheLock`] for the whole run.

use crate::config::{Config, NamingPolicy, TaskConfig};
use crate::imaging::{Artifact, Transcoded, is_data_uri, planned_widths};
use crate::naming::{OutputDescriptor, record_key};
use crate::source::SourceImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level key holding the configuration checksum.
pub const CHECKSUM_KEY: &str = "checksum";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where a produced output lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredArtifact {
    File { output_path: PathBuf },
    Inline { data: String },
}

/// One produced output with what the transcoder actually reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputResult {
    pub task: String,
    /// Width the output was planned for.
    pub target_width: u32,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub has_alpha: bool,
    #[serde(flatten)]
    pub artifact: StoredArtifact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcset: Option<String>,
}

impl OutputResult {
    pub fn new(descriptor: &OutputDescriptor, transcoded: Transcoded) -> Self {
        let artifact = match transcoded.artifact {
            Artifact::File(output_path) => StoredArtifact::File { output_path },
            Artifact::Inline(data) => StoredArtifact::Inline { data },
        };
        Self {
            task: descriptor.task.clone(),
            target_width: descriptor.width,
            format: transcoded.format,
            width: transcoded.width,
            height: transcoded.height,
            size: transcoded.size,
            has_alpha: transcoded.has_alpha,
            artifact,
            url: descriptor.url.clone(),
            srcset: descriptor.srcset.clone(),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.artifact, StoredArtifact::Inline { .. })
    }

    pub fn output_path(&self) -> Option<&Path> {
        match &self.artifact {
            StoredArtifact::File { output_path } => Some(output_path),
            StoredArtifact::Inline { .. } => None,
        }
    }

    pub fn data(&self) -> Option<&str> {
        match &self.artifact {
            StoredArtifact::Inline { data } => Some(data),
            StoredArtifact::File { .. } => None,
        }
    }

    /// The backing file exists, or the inline payload is a data URI.
    pub fn is_present(&self) -> bool {
        match &self.artifact {
            StoredArtifact::File { output_path } => output_path.is_file(),
            StoredArtifact::Inline { data } => is_data_uri(data),
        }
    }

    fn same_slot(&self, other: &OutputResult) -> bool {
        self.task == other.task && self.target_width == other.target_width
    }
}

/// Everything produced so far for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheRecord {
    pub source: SourceImage,
    /// Configuration checksum the outputs were produced under.
    pub checksum: String,
    pub is_inline: bool,
    pub outputs: Vec<OutputResult>,
}

impl CacheRecord {
    pub fn new(source: SourceImage, checksum: String, is_inline: bool) -> Self {
        Self {
            source,
            checksum,
            is_inline,
            outputs: Vec::new(),
        }
    }

    /// References at least one missing file or malformed inline payload.
    pub fn is_stale(&self) -> bool {
        self.outputs.iter().any(|o| !o.is_present())
    }

    pub fn output(&self, task: &str, target_width: u32) -> Option<&OutputResult> {
        self.outputs
            .iter()
            .find(|o| o.task == task && o.target_width == target_width)
    }

    /// Insert or replace the output for the same `(task, target_width)`.
    pub fn upsert(&mut self, result: OutputResult) {
        match self.outputs.iter_mut().find(|o| o.same_slot(&result)) {
            Some(existing) => *existing = result,
            None => self.outputs.push(result),
        }
    }

    fn merge(&mut self, other: CacheRecord) {
        if self.checksum != other.checksum || self.source.hash != other.source.hash {
            *self = other;
            return;
        }
        self.is_inline = other.is_inline;
        for output in other.outputs {
            self.upsert(output);
        }
    }
}

/// What happened when the cache file was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Missing,
    Loaded { records: usize, dropped: usize },
    Corrupt(String),
    /// Loaded but ignored for classification (`--no-cache`).
    Bypassed,
}

/// The persisted record store.
/// A record dropped by [`DerivationCache::prune_superseded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedRecord {
    pub key: String,
    pub origin: String,
    pub files_removed: usize,
}

#[derive(Debug)]
pub struct DerivationCache {
    path: PathBuf,
    checksum: String,
    stored_checksum: Option<String>,
    records: BTreeMap<String, CacheRecord>,
    tasks: Vec<TaskConfig>,
    inline_below: Option<u64>,
    naming: NamingPolicy,
    status: LoadStatus,
    last_written: Option<String>,
    /// Records loaded from disk are kept (and written back) but never
    /// count as current; only records produced in this session do.
    bypass: bool,
    touched: BTreeSet<String>,
}

impl DerivationCache {
    /// Open the cache for `config`, loading whatever is on disk.
    pub fn open(config: &Config) -> Self {
        let mut cache = Self::empty(config);
        let (stored, records, status, raw) = read_cache_file(&cache.path);
        cache.stored_checksum = stored;
        cache.records = records;
        cache.status = status;
        cache.last_written = raw;
        cache
    }

    /// Open the cache but ignore what it holds for classification.
    ///
    /// Every output is re-encoded. Records of sources this run does not
    /// reach stay on disk untouched.
    pub fn open_bypassed(config: &Config) -> Self {
        let mut cache = Self::open(config);
        cache.bypass = true;
        cache.status = LoadStatus::Bypassed;
        cache
    }

    fn empty(config: &Config) -> Self {
        Self {
            path: config.cache_path(),
            checksum: config.checksum(),
            stored_checksum: None,
            records: BTreeMap::new(),
            tasks: config.tasks.clone(),
            inline_below: config.inline_below(),
            naming: config.naming,
            status: LoadStatus::Missing,
            last_written: None,
            bypass: false,
            touched: BTreeSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The file was written under a different configuration.
    pub fn checksum_changed(&self) -> bool {
        self.stored_checksum
            .as_deref()
            .is_some_and(|stored| stored != self.checksum)
    }

    /// All records currently held.
    pub fn load(&self) -> &BTreeMap<String, CacheRecord> {
        &self.records
    }

    /// Record stored under `key`, valid or not.
    pub fn record(&self, key: &str) -> Option<&CacheRecord> {
        self.records.get(key)
    }

    pub fn key_for(&self, source: &SourceImage) -> String {
        record_key(self.naming, source)
    }

    fn is_inline_source(&self, source: &SourceImage) -> bool {
        self.inline_below.is_some_and(|limit| source.size <= limit)
    }

    /// Record for `source` if it was produced from these exact bytes under
    /// the active configuration.
    pub fn current_record(&self, source: &SourceImage) -> Option<&CacheRecord> {
        let key = self.key_for(source);
        if self.bypass && !self.touched.contains(&key) {
            return None;
        }
        self.records
            .get(&key)
            .filter(|r| r.checksum == self.checksum && r.source.hash == source.hash)
    }

    /// Whether the cache fully covers `source`.
    pub fn is_valid(&self, source: &SourceImage) -> bool {
        let Some(record) = self.current_record(source) else {
            return false;
        };
        if record.is_stale() {
            return false;
        }
        if self.is_inline_source(source) {
            return record.outputs.iter().any(|o| o.is_inline() && o.is_present());
        }
        self.tasks
            .iter()
            .filter(|t| !t.is_inline())
            .all(|task| {
                planned_widths(&task.sizes, source.width)
                    .into_iter()
                    .all(|w| record.output(&task.name, w).is_some())
            })
    }

    /// The record for `source`, only if it is valid.
    pub fn read(&self, source: &SourceImage) -> Option<&CacheRecord> {
        if self.is_valid(source) {
            self.current_record(source)
        } else {
            None
        }
    }

    /// Keys of records that reference missing or malformed outputs.
    pub fn verify(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .filter(|(_, record)| record.is_stale())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Merge `partial` into the record set and write it out.
    pub fn save(&mut self, partial: BTreeMap<String, CacheRecord>) -> Result<(), CacheError> {
        for (key, record) in partial {
            match self.records.get_mut(&key) {
                Some(existing) => existing.merge(record),
                None => {
                    self.records.insert(key, record);
                }
            }
        }
        self.persist()
    }

    /// Merge-upsert one record.
    pub fn add(&mut self, key: String, record: CacheRecord) -> Result<(), CacheError> {
        self.save(BTreeMap::from([(key, record)]))
    }

    /// Delete one record. Returns whether it existed.
    pub fn remove(&mut self, key: &str) -> Result<bool, CacheError> {
        let existed = self.records.remove(key).is_some();
        if existed {
            self.persist()?;
        }
        Ok(existed)
    }

    /// Drop records left behind by earlier contents of a current source.
    ///
    /// A record is superseded when its source has the same origin as one of
    /// `sources` but a different key, and no current source uses its key.
    /// Output files only that record referenced are deleted.
    pub fn prune_superseded(
        &mut self,
        sources: &[SourceImage],
    ) -> Result<Vec<PrunedRecord>, CacheError> {
        let current_keys: HashSet<String> = sources.iter().map(|s| self.key_for(s)).collect();
        let current_keys_by_origin: BTreeMap<String, String> = sources
            .iter()
            .map(|s| (s.origin(), self.key_for(s)))
            .collect();
        let superseded: Vec<String> = self
            .records
            .iter()
            .filter(|(key, record)| {
                !current_keys.contains(*key)
                    && current_keys_by_origin
                        .get(&record.source.origin())
                        .is_some_and(|current| current != *key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        if superseded.is_empty() {
            return Ok(Vec::new());
        }

        let removed: Vec<(String, CacheRecord)> = superseded
            .into_iter()
            .filter_map(|key| self.records.remove(&key).map(|record| (key, record)))
            .collect();
        let still_used: HashSet<&Path> = self
            .records
            .values()
            .flat_map(|r| r.outputs.iter().filter_map(OutputResult::output_path))
            .collect();

        let mut pruned = Vec::new();
        for (key, record) in &removed {
            let mut files_removed = 0;
            for path in record.outputs.iter().filter_map(OutputResult::output_path) {
                if still_used.contains(path) {
                    continue;
                }
                match std::fs::remove_file(path) {
                    Ok(()) => files_removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "could not remove old output");
                    }
                }
            }
            pruned.push(PrunedRecord {
                key: key.clone(),
                origin: record.source.origin(),
                files_removed,
            });
        }
        self.persist()?;
        Ok(pruned)
    }

    /// Store one produced output under its source and write the file.
    ///
    /// The in-memory record is updated even when the write fails.
    pub fn record_result(
        &mut self,
        source: &SourceImage,
        result: OutputResult,
    ) -> Result<(), CacheError> {
        let key = self.key_for(source);
        let is_inline = self.is_inline_source(source);
        let checksum = self.checksum.clone();
        let first_touch = self.touched.insert(key.clone());
        let record = self
            .records
            .entry(key)
            .or_insert_with(|| CacheRecord::new(source.clone(), checksum.clone(), is_inline));
        if (self.bypass && first_touch)
            || record.checksum != checksum
            || record.source.hash != source.hash
        {
            *record = CacheRecord::new(source.clone(), checksum, is_inline);
        }
        record.source = source.clone();
        record.is_inline = is_inline;
        record.upsert(result);
        self.persist()
    }

    /// Write the full record set if it differs from what is on disk.
    pub fn persist(&mut self) -> Result<(), CacheError> {
        let mut root = Map::new();
        root.insert(CHECKSUM_KEY.to_string(), Value::String(self.checksum.clone()));
        for (key, record) in &self.records {
            if key == CHECKSUM_KEY {
                continue;
            }
            root.insert(key.clone(), serde_json::to_value(record)?);
        }
        let json = serde_json::to_string_pretty(&Value::Object(root))?;
        if self.last_written.as_deref() == Some(json.as_str()) {
            return Ok(());
        }
        write_atomic(&self.path, json.as_bytes())?;
        self.stored_checksum = Some(self.checksum.clone());
        self.last_written = Some(json);
        Ok(())
    }
}

type ReadOutcome = (
    Option<String>,
    BTreeMap<String, CacheRecord>,
    LoadStatus,
    Option<String>,
);

fn read_cache_file(path: &Path) -> ReadOutcome {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return (None, BTreeMap::new(), LoadStatus::Missing, None);
        }
        Err(e) => return (None, BTreeMap::new(), LoadStatus::Corrupt(e.to_string()), None),
    };
    let root = match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return (
                None,
                BTreeMap::new(),
                LoadStatus::Corrupt("cache file is not a JSON object".into()),
                None,
            );
        }
        Err(e) => return (None, BTreeMap::new(), LoadStatus::Corrupt(e.to_string()), None),
    };

    let mut stored = None;
    let mut records = BTreeMap::new();
    let mut dropped = 0;
    for (key, value) in root {
        if key == CHECKSUM_KEY {
            stored = value.as_str().map(str::to_string);
            continue;
        }
        match serde_json::from_value::<CacheRecord>(value) {
            Ok(record) => {
                records.insert(key, record);
            }
            Err(e) => {
                tracing::debug!(%key, error = %e, "dropping unreadable cache record");
                dropped += 1;
            }
        }
    }
    let status = LoadStatus::Loaded {
        records: records.len(),
        dropped,
    };
    (stored, records, status, Some(content))
}

/// Write through a sibling temp file and rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)
}

/// Exclusive advisory lock on `<cache_file>.lock`, held until dropped.
#[derive(Debug)]
pub struct CacheLock {
    _file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Block until this process owns the cache at `cache_path`.
    pub fn acquire(cache_path: &Path) -> Result<Self, CacheError> {
        use fs4::fs_std::FileExt;

        let mut name = cache_path.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        file.lock_exclusive().map_err(|source| CacheError::Lock {
            path: path.clone(),
            source,
        })?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Classification counts for a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub satisfied: u32,
    pub stale: u32,
    pub needed: u32,
    pub failed: u32,
}

impl CacheStats {
    pub fn total(&self) -> u32 {
        self.satisfied + self.stale + self.needed
    }

    pub fn jobs(&self) -> u32 {
        self.stale + self.needed
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.satisfied > 0 {
            write!(
                f,
                "{} cached, {} encoded ({} total)",
                self.satisfied,
                self.jobs() - self.failed.min(self.jobs()),
                self.total()
            )?;
        } else {
            write!(f, "{} encoded", self.jobs() - self.failed.min(self.jobs()))?;
        }
        if self.stale > 0 {
            write!(f, ", {} stale", self.stale)?;
        }
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::MOCK_DATA_URI;
    use crate::test_helpers::{jpeg_task, source_image, test_config};
    use std::fs;
    use tempfile::TempDir;

    fn file_output(task: &str, width: u32, path: &Path) -> OutputResult {
        OutputResult {
            task: task.into(),
            target_width: width,
            format: "jpeg".into(),
            width,
            height: width / 2,
            size: 4,
            has_alpha: false,
            artifact: StoredArtifact::File {
                output_path: path.to_path_buf(),
            },
            url: Some(format!("/images/x_{width}.jpg")),
            srcset: Some(format!("/images/x_{width}.jpg {width}w")),
        }
    }

    fn inline_output(data: &str) -> OutputResult {
        OutputResult {
            task: "inline".into(),
            target_width: 64,
            format: "png".into(),
            width: 64,
            height: 64,
            size: data.len() as u64,
            has_alpha: true,
            artifact: StoredArtifact::Inline { data: data.into() },
            url: None,
            srcset: None,
        }
    }

    /// Config with one jpeg task at [480, 768] and an inline task below 10000 bytes.
    fn config(root: &Path) -> Config {
        let mut config = test_config(root);
        config.tasks = vec![jpeg_task("default", &[480, 768]), crate::test_helpers::inline_task(10_000)];
        config
    }

    fn write_outputs(cache: &mut DerivationCache, source: &SourceImage, root: &Path, widths: &[u32]) {
        for &w in widths {
            let path = root.join(format!("out_{w}.jpg"));
            fs::write(&path, b"x").unwrap();
            cache
                .record_result(source, file_output("default", w, &path))
                .unwrap();
        }
    }

    // =========================================================================
    // Loading
    // =========================================================================

    #[test]
    fn open_missing_file_is_cold() {
        let tmp = TempDir::new().unwrap();
        let cache = DerivationCache::open(&config(tmp.path()));
        assert!(cache.is_empty());
        assert_eq!(cache.status(), &LoadStatus::Missing);
        assert!(!cache.checksum_changed());
    }

    #[test]
    fn open_corrupt_file_is_cold() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        fs::create_dir_all(&config.output_path).unwrap();
        fs::write(config.cache_path(), "not json").unwrap();
        let cache = DerivationCache::open(&config);
        assert!(cache.is_empty());
        assert!(matches!(cache.status(), LoadStatus::Corrupt(_)));
    }

    #[test]
    fn open_non_object_is_cold() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        fs::create_dir_all(&config.output_path).unwrap();
        fs::write(config.cache_path(), "[1, 2]").unwrap();
        assert!(matches!(
            DerivationCache::open(&config).status(),
            LoadStatus::Corrupt(_)
        ));
    }

    #[test]
    fn unreadable_records_are_dropped_individually() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        fs::create_dir_all(&config.output_path).unwrap();
        let json = r#"{
            "checksum": "abc",
            "good": {"source": {"name": "a.jpg"}, "checksum": "abc", "outputs": [], "future_field": 1},
            "bad": {"outputs": [{"task": "default"}]},
            "weird": 42
        }"#;
        fs::write(config.cache_path(), json).unwrap();

        let cache = DerivationCache::open(&config);
        assert_eq!(cache.len(), 1);
        assert!(cache.record("good").is_some());
        assert_eq!(
            cache.status(),
            &LoadStatus::Loaded {
                records: 1,
                dropped: 2
            }
        );
        assert!(cache.checksum_changed());
    }

    // =========================================================================
    // Save / add / remove
    // =========================================================================

    #[test]
    fn record_result_persists_and_reloads() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let source = source_image("photo.jpg", "h1", 2000);
        let mut cache = DerivationCache::open(&config);
        write_outputs(&mut cache, &source, tmp.path(), &[480]);

        let reloaded = DerivationCache::open(&config);
        let record = reloaded.record("h1").unwrap();
        assert_eq!(record.outputs.len(), 1);
        assert_eq!(record.checksum, config.checksum());
        assert!(!reloaded.checksum_changed());

        let raw: Value = serde_json::from_str(&fs::read_to_string(config.cache_path()).unwrap()).unwrap();
        assert_eq!(raw[CHECKSUM_KEY], Value::String(config.checksum()));
        assert!(raw["h1"]["outputs"][0]["output_path"].is_string());
    }

    #[test]
    fn record_result_replaces_same_slot() {
        let tmp = TempDir::new().unwrap();
        let source = source_image("photo.jpg", "h1", 2000);
        let mut cache = DerivationCache::open(&config(tmp.path()));
        write_outputs(&mut cache, &source, tmp.path(), &[480, 480]);
        assert_eq!(cache.record("h1").unwrap().outputs.len(), 1);
    }

    #[test]
    fn bypassed_cache_ignores_but_keeps_disk_records() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let photo = source_image("photo.jpg", "h1", 2000);
        let other = source_image("other.jpg", "h2", 2000);
        let mut cache = DerivationCache::open(&config);
        write_outputs(&mut cache, &photo, tmp.path(), &[480, 768]);
        write_outputs(&mut cache, &other, tmp.path(), &[480, 768]);

        let mut bypassed = DerivationCache::open_bypassed(&config);
        assert_eq!(bypassed.status(), &LoadStatus::Bypassed);
        assert!(bypassed.current_record(&photo).is_none());
        assert!(!bypassed.is_valid(&other));

        let path = tmp.path().join("fresh_480.jpg");
        fs::write(&path, b"x").unwrap();
        bypassed
            .record_result(&photo, file_output("default", 480, &path))
            .unwrap();
        let fresh = bypassed.current_record(&photo).unwrap();
        assert_eq!(fresh.outputs.len(), 1);
        assert_eq!(fresh.outputs[0].output_path(), Some(path.as_path()));

        let reloaded = DerivationCache::open(&config);
        assert_eq!(reloaded.record("h1").unwrap().outputs.len(), 1);
        assert!(reloaded.is_valid(&other));
    }

    #[test]
    fn add_merges_outputs() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let source = source_image("photo.jpg", "h1", 2000);
        let mut cache = DerivationCache::open(&config);

        let mut first = CacheRecord::new(source.clone(), config.checksum(), false);
        first.upsert(file_output("default", 480, &tmp.path().join("a")));
        cache.add("h1".into(), first).unwrap();

        let mut second = CacheRecord::new(source, config.checksum(), false);
        second.upsert(file_output("default", 768, &tmp.path().join("b")));
        cache.add("h1".into(), second).unwrap();

        assert_eq!(cache.record("h1").unwrap().outputs.len(), 2);
    }

    #[test]
    fn add_replaces_record_from_other_checksum() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let source = source_image("photo.jpg", "h1", 2000);
        let mut cache = DerivationCache::open(&config);

        let mut old = CacheRecord::new(source.clone(), "old".into(), false);
        old.upsert(file_output("default", 480, &tmp.path().join("a")));
        cache.add("h1".into(), old).unwrap();
        cache
            .add("h1".into(), CacheRecord::new(source, config.checksum(), false))
            .unwrap();

        assert!(cache.record("h1").unwrap().outputs.is_empty());
    }

    #[test]
    fn remove_deletes_record() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let source = source_image("photo.jpg", "h1", 2000);
        let mut cache = DerivationCache::open(&config);
        write_outputs(&mut cache, &source, tmp.path(), &[480]);

        assert!(cache.remove("h1").unwrap());
        assert!(!cache.remove("h1").unwrap());
        assert!(DerivationCache::open(&config).record("h1").is_none());
    }

    #[test]
    fn prune_drops_records_of_changed_sources() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let old = source_image("photo.jpg", "h1", 2000);
        let other = source_image("other.jpg", "h9", 2000);
        let mut cache = DerivationCache::open(&config);
        let old_file = tmp.path().join("h1_480.jpg");
        let other_file = tmp.path().join("h9_480.jpg");
        fs::write(&old_file, b"x").unwrap();
        fs::write(&other_file, b"x").unwrap();
        cache.record_result(&old, file_output("default", 480, &old_file)).unwrap();
        cache.record_result(&other, file_output("default", 480, &other_file)).unwrap();

        let edited = source_image("photo.jpg", "h2", 2000);
        let pruned = cache.prune_superseded(&[edited, other]).unwrap();

        assert_eq!(
            pruned,
            vec![PrunedRecord {
                key: "h1".into(),
                origin: "/images/photo.jpg".into(),
                files_removed: 1,
            }]
        );
        assert!(!old_file.exists());
        assert!(other_file.exists());
        let reloaded = DerivationCache::open(&config);
        assert!(reloaded.record("h1").is_none());
        assert!(reloaded.record("h9").is_some());
    }

    #[test]
    fn prune_keeps_files_shared_with_current_records() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let old = source_image("photo.jpg", "h1", 2000);
        let twin = source_image("twin.jpg", "h2", 2000);
        let mut cache = DerivationCache::open(&config);
        let shared = tmp.path().join("shared_480.jpg");
        fs::write(&shared, b"x").unwrap();
        cache.record_result(&old, file_output("default", 480, &shared)).unwrap();
        cache.record_result(&twin, file_output("default", 480, &shared)).unwrap();

        // photo.jpg now has twin's bytes.
        let edited = source_image("photo.jpg", "h2", 2000);
        let pruned = cache.prune_superseded(&[edited, twin]).unwrap();

        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].files_removed, 0);
        assert!(shared.exists());
    }

    #[test]
    fn prune_without_changes_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let source = source_image("photo.jpg", "h1", 2000);
        let mut cache = DerivationCache::open(&config);
        write_outputs(&mut cache, &source, tmp.path(), &[480]);

        assert!(cache.prune_superseded(&[source]).unwrap().is_empty());
        assert!(cache.record("h1").is_some());
        assert!(tmp.path().join("out_480.jpg").exists());
    }

    #[test]
    fn unchanged_state_is_not_rewritten() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let source = source_image("photo.jpg", "h1", 2000);
        let mut cache = DerivationCache::open(&config);
        write_outputs(&mut cache, &source, tmp.path(), &[480]);
        fs::write(config.cache_path(), "sentinel").unwrap();

        cache.persist().unwrap();
        assert_eq!(fs::read_to_string(config.cache_path()).unwrap(), "sentinel");
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/cache.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        assert!(!tmp.path().join("nested/cache.json.tmp").exists());
    }

    // =========================================================================
    // Validity and staleness
    // =========================================================================

    #[test]
    fn valid_when_every_planned_width_present() {
        let tmp = TempDir::new().unwrap();
        let source = source_image("photo.jpg", "h1", 2000);
        let mut cache = DerivationCache::open(&config(tmp.path()));
        write_outputs(&mut cache, &source, tmp.path(), &[480]);
        assert!(!cache.is_valid(&source));
        assert!(cache.read(&source).is_none());

        write_outputs(&mut cache, &source, tmp.path(), &[768]);
        assert!(cache.is_valid(&source));
        assert!(cache.read(&source).is_some());
    }

    #[test]
    fn valid_ignores_widths_above_intrinsic() {
        let tmp = TempDir::new().unwrap();
        let source = source_image("small.jpg", "h2", 600);
        let mut cache = DerivationCache::open(&config(tmp.path()));
        write_outputs(&mut cache, &source, tmp.path(), &[480]);
        assert!(cache.is_valid(&source));
    }

    #[test]
    fn deleted_output_makes_record_stale() {
        let tmp = TempDir::new().unwrap();
        let source = source_image("photo.jpg", "h1", 2000);
        let mut cache = DerivationCache::open(&config(tmp.path()));
        write_outputs(&mut cache, &source, tmp.path(), &[480, 768]);
        assert!(cache.verify().is_empty());

        fs::remove_file(tmp.path().join("out_768.jpg")).unwrap();
        assert!(!cache.is_valid(&source));
        assert_eq!(cache.verify(), BTreeSet::from(["h1".to_string()]));
    }

    #[test]
    fn inline_source_needs_valid_inline_output() {
        let tmp = TempDir::new().unwrap();
        let mut source = source_image("icon.png", "h3", 64);
        source.size = 4_000;
        let mut cache = DerivationCache::open(&config(tmp.path()));
        assert!(!cache.is_valid(&source));

        cache
            .record_result(&source, inline_output(MOCK_DATA_URI))
            .unwrap();
        assert!(cache.is_valid(&source));
        assert!(cache.record("h3").unwrap().is_inline);
    }

    #[test]
    fn corrupted_inline_payload_is_stale() {
        let tmp = TempDir::new().unwrap();
        let mut source = source_image("icon.png", "h3", 64);
        source.size = 4_000;
        let mut cache = DerivationCache::open(&config(tmp.path()));
        cache
            .record_result(&source, inline_output("images/icon.png"))
            .unwrap();

        assert!(cache.record("h3").unwrap().is_stale());
        assert!(!cache.is_valid(&source));
        assert!(cache.verify().contains("h3"));
    }

    #[test]
    fn changed_source_bytes_invalidate() {
        let tmp = TempDir::new().unwrap();
        let source = source_image("small.jpg", "h2", 600);
        let mut cache = DerivationCache::open(&config(tmp.path()));
        write_outputs(&mut cache, &source, tmp.path(), &[480]);

        let mut edited = source.clone();
        edited.hash = "h2-edited".into();
        // Hash naming keys by content, so the edited file has no record at all.
        assert!(!cache.is_valid(&edited));
    }

    #[test]
    fn checksum_change_invalidates_but_keeps_records() {
        let tmp = TempDir::new().unwrap();
        let config_a = config(tmp.path());
        let source = source_image("small.jpg", "h2", 600);
        let mut cache = DerivationCache::open(&config_a);
        write_outputs(&mut cache, &source, tmp.path(), &[480]);
        assert!(cache.is_valid(&source));

        let mut config_b = config_a.clone();
        config_b.tasks[0].encode = crate::imaging::Encode::Jpeg { quality: 50 };
        let mut reopened = DerivationCache::open(&config_b);
        assert!(reopened.checksum_changed());
        assert!(reopened.record("h2").is_some());
        assert!(!reopened.is_valid(&source));

        reopened.persist().unwrap();
        assert!(!DerivationCache::open(&config_b).checksum_changed());
    }

    // =========================================================================
    // Lock
    // =========================================================================

    #[test]
    fn lock_creates_lock_file() {
        let tmp = TempDir::new().unwrap();
        let cache_path = tmp.path().join("static/.derivations.json");
        let lock = CacheLock::acquire(&cache_path).unwrap();
        assert_eq!(lock.path(), tmp.path().join("static/.derivations.json.lock"));
        assert!(lock.path().exists());
        drop(lock);
        // Re-acquirable once released.
        CacheLock::acquire(&cache_path).unwrap();
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display_with_hits() {
        let s = CacheStats {
            satisfied: 5,
            needed: 2,
            ..CacheStats::default()
        };
        assert_eq!(s.to_string(), "5 cached, 2 encoded (7 total)");
    }

    #[test]
    fn cache_stats_display_no_hits() {
        let s = CacheStats {
            needed: 3,
            ..CacheStats::default()
        };
        assert_eq!(s.to_string(), "3 encoded");
    }

    #[test]
    fn cache_stats_display_stale_and_failed() {
        let s = CacheStats {
            satisfied: 4,
            stale: 1,
            needed: 1,
            failed: 1,
        };
        assert_eq!(s.to_string(), "4 cached, 1 encoded (6 total), 1 stale, 1 failed");
    }
}
