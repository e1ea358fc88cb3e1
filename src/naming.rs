//! Output path resolution.
//!
//! Every derived artifact has one deterministic identity computed from
//! (source identity, task, width, naming policy). The mapping must be stable
//! across runs so "does the output already exist" checks mean something.
//!
//! ## Layout
//!
//! ```text
//! <output_path>/<base_url>/<token>_<width>.<ext>   responsive outputs
//! <output_path>/<base_url>/<token>.<ext>           the fallback task
//! <output_path>/<base_url>/<source stem>.json      per-image info record
//! ```
//!
//! `token` is the source's content hash ([`NamingPolicy::Hash`]) or its file
//! stem ([`NamingPolicy::Basename`]). The public URL mirrors the path
//! relative to `output_path`, with a leading `/`.
//!
//! Library users may install a [`PathFn`] to rewrite the relative path;
//! the URL follows whatever the function returns.

use crate::config::{Config, NamingPolicy, TaskConfig};
use crate::imaging::target_height;
use crate::source::SourceImage;
use std::fmt;
use std::path::{Path, PathBuf};

/// Inputs available to a custom output-path function.
pub struct PathContext<'a> {
    pub source: &'a SourceImage,
    pub task: &'a TaskConfig,
    pub width: u32,
    /// Default path relative to the output root.
    pub relative: &'a Path,
}

/// Maps the default relative output path to a different relative path.
pub type PathFn = Box<dyn Fn(&PathContext<'_>) -> PathBuf + Send + Sync>;

/// Where an output lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    File(PathBuf),
    Inline,
}

/// One concrete derived artifact, before it is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescriptor {
    /// Cache record key of the source.
    pub source_key: String,
    pub task: String,
    pub width: u32,
    /// Fixed height when the task sets an aspect ratio.
    pub height: Option<u32>,
    pub target: Target,
    pub url: Option<String>,
    /// `"<url> <width>w"`, absent for inline and fallback outputs.
    pub srcset: Option<String>,
}

impl OutputDescriptor {
    pub fn is_inline(&self) -> bool {
        self.target == Target::Inline
    }

    pub fn file(&self) -> Option<&Path> {
        match &self.target {
            Target::File(path) => Some(path),
            Target::Inline => None,
        }
    }
}

impl fmt::Display for OutputDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::File(path) => write!(f, "{}@{} -> {}", self.task, self.width, path.display()),
            Target::Inline => write!(f, "{}@{} -> inline", self.task, self.width),
        }
    }
}

/// Cache record key: the content hash or the source file name.
pub fn record_key(naming: NamingPolicy, source: &SourceImage) -> String {
    match naming {
        NamingPolicy::Hash => source.hash.clone(),
        NamingPolicy::Basename => source.name.clone(),
    }
}

/// The single place output names are derived.
pub struct Resolver {
    output_root: PathBuf,
    base_url: String,
    naming: NamingPolicy,
    path_fn: Option<PathFn>,
}

impl Resolver {
    pub fn new(config: &Config) -> Self {
        Self {
            output_root: config.output_path.clone(),
            base_url: config.base_url.clone(),
            naming: config.naming,
            path_fn: None,
        }
    }

    /// Install a custom output-path function.
    pub fn with_path_fn(mut self, path_fn: PathFn) -> Self {
        self.path_fn = Some(path_fn);
        self
    }

    pub fn naming(&self) -> NamingPolicy {
        self.naming
    }

    fn base_segment(&self) -> &str {
        self.base_url.trim_matches('/')
    }

    /// Directory (relative to the output root) outputs and info records go in.
    fn base_relative(&self) -> PathBuf {
        let segment = self.base_segment();
        if segment.is_empty() {
            PathBuf::new()
        } else {
            PathBuf::from(segment)
        }
    }

    /// Key of the source's cache record.
    pub fn record_key(&self, source: &SourceImage) -> String {
        record_key(self.naming, source)
    }

    /// Name part shared by every output file of `source`. Two sources with
    /// the same token would write the same files.
    pub fn output_token<'a>(&self, source: &'a SourceImage) -> &'a str {
        match self.naming {
            NamingPolicy::Hash => &source.hash,
            NamingPolicy::Basename => &source.stem,
        }
    }

    fn url_for(relative: &Path) -> String {
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", parts.join("/"))
    }

    /// Resolve the identity of `(source, task, width)`.
    pub fn resolve(&self, source: &SourceImage, task: &TaskConfig, width: u32) -> OutputDescriptor {
        let height = target_height(width, task.aspect_ratio);
        let source_key = self.record_key(source);

        if task.is_inline() {
            return OutputDescriptor {
                source_key,
                task: task.name.clone(),
                width,
                height,
                target: Target::Inline,
                url: None,
                srcset: None,
            };
        }

        let ext = task.encode.extension();
        let file_name = if task.fallback {
            format!("{}.{ext}", self.output_token(source))
        } else {
            format!("{}_{width}.{ext}", self.output_token(source))
        };
        let default_relative = self.base_relative().join(file_name);
        let relative = match &self.path_fn {
            Some(path_fn) => path_fn(&PathContext {
                source,
                task,
                width,
                relative: &default_relative,
            }),
            None => default_relative,
        };

        let url = Self::url_for(&relative);
        let srcset = (!task.fallback).then(|| format!("{url} {width}w"));
        OutputDescriptor {
            source_key,
            task: task.name.clone(),
            width,
            height,
            target: Target::File(self.output_root.join(&relative)),
            url: Some(url),
            srcset,
        }
    }

    /// URL the source is published under: base URL plus the source stem.
    /// Sources sharing a stem (`photo.jpg`, `photo.webp`) share one URL and
    /// one info record.
    pub fn published_url(&self, source: &SourceImage) -> String {
        Self::url_for(&self.base_relative().join(&source.stem))
    }

    /// Location of the info record for a published URL's sources.
    pub fn info_path(&self, source: &SourceImage) -> PathBuf {
        self.output_root
            .join(self.base_relative())
            .join(format!("{}.json", source.stem))
    }
}
