//! Pipeline configuration.
//!
//! Loaded from `respimg.toml`. Every key is optional; stock defaults fill in
//! anything the file leaves out. Unknown top-level keys are rejected to catch
//! typos early.
//!
//! ## Configuration Options
//!
//! ```toml
//! search_paths = ["src/assets/images"]  # Where to look for source images
//! file_extensions = ["png", "jpg", "jpeg", "tiff", "webp"]
//! remote_sources = []                   # http(s) URLs fetched before processing
//! output_path = "static"                # Output root (files + info records)
//! base_url = "/images"                  # Public URL prefix, also the output subdirectory
//! cache_file = ".derivations.json"      # Relative to output_path
//! naming = "hash"                       # "hash" or "basename"
//! workers = 1                           # 1 = strictly sequential
//! logging = true                        # Write a dated log file per run
//!
//! [[tasks]]
//! name = "default"
//! sizes = [480, 768, 1280, 1920]
//! aspect_ratio = 1.6                    # width / height; omit to keep proportions
//!
//! [tasks.encode]
//! format = "jpeg"                       # jpeg | png | avif | inline
//! quality = 80
//! ```
//!
//! ## Checksum
//!
//! [`Config::checksum`] hashes everything that affects the bytes or identity
//! of produced outputs: tasks, naming policy and base URL. Search paths,
//! worker count and logging do not participate.

use crate::imaging::{Encode, supported_input_extensions};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config file name looked up in the working directory.
pub const CONFIG_FILENAME: &str = "respimg.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("{} configuration error(s):\n{}", .0.len(), .0.iter().map(|m| format!("  - {m}")).collect::<Vec<_>>().join("\n"))]
    Validation(Vec<String>),
}

/// How output files are named.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingPolicy {
    /// `<content-hash>_<width>.<ext>`; cache records keyed by content hash.
    #[default]
    Hash,
    /// `<source-stem>_<width>.<ext>`; cache records keyed by source file name.
    Basename,
}

impl fmt::Display for NamingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamingPolicy::Hash => write!(f, "hash"),
            NamingPolicy::Basename => write!(f, "basename"),
        }
    }
}

/// A named transformation: format + widths + optional fixed aspect ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,
    /// Target widths in pixels. Inline tasks may leave this empty to keep
    /// the source width.
    #[serde(default)]
    pub sizes: Vec<u32>,
    /// Fixed `width / height` ratio; height is derived from width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<f64>,
    /// Single-width task published as a bare URL (no srcset).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
    pub encode: Encode,
}

impl TaskConfig {
    pub fn is_inline(&self) -> bool {
        self.encode.is_inline()
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Print every journal event, not only progress.
    pub verbose: bool,
    /// Write the run journal to a dated log file under the output tree.
    pub logging: bool,
    pub search_paths: Vec<PathBuf>,
    pub file_extensions: Vec<String>,
    pub remote_sources: Vec<String>,
    pub output_path: PathBuf,
    pub base_url: String,
    /// Cache file name, relative to `output_path`.
    pub cache_file: String,
    pub naming: NamingPolicy,
    /// Maximum concurrent transcodes. Values above the core count are
    /// clamped down.
    pub workers: usize,
    pub tasks: Vec<TaskConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            logging: true,
            search_paths: vec![PathBuf::from("src/assets/images")],
            file_extensions: ["png", "jpg", "jpeg", "tiff", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            remote_sources: Vec::new(),
            output_path: PathBuf::from("static"),
            base_url: "/images".to_string(),
            cache_file: ".derivations.json".to_string(),
            naming: NamingPolicy::Hash,
            workers: 1,
            tasks: default_tasks(),
        }
    }
}

fn default_tasks() -> Vec<TaskConfig> {
    vec![
        TaskConfig {
            name: "fallback".into(),
            sizes: vec![768],
            aspect_ratio: Some(1.6),
            fallback: true,
            encode: Encode::Jpeg { quality: 80 },
        },
        TaskConfig {
            name: "inline".into(),
            sizes: vec![256],
            aspect_ratio: Some(1.0),
            fallback: false,
            encode: Encode::Inline {
                inline_below: 10_000,
            },
        },
        TaskConfig {
            name: "default".into(),
            sizes: vec![480, 768, 1280, 1920],
            aspect_ratio: Some(1.6),
            fallback: false,
            encode: Encode::Jpeg { quality: 80 },
        },
        TaskConfig {
            name: "modern".into(),
            sizes: vec![480, 768, 1280, 1920],
            aspect_ratio: Some(1.6),
            fallback: false,
            encode: Encode::Avif {
                quality: 75,
                speed: 6,
            },
        },
        TaskConfig {
            name: "thumb".into(),
            sizes: vec![256],
            aspect_ratio: Some(1.0),
            fallback: false,
            encode: Encode::Jpeg { quality: 80 },
        },
    ]
}

impl Config {
    /// Check every rule and report all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.search_paths.is_empty() && self.remote_sources.is_empty() {
            errors.push(
                "Specify where to look for images in \"search_paths\" or \"remote_sources\"."
                    .to_string(),
            );
        }
        if self.output_path.as_os_str().is_empty() {
            errors.push("Specify where to save processed images in \"output_path\".".to_string());
        }
        if self.cache_file.trim().is_empty() {
            errors.push("Specify the cache file name in \"cache_file\".".to_string());
        }
        if self.file_extensions.is_empty() {
            errors.push("Specify what files to search for in \"file_extensions\".".to_string());
        }
        let decodable = supported_input_extensions();
        for ext in &self.file_extensions {
            let normalized = ext.trim_start_matches('.').to_ascii_lowercase();
            if !decodable.iter().any(|d| *d == normalized) {
                errors.push(format!(
                    "Cannot decode \"{ext}\" files; supported extensions: {}.",
                    decodable.join(", ")
                ));
            }
        }
        if self.tasks.is_empty() {
            errors.push("No resize tasks found.".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                errors.push("Every task needs a non-empty \"name\".".to_string());
            } else if !seen.insert(task.name.as_str()) {
                errors.push(format!("Duplicate task name \"{}\".", task.name));
            }
            if task.sizes.is_empty() && !task.is_inline() {
                errors.push(format!("Task \"{}\" has no \"sizes\".", task.name));
            }
            if task.sizes.contains(&0) {
                errors.push(format!("Task \"{}\" has a zero width in \"sizes\".", task.name));
            }
            if let Some(ratio) = task.aspect_ratio
                && !(ratio.is_finite() && ratio > 0.0)
            {
                errors.push(format!(
                    "Task \"{}\" has an invalid \"aspect_ratio\" ({ratio}); it must be positive.",
                    task.name
                ));
            }
            match &task.encode {
                Encode::Jpeg { quality } | Encode::Avif { quality, .. }
                    if !(1..=100).contains(quality) =>
                {
                    errors.push(format!(
                        "Task \"{}\": quality must be 1-100 (got {quality}).",
                        task.name
                    ));
                }
                Encode::Png { compression_level } if *compression_level > 9 => {
                    errors.push(format!(
                        "Task \"{}\": compression_level must be 0-9 (got {compression_level}).",
                        task.name
                    ));
                }
                Encode::Avif { speed, .. } if !(1..=10).contains(speed) => {
                    errors.push(format!(
                        "Task \"{}\": speed must be 1-10 (got {speed}).",
                        task.name
                    ));
                }
                _ => {}
            }
            if task.fallback && task.sizes.len() > 1 {
                errors.push(format!(
                    "Fallback task \"{}\" must have exactly one width.",
                    task.name
                ));
            }
            if task.fallback && task.is_inline() {
                errors.push(format!(
                    "Fallback task \"{}\" cannot use the inline format.",
                    task.name
                ));
            }
        }

        if self.tasks.iter().filter(|t| t.fallback).count() > 1 {
            errors.push("At most one task may be marked \"fallback\".".to_string());
        }
        if self.tasks.iter().filter(|t| t.is_inline()).count() > 1 {
            errors.push("At most one task may use the inline format.".to_string());
        }
        for url in &self.remote_sources {
            if !crate::source::is_remote(url) {
                errors.push(format!("Remote source \"{url}\" is not an http(s) URL."));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// SHA-256 over everything that changes produced bytes or their names.
    pub fn checksum(&self) -> String {
        #[derive(Serialize)]
        struct Fingerprint<'a> {
            tasks: &'a [TaskConfig],
            naming: NamingPolicy,
            base_url: &'a str,
        }
        let json = serde_json::to_vec(&Fingerprint {
            tasks: &self.tasks,
            naming: self.naming,
            base_url: &self.base_url,
        })
        .unwrap_or_default();
        format!("{:x}", Sha256::digest(&json))
    }

    /// The inline task, if one is configured.
    pub fn inline_task(&self) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.is_inline())
    }

    /// Byte-size threshold at or below which a source is inlined.
    pub fn inline_below(&self) -> Option<u64> {
        self.inline_task().and_then(|t| match t.encode {
            Encode::Inline { inline_below } => Some(inline_below),
            _ => None,
        })
    }

    /// Whether a source of `size` bytes gets only the inline output.
    pub fn is_inline_source(&self, size: u64) -> bool {
        self.inline_below().is_some_and(|limit| size <= limit)
    }

    /// Location of the cache file.
    pub fn cache_path(&self) -> PathBuf {
        self.output_path.join(&self.cache_file)
    }

    /// Output subdirectory named by the base URL (leading/trailing slashes
    /// stripped).
    pub fn base_dir(&self) -> PathBuf {
        let segment = self.base_url.trim_matches('/');
        if segment.is_empty() {
            self.output_path.clone()
        } else {
            self.output_path.join(segment)
        }
    }
}

/// Resolve the effective worker count.
///
/// - `0` or `1` → sequential
/// - `n` → `min(n, cores)` (user can constrain down, not up)
pub fn effective_workers(config: &Config) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.workers.clamp(1, cores.max(1))
}

/// Load and parse a config file. Does not validate.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load `path` if it exists, otherwise fall back to stock defaults.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Generate a documented stock `respimg.toml` with all default values.
pub fn stock_config_toml() -> &'static str {
    r##"# respimg configuration
# =====================
# All settings are optional. Values shown below are the defaults.
# Unknown keys will cause an error.

# Print every event, not only progress.
verbose = false

# Write a dated log file (YYYY-MM-DD-HHMMSS.log) under output_path/base_url.
logging = true

# Directories searched (recursively) for source images.
search_paths = ["src/assets/images"]

# Source file extensions to pick up.
file_extensions = ["png", "jpg", "jpeg", "tiff", "webp"]

# Remote images downloaded to a temp directory before processing.
remote_sources = []

# Output root for derived images and per-image info records.
output_path = "static"

# Public URL prefix. Also the subdirectory of output_path files go into.
base_url = "/images"

# Cache file, relative to output_path.
cache_file = ".derivations.json"

# Output file naming: "hash" (content hash) or "basename" (source file stem).
naming = "hash"

# Maximum concurrent transcodes. 1 runs jobs strictly one after another.
workers = 1

# ---------------------------------------------------------------------------
# Tasks: one output family each. Encode formats:
#   jpeg   { quality = 1-100 }
#   png    { compression_level = 0-9 }
#   avif   { quality = 1-100, speed = 1-10 }
#   inline { inline_below = bytes }  sources at or below this size are
#                                     embedded as data URIs instead of files
# ---------------------------------------------------------------------------

[[tasks]]
name = "fallback"
sizes = [768]
aspect_ratio = 1.6
fallback = true

[tasks.encode]
format = "jpeg"
quality = 80

[[tasks]]
name = "inline"
sizes = [256]
aspect_ratio = 1.0

[tasks.encode]
format = "inline"
inline_below = 10000

[[tasks]]
name = "default"
sizes = [480, 768, 1280, 1920]
aspect_ratio = 1.6

[tasks.encode]
format = "jpeg"
quality = 80

[[tasks]]
name = "modern"
sizes = [480, 768, 1280, 1920]
aspect_ratio = 1.6

[tasks.encode]
format = "avif"
quality = 75
speed = 6

[[tasks]]
name = "thumb"
sizes = [256]
aspect_ratio = 1.0

[tasks.encode]
format = "jpeg"
quality = 80
"##
}
