//! Result aggregation and info records.
//!
//! Regroups the outputs of one source by task into publishable
//! [`ImageInfo`] entries:
//!
//! - file tasks get a `srcset` (`"url 480w, url 768w"`, ascending) and a
//!   parallel `sizes` string (`"(max-width: 480px) 480px, ..."`),
//! - the inline task gets the data URI in `data`,
//! - the fallback task gets the bare URL in `src`.
//!
//! Exact per-width dimensions are kept in `metadata`, keyed by the target
//! width as a string. Entries of all sources published under the same URL
//! are merged into one list with inline entries last, then written as one
//! JSON file per published URL. A file whose content would not change is
//! left untouched.

use crate::cache::{OutputResult, write_atomic};
use crate::config::TaskConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decoded properties of one produced output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub format: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub has_alpha: bool,
}

/// Publishable descriptor of one task's outputs for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Published URL of the source.
    pub url: String,
    /// Task name.
    pub name: String,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Metadata>,
}

impl ImageInfo {
    pub fn is_inline(&self) -> bool {
        self.data.is_some()
    }
}

/// Build one [`ImageInfo`] per task that produced anything for the source.
///
/// Tasks are visited in declaration order; outputs of unknown tasks are
/// ignored.
pub fn aggregate(url: &str, tasks: &[TaskConfig], outputs: &[OutputResult]) -> Vec<ImageInfo> {
    let mut infos = Vec::new();
    for task in tasks {
        let mut own: Vec<&OutputResult> = outputs.iter().filter(|o| o.task == task.name).collect();
        if own.is_empty() {
            continue;
        }
        own.sort_by_key(|o| o.target_width);

        let metadata = own
            .iter()
            .map(|o| {
                (
                    o.target_width.to_string(),
                    Metadata {
                        format: o.format.clone(),
                        size: o.size,
                        width: o.width,
                        height: o.height,
                        has_alpha: o.has_alpha,
                    },
                )
            })
            .collect();

        let mut info = ImageInfo {
            url: url.to_string(),
            name: task.name.clone(),
            format: own[0].format.clone(),
            src: None,
            srcset: None,
            sizes: None,
            data: None,
            metadata,
        };

        if task.is_inline() {
            info.data = own.iter().find_map(|o| o.data().map(str::to_string));
        } else if task.fallback {
            info.src = own[0].url.clone();
        } else {
            let srcset: Vec<String> = own.iter().filter_map(|o| o.srcset.clone()).collect();
            let sizes: Vec<String> = own
                .iter()
                .map(|o| format!("(max-width: {w}px) {w}px", w = o.target_width))
                .collect();
            info.srcset = Some(srcset.join(", "));
            info.sizes = Some(sizes.join(", "));
        }
        infos.push(info);
    }
    infos
}

/// Merge entries by published URL, keeping inline entries last.
pub fn merge_by_url(infos: Vec<ImageInfo>) -> BTreeMap<String, Vec<ImageInfo>> {
    let mut merged: BTreeMap<String, Vec<ImageInfo>> = BTreeMap::new();
    for info in infos {
        merged.entry(info.url.clone()).or_default().push(info);
    }
    for list in merged.values_mut() {
        list.sort_by_key(ImageInfo::is_inline);
    }
    merged
}

/// Write an info record. Returns `false` when the file already holds
/// exactly this content.
pub fn write_info(path: &Path, infos: &[ImageInfo]) -> Result<bool, AggregateError> {
    let json = serde_json::to_string_pretty(infos)?;
    if let Ok(existing) = std::fs::read_to_string(path)
        && existing == json
    {
        return Ok(false);
    }
    write_atomic(path, json.as_bytes())?;
    Ok(true)
}
