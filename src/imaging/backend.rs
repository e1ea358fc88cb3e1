//! Transcoder trait and shared types.
//!
//! The [`Transcoder`] trait is the narrow boundary to the pixel engine:
//! `identify` reads a source's intrinsic properties, `transcode` produces one
//! output (file or inline data URI) and reports what was *actually* encoded.
//! Reported width/height/alpha are round-tripped into cache records and info
//! metadata, so implementations must not echo the request back.
//!
//! The production implementation is
//! [`RustTranscoder`](super::rust_backend::RustTranscoder).

use super::params::TranscodeRequest;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Transcode failed: {0}")]
    Failed(String),
}

/// Intrinsic properties of a source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub has_alpha: bool,
}

/// Produced artifact: a written file or an inline data URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    File(PathBuf),
    Inline(String),
}

/// Observed outcome of one transcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcoded {
    pub format: String,
    pub width: u32,
    pub height: u32,
    /// Encoded byte size.
    pub size: u64,
    pub has_alpha: bool,
    pub artifact: Artifact,
}

/// Pixel engine boundary.
///
/// `Sync` so the runner can fan a batch out over a rayon pool.
pub trait Transcoder: Sync {
    /// Read format, dimensions and alpha of a source image.
    fn identify(&self, path: &Path) -> Result<SourceInfo, TranscodeError>;

    /// Produce one output.
    fn transcode(&self, request: &TranscodeRequest) -> Result<Transcoded, TranscodeError>;
}

/// Returns true if `value` looks like a base64 image data URI.
pub fn is_data_uri(value: &str) -> bool {
    value
        .strip_prefix("data:image/")
        .and_then(|rest| rest.split_once(";base64,"))
        .is_some_and(|(mime, payload)| !mime.is_empty() && !payload.is_empty())
}
