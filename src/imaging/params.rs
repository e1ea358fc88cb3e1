//! Parameter types for transcode operations.
//!
//! These types describe *what* to produce, not *how*. They are the interface
//! between the planner/runner (which decide which outputs are needed) and the
//! [`backend`](super::backend) (which does the pixel work). Keeping them
//! separate lets the runner be tested against a mock transcoder.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100). Clamped on construction.
//! - [`Encode`]: Closed union of the four output formats, each carrying only
//!   its own encode options.
//! - [`Destination`]: Where the encoded bytes go: a file, or an inline data URI.
//! - [`TranscodeRequest`]: Everything needed to produce one output.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(80)
    }
}

fn default_jpeg_quality() -> u32 {
    80
}

fn default_png_compression() -> u8 {
    8
}

fn default_avif_quality() -> u32 {
    75
}

fn default_avif_speed() -> u8 {
    6
}

fn default_inline_below() -> u64 {
    10_000
}

/// Output format plus the encode options valid for that format.
///
/// Serialized with a `format` tag, so a task's `[tasks.encode]` table reads:
///
/// ```toml
/// [tasks.encode]
/// format = "avif"
/// quality = 70
/// speed = 6
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum Encode {
    /// Lossy raster (JPEG). Alpha is flattened.
    Jpeg {
        #[serde(default = "default_jpeg_quality")]
        quality: u32,
    },
    /// Lossless raster with transparency (PNG). `compression_level` is 0-9.
    Png {
        #[serde(default = "default_png_compression")]
        compression_level: u8,
    },
    /// Next-gen lossy raster (AVIF). `speed` is 1 (slowest) to 10 (fastest).
    Avif {
        #[serde(default = "default_avif_quality")]
        quality: u32,
        #[serde(default = "default_avif_speed")]
        speed: u8,
    },
    /// PNG bytes embedded as a `data:` URI; never written to disk.
    ///
    /// Sources whose byte size is at most `inline_below` are inlined
    /// instead of getting file-backed outputs.
    Inline {
        #[serde(default = "default_inline_below")]
        inline_below: u64,
    },
}

impl Encode {
    /// Short format name used in metadata and info records.
    pub fn name(&self) -> &'static str {
        match self {
            Encode::Jpeg { .. } => "jpeg",
            Encode::Png { .. } => "png",
            Encode::Avif { .. } => "avif",
            Encode::Inline { .. } => "inline",
        }
    }

    /// File extension for file-backed outputs.
    pub fn extension(&self) -> &'static str {
        match self {
            Encode::Jpeg { .. } => "jpg",
            Encode::Png { .. } | Encode::Inline { .. } => "png",
            Encode::Avif { .. } => "avif",
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Encode::Inline { .. })
    }
}

/// Where an encoded output ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    File(PathBuf),
    Inline,
}

/// Everything needed to produce one output from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub source: PathBuf,
    /// Target width. Never larger than the source's intrinsic width.
    pub width: u32,
    /// Fixed target height (from the task's aspect ratio). When absent, the
    /// source aspect ratio is preserved.
    pub height: Option<u32>,
    pub encode: Encode,
    pub destination: Destination,
}
