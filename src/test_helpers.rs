//! Shared test utilities.
//!
//! Builders for configs, tasks and sources so unit tests can exercise the
//! planner, runner and aggregator without real images.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let mut config = test_config(tmp.path());
//! config.tasks = vec![jpeg_task("default", &[480, 768]), inline_task(10_000)];
//! let photo = write_source(tmp.path(), "photo.jpg", 20_000);
//! ```

use std::path::{Path, PathBuf};

use crate::config::{Config, TaskConfig};
use crate::imaging::Encode;
use crate::source::SourceImage;

// =========================================================================
// Config builders
// =========================================================================

/// Config rooted in `root`: sources under `root/images`, outputs under
/// `root/static`, logging off.
pub fn test_config(root: &Path) -> Config {
    Config {
        search_paths: vec![root.join("images")],
        output_path: root.join("static"),
        logging: false,
        ..Config::default()
    }
}

pub fn jpeg_task(name: &str, sizes: &[u32]) -> TaskConfig {
    TaskConfig {
        name: name.into(),
        sizes: sizes.to_vec(),
        aspect_ratio: None,
        fallback: false,
        encode: Encode::Jpeg { quality: 80 },
    }
}

pub fn avif_task(name: &str, sizes: &[u32]) -> TaskConfig {
    TaskConfig {
        encode: Encode::Avif {
            quality: 70,
            speed: 10,
        },
        ..jpeg_task(name, sizes)
    }
}

pub fn inline_task(inline_below: u64) -> TaskConfig {
    TaskConfig {
        encode: Encode::Inline { inline_below },
        ..jpeg_task("inline", &[256])
    }
}

pub fn fallback_task(width: u32) -> TaskConfig {
    TaskConfig {
        fallback: true,
        ..jpeg_task("fallback", &[width])
    }
}

// =========================================================================
// Sources
// =========================================================================

/// An identified source that was never read from disk. Size is well above
/// any inline threshold used in tests.
pub fn source_image(name: &str, hash: &str, width: u32) -> SourceImage {
    let path = PathBuf::from("/images").join(name);
    SourceImage {
        stem: path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        extension: path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path,
        remote_url: None,
        name: name.into(),
        hash: hash.into(),
        format: "jpeg".into(),
        size: 50_000,
        width,
        height: width * 3 / 4,
        has_alpha: false,
    }
}

/// Write a placeholder source of exactly `size` bytes under `root/images`.
///
/// Content is derived from the name so different files hash differently.
pub fn write_source(root: &Path, name: &str, size: usize) -> PathBuf {
    let dir = root.join("images");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let seed = name.as_bytes();
    let bytes: Vec<u8> = (0..size).map(|i| seed[i % seed.len()]).collect();
    std::fs::write(&path, bytes).unwrap();
    path
}
