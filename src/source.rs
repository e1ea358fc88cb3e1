//! Source image discovery and identity.
//!
//! A [`SourceImage`] is created when a file is first read: its bytes are
//! hashed (SHA-256, content-addressed) and the transcoder identifies format,
//! dimensions and alpha. A changed file yields a new hash, which makes it a
//! new logical image as far as the cache is concerned.
//!
//! Discovery walks every search root with `walkdir` and keeps files whose
//! extension (case-insensitive) is in the configured list. Results are
//! sorted by path so discovery order, and with it job order, is stable.
//!
//! Remote sources are downloaded with `ureq` into
//! `<temp_dir>/respimg-<sha256(user-output_root)>/<file name>`. A file already
//! present there is reused without touching the network.

use crate::config::Config;
use crate::imaging::{TranscodeError, Transcoder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Could not read {path}: {source}")]
    Identify {
        path: PathBuf,
        #[source]
        source: TranscodeError,
    },
    #[error("Download of {url} failed: {message}")]
    Download { url: String, message: String },
    #[error("Remote source has no file name: {0}")]
    NoFileName(String),
}

/// One input image with its content hash and intrinsic metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SourceImage {
    pub path: PathBuf,
    /// Originating URL for downloaded sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// File name with extension (`photo.jpg`).
    pub name: String,
    /// File name without extension (`photo`).
    pub stem: String,
    pub extension: String,
    /// SHA-256 of the file contents, hex encoded.
    pub hash: String,
    pub format: String,
    /// Byte size on disk.
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub has_alpha: bool,
}

impl SourceImage {
    /// Hash and identify a local file.
    pub fn load(path: &Path, transcoder: &dyn Transcoder) -> Result<Self, SourceError> {
        let size = std::fs::metadata(path)?.len();
        let hash = hash_file(path)?;
        let info = transcoder
            .identify(path)
            .map_err(|source| SourceError::Identify {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            remote_url: None,
            name: file_name(path),
            stem: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            extension: path
                .extension()
                .map(|s| s.to_string_lossy().to_lowercase())
                .unwrap_or_default(),
            hash,
            format: info.format,
            size,
            width: info.width,
            height: info.height,
            has_alpha: info.has_alpha,
        })
    }

    /// Hash and identify a downloaded file, remembering where it came from.
    pub fn load_remote(
        path: &Path,
        url: &str,
        transcoder: &dyn Transcoder,
    ) -> Result<Self, SourceError> {
        let mut source = Self::load(path, transcoder)?;
        source.remote_url = Some(url.to_string());
        Ok(source)
    }

    /// Human-readable origin: the remote URL or the local path.
    pub fn origin(&self) -> String {
        self.remote_url
            .clone()
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// SHA-256 hash of a file's contents, returned as a hex string.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Returns true for `http://` and `https://` URLs.
pub fn is_remote(location: &str) -> bool {
    let lower = location.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Absolute, symlink-free form of `path`; lexically absolute when it does
/// not exist yet.
fn resolved(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Enumerate candidate source files under every search root.
///
/// Missing roots are skipped. The output directory is never descended into,
/// however the search roots and `output_path` are spelled (`"."` and
/// `"static"` included), so derived images are not picked up as sources on
/// the next run.
pub fn discover_files(config: &Config) -> Vec<PathBuf> {
    let extensions: Vec<String> = config
        .file_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();
    let output_root = resolved(&config.output_path);

    let mut files: Vec<PathBuf> = Vec::new();
    for root in &config.search_paths {
        if !root.is_dir() {
            continue;
        }
        let walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                if e.file_type().is_dir() && resolved(e.path()).starts_with(&output_root) {
                    return false;
                }
                let name = e.file_name().to_string_lossy();
                e.depth() == 0 || !(name.starts_with('.') || name == "node_modules")
            });
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .path()
                .extension()
                .map(|ext| extensions.contains(&ext.to_string_lossy().to_ascii_lowercase()))
                .unwrap_or(false);
            if matches {
                files.push(entry.into_path());
            }
        }
    }
    files.dedup();
    files
}

/// Directory remote downloads land in for a given output root.
///
/// Keyed by the current user and the output root so parallel checkouts or
/// users on one machine do not share partially written files.
pub fn download_dir(output_root: &Path) -> PathBuf {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let key = format!("{user}-{}", output_root.display());
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    std::env::temp_dir().join(format!("respimg-{}", &digest[..16]))
}

/// Local path a remote URL downloads to.
pub fn remote_target(url: &str, output_root: &Path) -> Result<PathBuf, SourceError> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let name = trimmed
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| SourceError::NoFileName(url.to_string()))?;
    Ok(download_dir(output_root).join(name))
}

/// Download `url` unless a previous download is already on disk.
///
/// Returns the local path and whether the network was used.
pub fn fetch_remote(url: &str, output_root: &Path) -> Result<(PathBuf, bool), SourceError> {
    let target = remote_target(url, output_root)?;
    if target.exists() {
        return Ok((target, false));
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let response = ureq::get(url).call().map_err(|err| SourceError::Download {
        url: url.to_string(),
        message: match err {
            ureq::Error::Status(code, _) => format!("HTTP {code}"),
            other => other.to_string(),
        },
    })?;

    let partial = target.with_extension("part");
    {
        let mut file = std::fs::File::create(&partial)?;
        io::copy(&mut response.into_reader(), &mut file)?;
    }
    std::fs::rename(&partial, &target)?;
    Ok((target, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::SourceInfo;
    use crate::imaging::backend::tests::MockTranscoder;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(root: &Path) -> Config {
        Config {
            search_paths: vec![root.join("images")],
            output_path: root.join("static"),
            ..Config::default()
        }
    }

    // =========================================================================
    // Loading
    // =========================================================================

    #[test]
    fn load_hashes_and_identifies() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Photo.JPG");
        fs::write(&path, b"pixels").unwrap();
        let mock = MockTranscoder::with_dimensions(2000, 1500);

        let source = SourceImage::load(&path, &mock).unwrap();
        assert_eq!(source.name, "Photo.JPG");
        assert_eq!(source.stem, "Photo");
        assert_eq!(source.extension, "jpg");
        assert_eq!(source.size, 6);
        assert_eq!(source.width, 2000);
        assert_eq!(source.hash, hash_file(&path).unwrap());
        assert_eq!(source.remote_url, None);
    }

    #[test]
    fn load_reports_unsupported_format() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.jpg");
        fs::write(&path, b"??").unwrap();
        let mock = MockTranscoder::with_dimensions(10, 10);
        mock.reject("broken.jpg");

        let err = SourceImage::load(&path, &mock).unwrap_err();
        assert!(matches!(
            err,
            SourceError::Identify {
                source: TranscodeError::UnsupportedFormat(_),
                ..
            }
        ));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let mock = MockTranscoder::with_dimensions(10, 10);
        let err = SourceImage::load(Path::new("/nonexistent/x.jpg"), &mock).unwrap_err();
        assert!(matches!(err, SourceError::Io(_)));
    }

    #[test]
    fn load_remote_keeps_url() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.png");
        fs::write(&path, b"x").unwrap();
        let mock = MockTranscoder::new();
        mock.set_source(
            "a.png",
            SourceInfo {
                format: "png".into(),
                width: 4,
                height: 4,
                has_alpha: true,
            },
        );
        let source = SourceImage::load_remote(&path, "https://x.test/a.png", &mock).unwrap();
        assert_eq!(source.origin(), "https://x.test/a.png");
    }

    #[test]
    fn hash_changes_with_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f.bin");
        fs::write(&path, b"one").unwrap();
        let h1 = hash_file(&path).unwrap();
        fs::write(&path, b"two").unwrap();
        assert_ne!(h1, hash_file(&path).unwrap());
        assert_eq!(h1.len(), 64);
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    #[test]
    fn discover_filters_by_extension_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let images = tmp.path().join("images");
        fs::create_dir_all(images.join("nested")).unwrap();
        fs::write(images.join("b.jpg"), b"x").unwrap();
        fs::write(images.join("A.PNG"), b"x").unwrap();
        fs::write(images.join("nested/c.webp"), b"x").unwrap();
        fs::write(images.join("notes.txt"), b"x").unwrap();

        let files = discover_files(&config_for(tmp.path()));
        let names: Vec<String> = files.iter().map(|p| file_name(p)).collect();
        assert_eq!(names, ["A.PNG", "b.jpg", "c.webp"]);
    }

    #[test]
    fn discover_skips_hidden_and_output_dirs() {
        let tmp = TempDir::new().unwrap();
        let images = tmp.path().join("images");
        fs::create_dir_all(images.join(".cache")).unwrap();
        fs::create_dir_all(images.join("out")).unwrap();
        fs::write(images.join(".cache/x.jpg"), b"x").unwrap();
        fs::write(images.join("out/y.jpg"), b"x").unwrap();
        fs::write(images.join("z.jpg"), b"x").unwrap();

        let config = Config {
            output_path: images.join("out"),
            ..config_for(tmp.path())
        };
        let files = discover_files(&config);
        assert_eq!(files, vec![images.join("z.jpg")]);
    }

    #[test]
    fn discover_skips_output_dir_spelled_differently() {
        let tmp = TempDir::new().unwrap();
        let images = tmp.path().join("images");
        fs::create_dir_all(images.join("nested")).unwrap();
        fs::create_dir_all(images.join("out/images")).unwrap();
        fs::write(images.join("out/images/derived_480.jpg"), b"x").unwrap();
        fs::write(images.join("z.jpg"), b"x").unwrap();

        let config = Config {
            search_paths: vec![images.join("nested/..")],
            output_path: images.join("nested/../out"),
            ..config_for(tmp.path())
        };
        let files = discover_files(&config);
        let names: Vec<String> = files.iter().map(|p| file_name(p)).collect();
        assert_eq!(names, ["z.jpg"]);
    }

    #[test]
    fn discover_skips_output_dir_created_after_first_walk() {
        let tmp = TempDir::new().unwrap();
        let images = tmp.path().join("images");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("z.jpg"), b"x").unwrap();
        let config = Config {
            output_path: images.join("out"),
            ..config_for(tmp.path())
        };
        assert_eq!(discover_files(&config).len(), 1);

        fs::create_dir_all(images.join("out")).unwrap();
        fs::write(images.join("out/z_480.jpg"), b"x").unwrap();
        assert_eq!(discover_files(&config), vec![images.join("z.jpg")]);
    }

    #[test]
    fn hash_matches_in_memory_digest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("big.bin");
        let bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &bytes).unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            format!("{:x}", Sha256::digest(&bytes))
        );
    }

    #[test]
    fn discover_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(discover_files(&config_for(tmp.path())).is_empty());
    }

    // =========================================================================
    // Remote
    // =========================================================================

    #[test]
    fn is_remote_detects_http() {
        assert!(is_remote("https://example.com/a.jpg"));
        assert!(is_remote("HTTP://example.com/a.jpg"));
        assert!(!is_remote("/local/a.jpg"));
        assert!(!is_remote("ftp://example.com/a.jpg"));
    }

    #[test]
    fn download_dir_depends_on_output_root() {
        assert_eq!(download_dir(Path::new("a")), download_dir(Path::new("a")));
        assert_ne!(download_dir(Path::new("a")), download_dir(Path::new("b")));
    }

    #[test]
    fn remote_target_uses_last_segment() {
        let target = remote_target("https://cdn.test/img/photo.jpg?v=2", Path::new("out")).unwrap();
        assert_eq!(target.file_name().unwrap(), "photo.jpg");
        assert!(target.starts_with(download_dir(Path::new("out"))));
    }

    #[test]
    fn remote_target_without_name_fails() {
        assert!(matches!(
            remote_target("https://cdn.test/", Path::new("out")),
            Err(SourceError::NoFileName(_))
        ));
    }

    #[test]
    fn fetch_remote_reuses_existing_download() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("static");
        let url = "https://unreachable.invalid/cached.jpg";
        let target = remote_target(url, &root).unwrap();
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"already here").unwrap();

        let (path, downloaded) = fetch_remote(url, &root).unwrap();
        assert_eq!(path, target);
        assert!(!downloaded);
        fs::remove_file(&target).unwrap();
    }
}
