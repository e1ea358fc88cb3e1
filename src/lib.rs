//! # respimg
//!
//! An incremental builder for responsive image variants. Each source image is
//! resized and re-encoded once per configured task and width; a cache file
//! records what was produced so later runs only encode what is missing.
//!
//! # Architecture: One Pass, Persisted Progress
//!
//! ```text
//! discover  search_paths + remote_sources  →  SourceImage (hash, dimensions)
//! plan      tasks × widths × sources        →  satisfied / stale / needed
//! run       needed + stale jobs             →  OutputResult, persisted one by one
//! publish   outputs grouped per source      →  <base_url>/<stem>.json
//! ```
//!
//! The cache is the only state carried between runs. Every completed job is
//! written to it before the next job starts, so an interrupted run resumes
//! where it stopped and an unchanged tree plans zero jobs.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | `respimg.toml` loading, defaults, validation, configuration checksum |
//! | [`source`] | Discovery (walkdir), remote download (ureq), content hashing |
//! | [`naming`] | Output path resolver: one deterministic identity per (source, task, width) |
//! | [`imaging`] | Transcoder trait and the pure-Rust implementation on the `image` crate |
//! | [`cache`] | Derivation cache store, validity rules, cache lock, stats |
//! | [`plan`] | Classifies every output as satisfied, stale or needed |
//! | [`run`] | Executes jobs in order, sequentially or in rayon batches, with cancellation |
//! | [`aggregate`] | Builds srcset/sizes/inline info records |
//! | [`journal`] | Run event log passed through every stage, flushed to a dated file |
//! | [`output`] | CLI output formatting |
//! | [`pipeline`] | Wires the stages together |
//!
//! # Design Decisions
//!
//! ## Content-Addressed Identity
//!
//! Sources are identified by the SHA-256 of their bytes, not by mtime, so a
//! fresh checkout (which resets modification times) does not re-encode
//! anything. With `naming = "hash"` the hash is also the output file token;
//! `naming = "basename"` keeps readable file names at the cost of keying
//! cache records by file name.
//!
//! ## Records Carry Their Checksum
//!
//! Each cache record stores the configuration checksum it was produced
//! under. Changing any task option makes those records invalid without
//! deleting them; they are replaced as their sources are reprocessed.
//!
//! ## Explicit Journal Instead of Global Log State
//!
//! Stages append structured events to a [`journal::Journal`] they receive by
//! `&mut`. The CLI listens on a channel to print progress; the journal is
//! flushed to `YYYY-MM-DD-HHMMSS.log` under the output directory at the end
//! of a run.
//!
//! ## Pure-Rust Imaging
//!
//! [`imaging::RustTranscoder`] uses the `image` crate for decoding, Lanczos3
//! resampling, and JPEG/PNG/AVIF encoding. No system libraries are needed.
//! The [`imaging::Transcoder`] trait is the seam tests replace with a mock.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod imaging;
pub mod journal;
pub mod naming;
pub mod output;
pub mod pipeline;
pub mod plan;
pub mod run;
pub mod source;

#[cfg(test)]
pub(crate) mod test_helpers;
