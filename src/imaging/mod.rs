//! Transcode adapter: pure Rust, no system image libraries.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** | `image` decoder headers (dimensions, color type) |
//! | **Resize** | Lanczos3, crop-to-fill when the task fixes an aspect ratio |
//! | **Encode** | JPEG, PNG, AVIF (rav1e), inline PNG data URI |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for width/height math (unit testable)
//! - **Parameters**: [`Encode`] union and [`TranscodeRequest`]
//! - **Backend**: [`Transcoder`] trait + [`RustTranscoder`]

pub mod backend;
mod calculations;
mod params;
pub mod rust_backend;

pub use backend::{Artifact, SourceInfo, TranscodeError, Transcoded, Transcoder, is_data_uri};
pub use calculations::{planned_widths, scaled_height, target_height};
pub use params::{Destination, Encode, Quality, TranscodeRequest};
pub use rust_backend::{RustTranscoder, supported_input_extensions};
