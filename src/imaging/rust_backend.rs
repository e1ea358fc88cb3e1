//! Pure Rust transcoder built on the `image` crate.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, TIFF, WebP) | `image` crate decoders |
//! | Identify (no full decode) | `ImageReader::into_decoder` → dimensions + color type |
//! | Resize | `resize_exact` / `resize_to_fill` with `Lanczos3` |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` |
//! | Encode → PNG / inline | `image::codecs::png::PngEncoder` |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e) |
//! | Inline payload | `base64` standard engine, `data:image/png;base64,` prefix |

use super::backend::{Artifact, SourceInfo, TranscodeError, Transcoded, Transcoder};
use super::calculations::scaled_height;
use super::params::{Destination, Encode, Quality, TranscodeRequest};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::png::{CompressionType, FilterType as PngFilter};
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::path::Path;

/// Extensions whose decoders are compiled in.
const INPUT_FORMATS: &[(&str, ImageFormat)] = &[
    ("jpg", ImageFormat::Jpeg),
    ("jpeg", ImageFormat::Jpeg),
    ("png", ImageFormat::Png),
    ("tif", ImageFormat::Tiff),
    ("tiff", ImageFormat::Tiff),
    ("webp", ImageFormat::WebP),
];

/// Returns the set of source file extensions that can be decoded.
pub fn supported_input_extensions() -> Vec<&'static str> {
    INPUT_FORMATS
        .iter()
        .filter(|(_, fmt)| fmt.reading_enabled())
        .map(|(ext, _)| *ext)
        .collect()
}

fn format_name(format: ImageFormat) -> String {
    format
        .extensions_str()
        .first()
        .map(|e| e.to_string())
        .unwrap_or_else(|| format!("{format:?}").to_lowercase())
}

/// Pure Rust transcoder using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustTranscoder;

impl RustTranscoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

fn open_reader(path: &Path) -> Result<ImageReader<std::io::BufReader<std::fs::File>>, TranscodeError> {
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    match reader.format() {
        Some(fmt) if fmt.reading_enabled() => Ok(reader),
        Some(fmt) => Err(TranscodeError::UnsupportedFormat(format!(
            "{} ({})",
            path.display(),
            format_name(fmt)
        ))),
        None => Err(TranscodeError::UnsupportedFormat(
            path.display().to_string(),
        )),
    }
}

fn load_image(path: &Path) -> Result<DynamicImage, TranscodeError> {
    open_reader(path)?
        .decode()
        .map_err(|e| TranscodeError::Failed(format!("Failed to decode {}: {}", path.display(), e)))
}

/// Resize to the requested box. A fixed height crops to fill; otherwise the
/// source proportions are kept.
fn resize(img: &DynamicImage, width: u32, height: Option<u32>) -> DynamicImage {
    let (src_w, src_h) = (img.width(), img.height());
    match height {
        Some(h) => img.resize_to_fill(width, h, FilterType::Lanczos3),
        None if width == src_w => img.clone(),
        None => img.resize_exact(width, scaled_height((src_w, src_h), width), FilterType::Lanczos3),
    }
}

fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn encode_err(format: &str, e: image::ImageError) -> TranscodeError {
    match e {
        image::ImageError::Unsupported(u) => {
            TranscodeError::UnsupportedFormat(format!("{format}: {u}"))
        }
        other => TranscodeError::Failed(format!("{format} encode failed: {other}")),
    }
}

/// Encode into memory. Returns the bytes and whether the encoded image
/// carries an alpha channel.
fn encode(img: &DynamicImage, encode: &Encode) -> Result<(Vec<u8>, bool), TranscodeError> {
    let mut buf = Vec::new();
    match encode {
        Encode::Jpeg { quality } => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut buf,
                Quality::new(*quality).value() as u8,
            );
            rgb.write_with_encoder(encoder)
                .map_err(|e| encode_err("jpeg", e))?;
            Ok((buf, false))
        }
        Encode::Png { compression_level } => {
            let encoder = image::codecs::png::PngEncoder::new_with_quality(
                &mut buf,
                png_compression(*compression_level),
                PngFilter::Adaptive,
            );
            img.write_with_encoder(encoder)
                .map_err(|e| encode_err("png", e))?;
            Ok((buf, img.color().has_alpha()))
        }
        Encode::Inline { .. } => {
            let encoder = image::codecs::png::PngEncoder::new(&mut buf);
            img.write_with_encoder(encoder)
                .map_err(|e| encode_err("inline", e))?;
            Ok((buf, img.color().has_alpha()))
        }
        Encode::Avif { quality, speed } => {
            let encoder = image::codecs::avif::AvifEncoder::new_with_speed_quality(
                &mut buf,
                (*speed).clamp(1, 10),
                Quality::new(*quality).value() as u8,
            );
            img.write_with_encoder(encoder)
                .map_err(|e| encode_err("avif", e))?;
            Ok((buf, img.color().has_alpha()))
        }
    }
}

impl Transcoder for RustTranscoder {
    fn identify(&self, path: &Path) -> Result<SourceInfo, TranscodeError> {
        let reader = open_reader(path)?;
        let format = reader.format().map(format_name).unwrap_or_default();
        let decoder = reader.into_decoder().map_err(|e| match e {
            image::ImageError::Unsupported(u) => {
                TranscodeError::UnsupportedFormat(format!("{}: {u}", path.display()))
            }
            other => TranscodeError::Failed(format!("Failed to read {}: {other}", path.display())),
        })?;
        let (width, height) = decoder.dimensions();
        Ok(SourceInfo {
            format,
            width,
            height,
            has_alpha: decoder.color_type().has_alpha(),
        })
    }

    fn transcode(&self, request: &TranscodeRequest) -> Result<Transcoded, TranscodeError> {
        if request.encode.is_inline() && request.destination != Destination::Inline {
            return Err(TranscodeError::UnsupportedFormat(
                "inline output cannot be written to a file".into(),
            ));
        }
        let img = load_image(&request.source)?;
        let resized = resize(&img, request.width, request.height);
        let (bytes, has_alpha) = encode(&resized, &request.encode)?;
        let size = bytes.len() as u64;

        let artifact = match &request.destination {
            Destination::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, &bytes)?;
                Artifact::File(path.clone())
            }
            Destination::Inline => {
                let mime = match request.encode {
                    Encode::Jpeg { .. } => "jpeg",
                    Encode::Avif { .. } => "avif",
                    Encode::Png { .. } | Encode::Inline { .. } => "png",
                };
                Artifact::Inline(format!("data:image/{mime};base64,{}", STANDARD.encode(&bytes)))
            }
        };

        Ok(Transcoded {
            format: request.encode.name().to_string(),
            width: resized.width(),
            height: resized.height(),
            size,
            has_alpha,
            artifact,
        })
    }
}
