//! Runs from inside the project directory with relative paths.
//!
//! Changes the working directory, so this file holds a single test.

use image::{Rgb, RgbImage};
use respimg::config::{Config, TaskConfig};
use respimg::imaging::{Encode, RustTranscoder};
use respimg::journal::Journal;
use respimg::pipeline::{Pipeline, RunOptions};
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn output_under_search_root_is_never_a_source() {
    let tmp = TempDir::new().unwrap();
    RgbImage::from_fn(400, 300, |x, y| Rgb([x as u8, y as u8, (x ^ y) as u8]))
        .save(tmp.path().join("photo.jpg"))
        .unwrap();
    std::env::set_current_dir(tmp.path()).unwrap();

    let config = Config {
        search_paths: vec![PathBuf::from(".")],
        output_path: PathBuf::from("static"),
        logging: false,
        tasks: vec![TaskConfig {
            name: "default".into(),
            sizes: vec![100, 200],
            aspect_ratio: None,
            fallback: false,
            encode: Encode::Jpeg { quality: 80 },
        }],
        ..Config::default()
    };
    let transcoder = RustTranscoder::new();
    let pipeline = Pipeline::new(&config, &transcoder);

    let runs: Vec<(usize, u32)> = (0..3)
        .map(|_| {
            let summary = pipeline
                .run(&RunOptions::default(), &mut Journal::new())
                .unwrap();
            (summary.sources, summary.stats.jobs())
        })
        .collect();
    assert_eq!(runs, [(1, 2), (1, 0), (1, 0)]);
}
