//! End-to-end tests for the `pixelpool` binary.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::io::Cursor;
use std::path::Path;

use assert_cmd::Command;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use predicates::prelude::*;
use tempfile::TempDir;

fn write_png(path: &Path, width: u32, height: u32) {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 3 % 256) as u8, (y * 7 % 256) as u8, 200])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn pixelpool() -> Command {
    let mut cmd = Command::cargo_bin("pixelpool").unwrap();
    cmd.env_remove("PIXELPOOL_WORKERS")
        .env_remove("PIXELPOOL_ISOLATION");
    cmd
}

fn json_report(output: &[u8]) -> serde_json::Value {
    serde_json::from_slice(output).expect("stdout should be a JSON report")
}

#[test]
fn test_converts_png_to_webp_next_to_input() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("cat.png");
    write_png(&input, 32, 24);

    pixelpool()
        .args(["convert", "--workers", "1"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("Converted 1 file(s), 0 failed, 0 skipped"));

    let output = std::fs::read(dir.path().join("cat.webp")).unwrap();
    assert_eq!(&output[..4], b"RIFF");
}

#[test]
fn test_json_report_and_out_dir() {
    let dir = TempDir::new().unwrap();
    let out_dir = dir.path().join("converted");
    let first = dir.path().join("a.png");
    let second = dir.path().join("b.png");
    write_png(&first, 40, 40);
    write_png(&second, 16, 8);

    let assert = pixelpool()
        .args(["convert", "--format", "jpeg", "--preset", "lossy", "--json"])
        .arg("--out-dir")
        .arg(&out_dir)
        .arg(&first)
        .arg(&second)
        .assert()
        .success();

    let report = json_report(&assert.get_output().stdout);
    assert_eq!(report["files"].as_array().unwrap().len(), 2);
    assert_eq!(report["files"][0]["status"], "done");
    assert_eq!(report["totals"]["converted_files"], 2);
    assert!(out_dir.join("a.jpg").exists());
    assert!(out_dir.join("b.jpg").exists());
}

#[test]
fn test_resize_percent_scales_output() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("wide.png");
    write_png(&input, 200, 100);

    pixelpool()
        .args(["convert", "--format", "png", "--resize-percent", "50"])
        .arg(&input)
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .assert()
        .success();

    let output = image::open(dir.path().join("out").join("wide.png")).unwrap();
    assert_eq!(output.dimensions(), (100, 50));
}

#[test]
fn test_bad_input_fails_only_that_file() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.png");
    let bad = dir.path().join("bad.png");
    write_png(&good, 8, 8);
    std::fs::write(&bad, b"this is not an image").unwrap();

    let assert = pixelpool()
        .args(["convert", "--json", "--workers", "2"])
        .arg(&bad)
        .arg(&good)
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 of 2 file(s) failed to convert"));

    let report = json_report(&assert.get_output().stdout);
    assert_eq!(report["files"][0]["status"], "error");
    assert_eq!(report["files"][1]["status"], "done");
    assert!(dir.path().join("good.webp").exists());
    assert!(!dir.path().join("bad.webp").exists());
}

#[test]
fn test_missing_file_is_reported_as_failure() {
    let dir = TempDir::new().unwrap();

    pixelpool()
        .args(["convert"])
        .arg(dir.path().join("missing.png"))
        .assert()
        .failure()
        .stdout(predicate::str::contains("Failed to read file"));
}

#[test]
fn test_oversized_file_is_skipped() {
    let dir = TempDir::new().unwrap();
    let huge = dir.path().join("huge.png");
    let file = std::fs::File::create(&huge).unwrap();
    file.set_len(21 * 1024 * 1024).unwrap();

    let assert = pixelpool()
        .args(["convert", "--json"])
        .arg(&huge)
        .assert()
        .success()
        .stderr(predicate::str::contains("Skipped 1 file(s) over 20.0 MB: huge.png"));

    let report = json_report(&assert.get_output().stdout);
    assert_eq!(report["files"][0]["status"], "skipped");
    assert_eq!(report["totals"]["skipped_files"], 1);
    assert!(!dir.path().join("huge.webp").exists());
}

#[test]
fn test_requires_files() {
    pixelpool().arg("convert").assert().failure();
}

#[test]
fn test_rejects_unknown_format() {
    pixelpool()
        .args(["convert", "--format", "tiff", "a.png"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown image format"));
}
