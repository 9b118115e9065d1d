use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const REFERENCE_HASH: &str = "LEHV6nWB2yk8pyo0adR*.7kCMdnj";

/// 32x24 PNG with red rising along x and green along y.
fn write_gradient(dir: &Path) -> PathBuf {
    let path = dir.join("gradient.png");
    image::RgbaImage::from_fn(32, 24, |x, y| image::Rgba([(x * 8) as u8, (y * 10) as u8, 128, 255]))
        .save(&path)
        .expect("gradient fixture should be written");
    path
}

fn imgcache(cache_dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("imgcache");
    cmd.arg("--cache-dir").arg(cache_dir);
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should contain valid json")
}

#[test]
fn version_prints_package_version() {
    cargo_bin_cmd!("imgcache")
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn encode_gradient_matches_known_hash() {
    let temp = TempDir::new().expect("temp dir should be created");
    let image = write_gradient(temp.path());

    let output = imgcache(&temp.path().join("cache"))
        .arg("encode")
        .arg(&image)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let hash = String::from_utf8(output).expect("hash should be utf-8");
    insta::assert_snapshot!(hash.trim(), @"LxH27k2swxX8mHWWjtf7gJfjfQfj");
}

#[test]
fn encode_honours_component_counts() {
    let temp = TempDir::new().expect("temp dir should be created");
    let image = write_gradient(temp.path());

    imgcache(&temp.path().join("cache"))
        .arg("encode")
        .arg(&image)
        .args(["--components-x", "1", "--components-y", "1"])
        .assert()
        .success()
        .stdout("00H27k\n");
}

#[test]
fn encode_rejects_out_of_range_components() {
    let temp = TempDir::new().expect("temp dir should be created");
    let image = write_gradient(temp.path());

    imgcache(&temp.path().join("cache"))
        .arg("encode")
        .arg(&image)
        .args(["--components-x", "10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("components must be within 1..=9"));
}

#[test]
fn encode_fails_for_missing_file() {
    let temp = TempDir::new().expect("temp dir should be created");

    imgcache(&temp.path().join("cache"))
        .arg("encode")
        .arg(temp.path().join("missing.png"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("resource not found"));
}

#[test]
fn decode_writes_png_of_requested_size() {
    let temp = TempDir::new().expect("temp dir should be created");
    let output_path = temp.path().join("out").join("placeholder.png");

    cargo_bin_cmd!("imgcache")
        .arg("decode")
        .arg(REFERENCE_HASH)
        .args(["--width", "16", "--height", "12"])
        .arg("--output")
        .arg(&output_path)
        .assert()
        .success();

    let image = image::open(&output_path).expect("placeholder should be readable image");
    assert_eq!((image.width(), image.height()), (16, 12));
}

#[test]
fn decode_with_zero_punch_is_flat_average() {
    let temp = TempDir::new().expect("temp dir should be created");
    let output_path = temp.path().join("flat.png");

    cargo_bin_cmd!("imgcache")
        .arg("decode")
        .arg(REFERENCE_HASH)
        .args(["--punch", "0"])
        .arg("--output")
        .arg(&output_path)
        .assert()
        .success();

    let image = image::open(&output_path).expect("placeholder should be readable image").to_rgba8();
    assert!(image.pixels().all(|p| p.0 == [151, 150, 149, 255]));
}

#[test]
fn decode_rejects_malformed_hash() {
    let temp = TempDir::new().expect("temp dir should be created");

    cargo_bin_cmd!("imgcache")
        .arg("decode")
        .arg("abc")
        .arg("--output")
        .arg(temp.path().join("never.png"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid blur hash"));
}

#[test]
fn prefetch_persists_to_disk_and_stats_report_it() {
    let temp = TempDir::new().expect("temp dir should be created");
    let image = write_gradient(temp.path());
    let cache_dir = temp.path().join("cache");

    let output = imgcache(&cache_dir)
        .arg("prefetch")
        .arg(&image)
        .assert()
        .success()
        .get_output()
        .clone();
    let summary = stdout_json(&output);
    assert_eq!(summary["requested"], 1);
    assert_eq!(summary["ready"], 1);
    assert_eq!(summary["failed"], Value::Array(Vec::new()));

    let output = imgcache(&cache_dir).arg("stats").assert().success().get_output().clone();
    let stats = stdout_json(&output);
    assert_eq!(stats["memory"]["entries"], 0);
    assert_eq!(stats["disk"]["entries"], 1);
    assert!(stats["disk"]["used_bytes"].as_u64().unwrap_or(0) > 0);
}

#[test]
fn prefetch_reports_failures() {
    let temp = TempDir::new().expect("temp dir should be created");
    let image = write_gradient(temp.path());
    let missing = temp.path().join("missing.png");

    let output = imgcache(&temp.path().join("cache"))
        .arg("prefetch")
        .arg(&image)
        .arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 of 2 sources failed to load"))
        .get_output()
        .clone();

    let summary = stdout_json(&output);
    assert_eq!(summary["ready"], 1);
    assert_eq!(summary["failed"][0], missing.display().to_string());
}

#[test]
fn clear_disk_removes_entries() {
    let temp = TempDir::new().expect("temp dir should be created");
    let image = write_gradient(temp.path());
    let cache_dir = temp.path().join("cache");

    imgcache(&cache_dir).arg("prefetch").arg(&image).assert().success();
    imgcache(&cache_dir).arg("clear-disk").assert().success().stdout("true\n");

    let output = imgcache(&cache_dir).arg("stats").assert().success().get_output().clone();
    assert_eq!(stdout_json(&output)["disk"]["entries"], 0);
}

#[test]
fn cache_dir_can_come_from_environment() {
    let temp = TempDir::new().expect("temp dir should be created");
    let image = write_gradient(temp.path());
    let cache_dir = temp.path().join("env-cache");

    cargo_bin_cmd!("imgcache")
        .env("IMGCACHE_CACHE_DIR", &cache_dir)
        .arg("prefetch")
        .arg(&image)
        .assert()
        .success();

    let entries = std::fs::read_dir(&cache_dir)
        .expect("cache dir should exist")
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "img"))
        .count();
    assert_eq!(entries, 1);
}

#[test]
fn config_file_is_applied() {
    let temp = TempDir::new().expect("temp dir should be created");
    let cache_dir = temp.path().join("configured");
    let config_path = temp.path().join("imgcache.toml");
    std::fs::write(
        &config_path,
        format!("disk_cache_mb = 8\ndisk_cache_dir = {:?}\n", cache_dir.display().to_string()),
    )
    .expect("config should be written");

    let output = cargo_bin_cmd!("imgcache")
        .arg("--config")
        .arg(&config_path)
        .arg("stats")
        .assert()
        .success()
        .get_output()
        .clone();

    let stats = stdout_json(&output);
    assert_eq!(stats["disk"]["limit_bytes"], 8 * 1024 * 1024);
    assert_eq!(stats["disk"]["dir"], cache_dir.display().to_string());
}

#[test]
fn invalid_config_file_fails() {
    let temp = TempDir::new().expect("temp dir should be created");
    let config_path = temp.path().join("bad.toml");
    std::fs::write(&config_path, "disk_cache_mb = \"lots\"\n").expect("config should be written");

    cargo_bin_cmd!("imgcache")
        .arg("--config")
        .arg(&config_path)
        .arg("stats")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config"));
}
