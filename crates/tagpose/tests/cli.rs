use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tagpose::calib::{CalibrationStore, FileCalibrationStore};
use tagpose::core::CalibrationParameters;

fn tagpose() -> Command {
    Command::cargo_bin("tagpose").expect("binary built")
}

fn write_record(path: &Path, distortion: Vec<f64>) {
    let record = CalibrationParameters {
        camera_matrix: [[350.0, 0.0, 240.0], [0.0, 350.0, 120.0], [0.0, 0.0, 1.0]],
        distortion,
        image_size: Some([480, 240]),
        rms_error: Some(0.31),
        views: Some(10),
    };
    FileCalibrationStore::new(path).save(&record).expect("save");
}

#[test]
fn help_lists_subcommands() {
    tagpose()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("undistort"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn show_prints_stored_intrinsics() {
    let dir = tempfile::tempdir().expect("tempdir");
    let record = dir.path().join("camera.json");
    write_record(&record, vec![0.0; 5]);

    tagpose()
        .args(["show", "--calibration"])
        .arg(&record)
        .assert()
        .success()
        .stdout(predicate::str::contains("350.000, 350.000"))
        .stdout(predicate::str::contains("240.000, 120.000"))
        .stdout(predicate::str::contains("views:      10"));
}

#[test]
fn show_without_record_fails_with_guidance() {
    let dir = tempfile::tempdir().expect("tempdir");
    tagpose()
        .args(["show", "--calibration"])
        .arg(dir.path().join("missing.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("no calibration record"));
}

#[test]
fn config_file_overrides_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("tagpose.json");
    std::fs::write(&config, r#"{ "tag_size": 0.05, "resolution": [640, 480] }"#).expect("write");

    tagpose()
        .args(["config", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tag_size\": 0.05"))
        .stdout(predicate::str::contains("\"tag_family\": \"tag36h11\""))
        .stdout(predicate::str::contains("640"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("tagpose.json");
    std::fs::write(&config, r#"{ "undistort_alpha": 3.0 }"#).expect("write");

    tagpose()
        .args(["config", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("undistort_alpha"));
}

#[test]
fn undistort_with_zero_distortion_copies_pixels() {
    let dir = tempfile::tempdir().expect("tempdir");
    let record = dir.path().join("camera.json");
    write_record(&record, vec![0.0; 5]);

    let input = dir.path().join("in.png");
    let output = dir.path().join("out.png");
    let img = image::RgbImage::from_fn(48, 24, |x, y| {
        image::Rgb([(x * 5) as u8, (y * 9) as u8, ((x + y) * 3) as u8])
    });
    img.save(&input).expect("write input");

    tagpose()
        .args(["undistort", "--calibration"])
        .arg(&record)
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    let out = image::open(&output).expect("read output").to_rgb8();
    assert_eq!(out, img);
}

#[test]
fn undistort_requires_a_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.png");
    image::RgbImage::new(8, 8).save(&input).expect("write input");

    tagpose()
        .args(["undistort", "--calibration"])
        .arg(dir.path().join("missing.json"))
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(dir.path().join("out.png"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("no calibration record"));
}
