//! Integration tests for the Quire CLI

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Create a simple Markdown file for testing
fn create_test_markdown(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).expect("Failed to write test file");
    path
}

fn quire() -> Command {
    Command::cargo_bin("quire").unwrap()
}

const BOOK: &str = "# My Amazing Book\n\nIntroduction.\n\n## Chapter 1\n\nContent here.\n\n## Chapter 2\n\nMore content.";

#[test]
fn test_help() {
    quire()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("convert"))
        .stdout(predicate::str::contains("info"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("batch"))
        .stdout(predicate::str::contains("polish"))
        .stdout(predicate::str::contains("formats"));
}

#[test]
fn test_version() {
    quire()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("quire"));
}

#[test]
fn test_convert_missing_output_is_usage_error() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", "# Test\n\nContent");

    quire()
        .args(["convert", input.to_str().unwrap()])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_convert_nonexistent_file() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("output.epub");

    quire()
        .args(["convert", "/nonexistent/file.epub", output.to_str().unwrap()])
        .assert()
        .code(1);
    assert!(!output.exists());
}

#[test]
fn test_convert_unknown_option() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", BOOK);
    let output = temp_dir.path().join("output.epub");

    quire()
        .args([
            "convert",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            "--no-such-option=1",
        ])
        .assert()
        .code(2);
    assert!(!output.exists());
}

#[test]
fn test_convert_invalid_option_value() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", BOOK);
    let output = temp_dir.path().join("output.epub");

    quire()
        .args([
            "convert",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            "--epub-version=7",
        ])
        .assert()
        .code(2);
}

#[test]
fn test_convert_unsupported_output() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", BOOK);
    let output = temp_dir.path().join("output.lrf");

    quire()
        .args(["convert", input.to_str().unwrap(), output.to_str().unwrap()])
        .assert()
        .code(2);
}

#[test]
fn test_convert_markdown_to_epub() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", BOOK);
    let output = temp_dir.path().join("output.epub");

    quire()
        .args(["convert", input.to_str().unwrap(), output.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("(epub)"));

    let file = fs::File::open(&output).unwrap();
    let mut archive = zip::ZipArchive::new(file).expect("Output should be a valid ZIP/EPUB file");
    let mut mimetype = String::new();
    std::io::Read::read_to_string(&mut archive.by_index(0).unwrap(), &mut mimetype).unwrap();
    assert_eq!(mimetype, "application/epub+zip");
}

#[test]
fn test_convert_markdown_to_txt_with_options() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", BOOK);
    let output = temp_dir.path().join("output.txt");

    quire()
        .args([
            "convert",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            "--newline=windows",
            "--max-line-length",
            "40",
        ])
        .assert()
        .success();

    let text = fs::read_to_string(&output).unwrap();
    assert!(text.contains("Chapter 1\r\n"));
    assert!(text.lines().all(|l| l.trim_end_matches('\r').chars().count() <= 40));
}

#[test]
fn test_convert_to_directory() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", BOOK);
    let output = temp_dir.path().join("unpacked");

    quire()
        .args(["convert", input.to_str().unwrap(), output.to_str().unwrap()])
        .assert()
        .success();
    assert!(output.join("content.opf").exists());
}

#[test]
fn test_info_markdown() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", BOOK);

    quire()
        .args(["info", input.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("My Amazing Book"))
        .stdout(predicate::str::contains("Chapter 2"));
}

#[test]
fn test_info_json_output() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", BOOK);

    let output = quire()
        .args(["info", "--json", input.to_str().unwrap()])
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("Output should be valid JSON");
    assert_eq!(json["title"], "My Amazing Book");
    assert_eq!(json["format"], "txt");
    assert!(json["toc"].as_array().is_some_and(|t| !t.is_empty()));
}

#[test]
fn test_info_nonexistent_file() {
    quire().args(["info", "/nonexistent/file.epub"]).assert().failure();
}

#[test]
fn test_validate_markdown() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", "# Valid Book\n\nContent here.");

    quire()
        .args(["validate", input.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Valid TXT file"));
}

#[test]
fn test_validate_strict_fails_on_warnings() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(
        &temp_dir,
        "test.md",
        "# Linked Book\n\nSee [the appendix](missing.html).",
    );

    quire()
        .args(["validate", "--strict", input.to_str().unwrap()])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("warning"));
}

#[test]
fn test_validate_nonexistent_file() {
    quire().args(["validate", "/nonexistent/file.epub"]).assert().failure();
}

#[test]
fn test_batch_missing_output_dir() {
    quire()
        .args(["batch", "/some/input/dir"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--output-dir"));
}

#[test]
fn test_batch_invalid_jobs() {
    quire()
        .args([
            "batch",
            "/some/input/dir",
            "--output-dir",
            "/some/output/dir",
            "--jobs",
            "0",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least 1"));
}

#[test]
fn test_batch_empty_directory() {
    let temp_dir = TempDir::new().unwrap();
    let input_dir = temp_dir.path().join("input");
    let output_dir = temp_dir.path().join("output");

    fs::create_dir_all(&input_dir).unwrap();

    quire()
        .args([
            "batch",
            input_dir.to_str().unwrap(),
            "--output-dir",
            output_dir.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("No supported files"));
}

#[test]
fn test_batch_with_files() {
    let temp_dir = TempDir::new().unwrap();
    let input_dir = temp_dir.path().join("input");
    let output_dir = temp_dir.path().join("output");

    fs::create_dir_all(&input_dir).unwrap();
    fs::write(input_dir.join("book1.md"), "# Book 1\n\nContent of book 1.").unwrap();
    fs::write(input_dir.join("book2.md"), "# Book 2\n\nContent of book 2.").unwrap();

    quire()
        .args([
            "batch",
            input_dir.to_str().unwrap(),
            "--output-dir",
            output_dir.to_str().unwrap(),
            "--format",
            "fb2",
            "--jobs",
            "2",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Success: 2"));

    assert!(output_dir.join("book1.fb2").exists());
    assert!(output_dir.join("book2.fb2").exists());
}

#[test]
fn test_polish_upgrades_epub() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", BOOK);
    let epub2 = temp_dir.path().join("v2.epub");
    let polished = temp_dir.path().join("v3.epub");

    quire()
        .args([
            "convert",
            input.to_str().unwrap(),
            epub2.to_str().unwrap(),
            "--epub-version=2",
        ])
        .assert()
        .success();

    quire()
        .args([
            "polish",
            epub2.to_str().unwrap(),
            polished.to_str().unwrap(),
            "--upgrade-opf",
        ])
        .assert()
        .success();

    let mut archive = zip::ZipArchive::new(fs::File::open(&polished).unwrap()).unwrap();
    let mut opf = String::new();
    std::io::Read::read_to_string(&mut archive.by_name("content.opf").unwrap(), &mut opf).unwrap();
    assert!(opf.contains("version=\"3.0\""));
}

#[test]
fn test_polish_without_actions() {
    let temp_dir = TempDir::new().unwrap();
    quire()
        .args(["polish", "in.epub", temp_dir.path().join("out.epub").to_str().unwrap()])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("nothing to do"));
}

#[test]
fn test_formats() {
    quire()
        .arg("formats")
        .assert()
        .success()
        .stdout(predicate::str::contains("mobi"))
        .stdout(predicate::str::contains("flatten_css"));
}

#[test]
fn test_verbose_flag() {
    let temp_dir = TempDir::new().unwrap();
    let input = create_test_markdown(&temp_dir, "test.md", "# Test\n\nContent");

    quire()
        .args(["--verbose", "info", input.to_str().unwrap()])
        .assert()
        .success();
}
