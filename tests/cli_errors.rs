use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

fn ssi_bin() -> &'static str {
    env!("CARGO_BIN_EXE_ssi")
}

fn write_file(path: &Path, contents: &str) {
    fs::write(path, contents).expect("failed to write test file");
}

fn base_command() -> Command {
    let mut command = Command::new(ssi_bin());
    command
        .env_clear()
        .env("SERVER_SOFTWARE", "merecat/2.32")
        .env("SERVER_NAME", "example.org")
        .env("SERVER_PORT", "8080");
    command
}

#[test]
fn cli_missing_script_name_renders_internal_error() {
    let output = base_command()
        .env("PATH_TRANSLATED", "/tmp/whatever.shtml")
        .output()
        .expect("failed to execute ssi");

    assert!(
        !output.status.success(),
        "expected failure, status: {:?}",
        output.status.code()
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("Content-type: text/html\n\n<!DOCTYPE html>"));
    assert!(stdout.contains("500 Internal Error"), "stdout: {stdout}");
    assert!(
        stdout.contains("Couldn't get SCRIPT_NAME environment variable."),
        "stdout: {stdout}"
    );
    assert!(
        stdout.contains("merecat/2.32 httpd at example.org port 8080"),
        "stdout: {stdout}"
    );
}

#[test]
fn cli_missing_path_translated_renders_internal_error() {
    let output = base_command()
        .env("SCRIPT_NAME", "/cgi-bin/ssi")
        .output()
        .expect("failed to execute ssi");

    assert!(!output.status.success(), "expected failure");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Couldn't get PATH_TRANSLATED environment variable."),
        "stdout: {stdout}"
    );
}

#[test]
fn cli_missing_document_renders_not_found() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let missing = temp_dir.path().join("missing.shtml");

    let output = base_command()
        .env("SCRIPT_NAME", "/cgi-bin/ssi")
        .env("PATH_TRANSLATED", &missing)
        .output()
        .expect("failed to execute ssi");

    assert!(!output.status.success(), "expected failure");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("404 Not Found"), "stdout: {stdout}");
    assert!(stdout.contains("does not seem to exist"), "stdout: {stdout}");
}

#[test]
fn cli_auth_protected_directory_is_forbidden() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let document = temp_dir.path().join("private.shtml");
    write_file(&document, "secret contents");
    write_file(&temp_dir.path().join(".htpasswd"), "admin:hash");

    let output = base_command()
        .env("SCRIPT_NAME", "/cgi-bin/ssi")
        .env("PATH_TRANSLATED", &document)
        .output()
        .expect("failed to execute ssi");

    assert!(!output.status.success(), "expected failure");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("403 Forbidden"), "stdout: {stdout}");
    assert!(
        !stdout.contains("secret contents"),
        "document must not leak: {stdout}"
    );
}

#[test]
fn cli_cgi_pattern_override_blocks_document() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let document = temp_dir.path().join("script.pl");
    write_file(&document, "print 'hi';");

    let output = base_command()
        .env("SCRIPT_NAME", "/cgi-bin/ssi")
        .env("PATH_TRANSLATED", &document)
        .env("CGI_PATTERN", "*.pl|*.py")
        .output()
        .expect("failed to execute ssi");

    assert!(!output.status.success(), "expected failure");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("403 Forbidden"), "stdout: {stdout}");
    assert!(!stdout.contains("print 'hi'"), "stdout: {stdout}");
}

#[test]
fn cli_invalid_cgi_pattern_fails_closed() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let document = temp_dir.path().join("index.shtml");
    write_file(&document, "visible");

    let output = base_command()
        .env("SCRIPT_NAME", "/cgi-bin/ssi")
        .env("PATH_TRANSLATED", &document)
        .env("CGI_PATTERN", "[")
        .output()
        .expect("failed to execute ssi");

    assert!(!output.status.success(), "expected failure");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Invalid CGI pattern"), "stdout: {stdout}");
    assert!(!stdout.contains("visible"), "stdout: {stdout}");
}

#[test]
fn cli_query_words_cannot_change_output_or_settings() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let document = temp_dir.path().join("index.shtml");
    write_file(&document, "[<!--#include file=p.html -->]");
    write_file(&temp_dir.path().join("p.html"), "PART");

    for words in [&["--help"][..], &["--version"][..], &["-d", "0"][..], &["-v"][..]] {
        let output = base_command()
            .args(words)
            .env("SCRIPT_NAME", "/cgi-bin/ssi")
            .env("PATH_INFO", "/index.shtml")
            .env("PATH_TRANSLATED", &document)
            .output()
            .expect("failed to execute ssi");

        assert!(
            output.status.success(),
            "args {words:?} failed, stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            "Content-type: text/html\n\n[PART]",
            "args {words:?} changed the response"
        );
    }
}
