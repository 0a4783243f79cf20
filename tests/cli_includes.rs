use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn ssi_bin() -> &'static str {
    env!("CARGO_BIN_EXE_ssi")
}

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create parent directory");
    }
    fs::write(path, contents).expect("failed to write test file");
}

fn run_ssi(document: &Path, path_info: &str, extra_env: &[(&str, &str)]) -> Output {
    let mut command = Command::new(ssi_bin());
    command
        .env_clear()
        .env("SILENT_ERRORS", "1")
        .env("SCRIPT_NAME", "/cgi-bin/ssi")
        .env("PATH_INFO", path_info)
        .env("PATH_TRANSLATED", document);
    for (name, value) in extra_env {
        command.env(name, value);
    }
    command.output().expect("failed to execute ssi")
}

fn body(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .strip_prefix("Content-type: text/html\n\n")
        .unwrap_or_else(|| panic!("missing header: {stdout}"))
        .to_string()
}

#[test]
fn cli_includes_nested_documents() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let root = temp_dir.path();
    write_file(
        &root.join("index.shtml"),
        "<body><!--#include virtual=\"/inc/header.html\" --></body>",
    );
    write_file(
        &root.join("inc/header.html"),
        "<h1><!--#include file=\"title.txt\" --></h1>",
    );
    write_file(&root.join("inc/title.txt"), "Title from <!--#echo var=\"DOCUMENT_URI\" -->");

    let output = run_ssi(&root.join("index.shtml"), "/index.shtml", &[]);

    assert!(output.status.success(), "expected success");
    assert_eq!(
        body(&output),
        "<body><h1>Title from /inc/title.txt</h1></body>"
    );
}

#[test]
fn cli_self_include_stops_at_depth_limit() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let document = temp_dir.path().join("a.shtml");
    write_file(&document, "x<!--#include virtual=\"/a.shtml\" -->");

    let output = run_ssi(&document, "/a.shtml", &[("SSI_MAX_INCLUDE_DEPTH", "5")]);

    assert!(
        output.status.success(),
        "expected success, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(body(&output), "xxxxxx");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("exceeds the maximum include depth of 5"),
        "stderr: {stderr}"
    );
}

#[test]
fn cli_depth_limit_from_environment() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let document = temp_dir.path().join("a.shtml");
    write_file(&document, "y<!--#include file=\"a.shtml\" -->");

    let output = Command::new(ssi_bin())
        .env_clear()
        .env("SILENT_ERRORS", "1")
        .env("SSI_MAX_INCLUDE_DEPTH", "1")
        .env("SCRIPT_NAME", "/cgi-bin/ssi")
        .env("PATH_INFO", "/a.shtml")
        .env("PATH_TRANSLATED", &document)
        .output()
        .expect("failed to execute ssi");

    assert!(output.status.success(), "expected success");
    assert_eq!(body(&output), "yy");
}

#[test]
fn cli_rejects_traversal_without_touching_output() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let document = temp_dir.path().join("index.shtml");
    write_file(
        &document,
        "[<!--#include file=\"../../etc/passwd\" -->][<!--#fsize file=\"/etc/passwd\" -->]",
    );

    let output = run_ssi(&document, "/index.shtml", &[]);

    assert!(output.status.success(), "expected success");
    assert_eq!(body(&output), "[][]");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("include file=../../etc/passwd directive is not allowed"),
        "stderr: {stderr}"
    );
}
