// CLI integration tests for configuration errors, exit codes and listing.
use std::fs;
use std::process::{Command, Output};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_clickdump");
    let mut command = Command::new(exe);
    command.env("RUST_LOG", "off");
    command
}

fn parse_json_line(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().last().expect("json line");
    serde_json::from_str(line).expect("valid json")
}

fn error_kind(output: &Output) -> String {
    let value = parse_json_line(&output.stderr);
    value["error"]["kind"].as_str().expect("error kind").to_string()
}

#[test]
fn s3_without_bucket_is_a_config_error() {
    let output = cmd()
        .args(["dump", "--backup", "b1", "--storage", "s3"])
        .output()
        .expect("dump");
    assert_eq!(output.status.code(), Some(3));
    let value = parse_json_line(&output.stderr);
    assert_eq!(value["error"]["kind"], "Config");
    assert!(value["error"]["hint"].as_str().unwrap().contains("--s3-bucket"));
}

#[test]
fn file_storage_without_path_is_a_config_error() {
    let output = cmd()
        .args(["restore", "--backup", "b1"])
        .output()
        .expect("restore");
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(error_kind(&output), "Config");
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let output = cmd().args(["dump", "--bogus"]).output().expect("dump");
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(error_kind(&output), "Usage");
}

#[test]
fn missing_password_file_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = cmd()
        .args([
            "restore",
            "--backup",
            "b1",
            "--path",
            temp.path().to_str().unwrap(),
            "--password-file",
            temp.path().join("nope").to_str().unwrap(),
        ])
        .output()
        .expect("restore");
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(error_kind(&output), "Config");
}

#[test]
fn restore_of_unknown_backup_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = cmd()
        .args(["restore", "--backup", "b1", "--path", temp.path().to_str().unwrap()])
        .output()
        .expect("restore");
    assert_eq!(output.status.code(), Some(4));
    let value = parse_json_line(&output.stderr);
    assert_eq!(value["error"]["kind"], "NotFound");
    assert_eq!(value["error"]["object"], "b1/");
}

#[test]
fn zero_parallelism_is_a_usage_error() {
    let output = cmd()
        .args(["restore", "--backup", "b1", "--parallelism", "0", "--path", "."])
        .output()
        .expect("restore");
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(error_kind(&output), "Usage");
}

#[test]
fn invalid_backup_name_is_a_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = cmd()
        .args(["restore", "--backup", "a/b", "--path", temp.path().to_str().unwrap()])
        .output()
        .expect("restore");
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(error_kind(&output), "Usage");
}

#[test]
fn list_shows_backups_then_objects() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    fs::create_dir_all(root.join("b1/sales")).expect("mkdir");
    fs::write(root.join("b1/sales.database.sql"), "CREATE DATABASE sales").expect("write");
    fs::write(root.join("b1/sales/orders.schema.sql"), "CREATE TABLE sales.orders").expect("write");
    fs::create_dir_all(root.join("b2")).expect("mkdir");
    fs::write(root.join("b2/logs.database.sql"), "CREATE DATABASE logs").expect("write");

    let output = cmd()
        .args(["list", "--path", root.to_str().unwrap()])
        .output()
        .expect("list");
    assert!(output.status.success());
    let value = parse_json_line(&output.stdout);
    assert_eq!(value["backups"], serde_json::json!(["b1", "b2"]));

    let output = cmd()
        .args(["list", "--backup", "b1", "--path", root.to_str().unwrap()])
        .output()
        .expect("list backup");
    assert!(output.status.success());
    let value = parse_json_line(&output.stdout);
    assert_eq!(value["backup"], "b1");
    assert_eq!(
        value["objects"],
        serde_json::json!(["b1/sales.database.sql", "b1/sales/"])
    );
}

#[test]
fn storage_config_file_selects_backend() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("backups");
    fs::create_dir_all(root.join("nightly")).expect("mkdir");
    fs::write(root.join("nightly/sales.database.sql"), "CREATE DATABASE sales").expect("write");
    let config = temp.path().join("storage.json");
    let body = serde_json::json!({ "type": "file", "path": root });
    fs::write(&config, body.to_string()).expect("write config");

    let output = cmd()
        .args(["list", "--storage-config", config.to_str().unwrap()])
        .output()
        .expect("list");
    assert!(output.status.success());
    let value = parse_json_line(&output.stdout);
    assert_eq!(value["backups"], serde_json::json!(["nightly"]));

    fs::write(&config, r#"{"type":"s3"}"#).expect("write config");
    let output = cmd()
        .args(["list", "--storage-config", config.to_str().unwrap()])
        .output()
        .expect("list");
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(error_kind(&output), "Config");
}
