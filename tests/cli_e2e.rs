//! End-to-end CLI tests for the fdroid-repo binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

mod support;
use support::{REPO_PATH, mount_v2_repo, repo_address, signing_key, start_mock_server_or_skip};

/// A command isolated from the user's config and data directories.
fn fdroid_repo(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("fdroid-repo").unwrap();
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join("config"))
        .env("XDG_DATA_HOME", home.join("data"))
        .env_remove("RUST_LOG")
        .env_remove("HTTP_PROXY")
        .env_remove("HTTPS_PROXY")
        .env_remove("ALL_PROXY")
        .env_remove("http_proxy")
        .env_remove("https_proxy")
        .env_remove("all_proxy");
    cmd
}

#[test]
fn test_binary_help_displays_usage() {
    let home = TempDir::new().unwrap();
    fdroid_repo(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("F-Droid package repositories"));
}

#[test]
fn test_binary_version_displays_version() {
    let home = TempDir::new().unwrap();
    fdroid_repo(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("fdroid-repo"));
}

#[test]
fn test_binary_without_subcommand_fails() {
    let home = TempDir::new().unwrap();
    fdroid_repo(home.path()).assert().failure();
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    let home = TempDir::new().unwrap();
    fdroid_repo(home.path())
        .args(["list", "--invalid-flag"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_list_on_empty_database() {
    let home = TempDir::new().unwrap();
    let db = home.path().join("repos.db");
    fdroid_repo(home.path())
        .arg("--db")
        .arg(&db)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No repositories."));
    assert!(db.exists());
}

#[test]
fn test_list_uses_default_data_dir() {
    let home = TempDir::new().unwrap();
    fdroid_repo(home.path()).arg("list").assert().success();
    assert!(home.path().join("data/fdroid-repo/repos.db").exists());
}

#[test]
fn test_invalid_config_file_fails() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("config.toml");
    std::fs::write(&config, "read_timeout_secs = 0\n").unwrap();
    fdroid_repo(home.path())
        .arg("--config")
        .arg(&config)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("read_timeout_secs"));
}

#[test]
fn test_add_invalid_address_fails() {
    let home = TempDir::new().unwrap();
    fdroid_repo(home.path())
        .args(["-q", "add", "mailto:someone@example.org"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid_index"));
}

#[test]
fn test_add_archive_unknown_id_fails() {
    let home = TempDir::new().unwrap();
    fdroid_repo(home.path())
        .args(["add-archive", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no repository with id 42"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_previews_then_stores_repository() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let address = repo_address(&server);
    mount_v2_repo(
        &server,
        REPO_PATH,
        signing_key(),
        &address,
        &[("org.example.one", "One"), ("org.example.two", "Two")],
    )
    .await;
    let home = TempDir::new().unwrap();
    let db = home.path().join("repos.db");
    let home_path = home.path().to_path_buf();

    let preview_address = address.clone();
    let preview_db = db.clone();
    let preview_home = home_path.clone();
    tokio::task::spawn_blocking(move || {
        fdroid_repo(&preview_home)
            .arg("-q")
            .arg("--db")
            .arg(&preview_db)
            .args(["add", &preview_address])
            .assert()
            .success()
            .stdout(predicate::str::contains("Test Repo"))
            .stdout(predicate::str::contains("org.example.two"))
            .stdout(predicate::str::contains("--yes"));
    })
    .await
    .unwrap();

    tokio::task::spawn_blocking(move || {
        fdroid_repo(&home_path)
            .arg("-q")
            .arg("--db")
            .arg(&db)
            .args(["add", "--yes", &address])
            .assert()
            .success()
            .stdout(predicate::str::contains("Added repository"));

        fdroid_repo(&home_path)
            .arg("--db")
            .arg(&db)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains(address.as_str()))
            .stdout(predicate::str::contains("mirror https://mirror.example.net/fdroid/repo"));
    })
    .await
    .unwrap();
}
