use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("ytscript")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fetch"))
        .stdout(predicate::str::contains("batch"))
        .stdout(predicate::str::contains("preflight"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_fetch_help_shows_pipeline_flags() {
    Command::cargo_bin("ytscript")
        .unwrap()
        .args(["fetch", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--user"))
        .stdout(predicate::str::contains("--language"))
        .stdout(predicate::str::contains("--no-captions-hint"))
        .stdout(predicate::str::contains("--stats"));
}

#[test]
fn test_batch_requires_videos() {
    Command::cargo_bin("ytscript")
        .unwrap()
        .arg("batch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("VIDEOS"));
}

#[test]
fn test_fetch_rejects_malformed_video() {
    // A local config.yaml keeps the run out of the user's config directory.
    let dir = tempfile::tempdir().unwrap();
    let config = serde_yaml::to_string(&ytscript::Config::default()).unwrap();
    std::fs::write(dir.path().join("config.yaml"), config).unwrap();

    Command::cargo_bin("ytscript")
        .unwrap()
        .current_dir(dir.path())
        .args(["--quiet", "fetch", "definitely%%bad"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a YouTube video id"));
}
