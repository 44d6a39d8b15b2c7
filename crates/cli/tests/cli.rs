use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn version_prints_crate_version() {
    Command::cargo_bin("mod-connect")
        .unwrap()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(concat!("mod-connect ", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn run_without_sources_is_a_fatal_failure() {
    let workdir = tempfile::tempdir().unwrap();
    Command::cargo_bin("mod-connect")
        .unwrap()
        .arg("run")
        .current_dir(workdir.path())
        .assert()
        .code(2);
}

#[test]
fn run_rejects_malformed_csv() {
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("repos.csv"), "not a repo name,main\n").unwrap();
    Command::cargo_bin("mod-connect")
        .unwrap()
        .args(["run", "--from-csv", "repos.csv"])
        .current_dir(workdir.path())
        .assert()
        .code(2);
}
