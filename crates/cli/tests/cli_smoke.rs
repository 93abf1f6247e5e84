//! Smoke tests for the loadstone binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn loadstone() -> Command {
  Command::cargo_bin("loadstone").unwrap()
}

#[test]
fn load_prints_targets() {
  let dir = TempDir::new().unwrap();
  fs::create_dir_all(dir.path().join("app")).unwrap();
  fs::write(
    dir.path().join("app/PKG.lua"),
    "target { name = 'app', kind = 'cc_binary' }\n",
  )
  .unwrap();

  loadstone()
    .args(["load", "//app", "--workspace"])
    .arg(dir.path())
    .assert()
    .success()
    .stdout(predicate::str::contains("//app"))
    .stdout(predicate::str::contains("cc_binary"));
}

#[test]
fn load_of_missing_package_fails_with_reason() {
  let dir = TempDir::new().unwrap();
  fs::create_dir_all(dir.path().join("empty")).unwrap();

  loadstone()
    .args(["load", "//empty", "--workspace"])
    .arg(dir.path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("no PKG.lua file found"));
}

#[test]
fn load_of_broken_package_fails_but_reports_targets() {
  let dir = TempDir::new().unwrap();
  fs::create_dir_all(dir.path().join("bad")).unwrap();
  fs::write(
    dir.path().join("bad/PKG.lua"),
    "target { name = 'kept', kind = 'lib' }\nwhile true do end\n",
  )
  .unwrap();

  loadstone()
    .args(["load", "//bad", "--workspace"])
    .arg(dir.path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("contains errors"));
}

#[test]
fn scan_lists_extracted_literals() {
  let dir = TempDir::new().unwrap();
  fs::write(
    dir.path().join("PKG.lua"),
    "target { name = 'x', kind = 'lib', srcs = glob { '*.c' } }\n",
  )
  .unwrap();

  loadstone()
    .arg("scan")
    .arg(dir.path().join("PKG.lua"))
    .assert()
    .success()
    .stdout(predicate::str::contains("*.c"))
    .stdout(predicate::str::contains("target"));
}
