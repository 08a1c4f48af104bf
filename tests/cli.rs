use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn write_registry(dir: &Path, extra: &str) -> std::path::PathBuf {
    let registry = format!(
        r#"plugins:
  - name: aws-public
    source: tests
    executable: {stub}
    tier: fallback
    capabilities: ["aws:*"]
    protocol_version: 1
    env:
      STUB_NAME: aws-public
      STUB_PRICE: "4.25"
{extra}"#,
        stub = env!("CARGO_BIN_EXE_costhost-stub-plugin"),
    );
    let path = dir.join("plugins.yaml");
    fs::write(&path, registry).unwrap();
    path
}

fn write_resources(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("resources.yaml");
    fs::write(
        &path,
        r#"resources:
  - type: "aws:ec2/instance:Instance"
    id: web-1
    region: us-east-1
    tags:
      instanceType: t3.micro
  - type: "gcp:storage/bucket:Bucket"
    id: assets
"#,
    )
    .unwrap();
    path
}

#[test]
fn help_lists_subcommands() -> Result<(), Box<dyn std::error::Error>> {
    Command::cargo_bin("costhost")?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("price").and(predicate::str::contains("plugins")));
    Ok(())
}

#[test]
fn plugins_lists_registry_entries() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let registry = write_registry(dir.path(), "");

    Command::cargo_bin("costhost")?
        .args(["plugins", "--registry"])
        .arg(&registry)
        .assert()
        .success()
        .stdout(predicate::str::contains("aws-public").and(predicate::str::contains("fallback")));
    Ok(())
}

#[test]
fn price_emits_json_report_with_unpriced_reasons() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let registry = write_registry(dir.path(), "");
    let resources = write_resources(dir.path());

    let output = Command::cargo_bin("costhost")?
        .args(["price", "--format", "json", "--registry"])
        .arg(&registry)
        .arg("--resources")
        .arg(&resources)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: Value = serde_json::from_slice(&output)?;
    let entries = report["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);

    assert_eq!(entries[0]["resource"]["id"], "web-1");
    assert_eq!(entries[0]["result"]["status"], "priced");
    assert_eq!(entries[0]["result"]["amount"], 4.25);
    assert_eq!(entries[0]["served_by"]["plugin"], "aws-public");

    assert_eq!(entries[1]["resource"]["id"], "assets");
    assert_eq!(entries[1]["result"]["status"], "unpriced");
    assert_eq!(entries[1]["result"]["reason"], "no_capable_plugin");

    assert_eq!(report["totals"]["USD"], 4.25);
    Ok(())
}

#[test]
fn duplicate_plugin_names_are_a_config_error() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let duplicate = format!(
        r#"  - name: aws-public
    executable: {stub}
    tier: production
    capabilities: ["aws:*"]
    protocol_version: 1
"#,
        stub = env!("CARGO_BIN_EXE_costhost-stub-plugin"),
    );
    let registry = write_registry(dir.path(), &duplicate);

    Command::cargo_bin("costhost")?
        .args(["plugins", "--registry"])
        .arg(&registry)
        .assert()
        .failure()
        .stderr(predicate::str::contains("registered more than once"));
    Ok(())
}

#[test]
fn invalid_host_config_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let registry = write_registry(dir.path(), "");
    let config = dir.path().join("host.yaml");
    fs::write(&config, "restart_cap: 2\nbogus_field: 1\n")?;

    Command::cargo_bin("costhost")?
        .args(["plugins", "--config"])
        .arg(&config)
        .arg("--registry")
        .arg(&registry)
        .assert()
        .failure()
        .stderr(predicate::str::contains("bogus_field"));
    Ok(())
}
