use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn pxevm() -> Command {
    let mut cmd = Command::cargo_bin("pxevm").unwrap();
    cmd.env_remove("PXEVM_CONFIG")
        .env_remove("PXEVM_STORAGE_ROOT")
        .env_remove("PXEVM_LOG");
    cmd
}

#[test]
fn test_help_command() {
    pxevm()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Provision and reclaim disposable PXE-boot test VMs",
        ));
}

#[test]
fn test_completions_command() {
    pxevm()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_pxevm"));
}

#[test]
fn test_man_page_command() {
    pxevm()
        .arg("man-page")
        .assert()
        .success()
        .stdout(predicate::str::contains(".TH"));
}

#[test]
fn test_create_on_memory_backend() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("VMs");

    let output = pxevm()
        .args(["--backend", "memory", "--storage-root"])
        .arg(&root)
        .args(["create", "--seed", "7", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let name = record["name"].as_str().unwrap();
    assert!(name.starts_with("PXE-CLIENT-UEFI-"));
    assert_eq!(record["generation"], 2);
    assert_eq!(record["steps"].as_array().unwrap().len(), 9);
    assert!(root.join(format!("{name}.vhdx")).is_file());
}

#[test]
fn test_create_same_seed_same_name() {
    let temp = TempDir::new().unwrap();
    let run = |dir: &str| {
        let output = pxevm()
            .args(["--backend", "memory", "--storage-root"])
            .arg(temp.path().join(dir))
            .args(["create", "--seed", "42", "--json"])
            .output()
            .unwrap();
        let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        record["name"].as_str().unwrap().to_string()
    };
    assert_eq!(run("a"), run("b"));
}

#[test]
fn test_create_legacy_human_output() {
    let temp = TempDir::new().unwrap();
    pxevm()
        .args(["--backend", "memory", "--storage-root"])
        .arg(temp.path())
        .args(["create", "--uefi", "false", "--name", "PXE-CLIENT-LAB"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Provisioned VM 'PXE-CLIENT-LAB' (generation 1)"))
        .stdout(predicate::str::contains("firmware"));
    assert!(temp.path().join("PXE-CLIENT-LAB.vhdx").is_file());
}

#[test]
fn test_create_writes_record() {
    let temp = TempDir::new().unwrap();
    let record_path = temp.path().join("record.json");
    pxevm()
        .args(["--backend", "memory", "--storage-root"])
        .arg(temp.path().join("VMs"))
        .args(["create", "--seed", "1", "--record"])
        .arg(&record_path)
        .assert()
        .success();

    let record: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&record_path).unwrap()).unwrap();
    assert!(record["name"].as_str().unwrap().starts_with("PXE-CLIENT-UEFI-"));
    assert!(record["created_at"].is_string());
}

#[test]
fn test_create_with_config_file() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("pxevm.json");
    fs::write(&config, r#"{ "base_prefix": "LAB", "disk_extension": "vhd" }"#).unwrap();

    let output = pxevm()
        .args(["--backend", "memory", "--config"])
        .arg(&config)
        .arg("--storage-root")
        .arg(temp.path().join("VMs"))
        .args(["create", "--seed", "3", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let name = record["name"].as_str().unwrap();
    assert!(name.starts_with("LAB-UEFI-"));
    assert!(record["disk_path"].as_str().unwrap().ends_with(".vhd"));
}

#[test]
fn test_create_rejects_zero_cpus() {
    let temp = TempDir::new().unwrap();
    pxevm()
        .args(["--backend", "memory", "--storage-root"])
        .arg(temp.path())
        .args(["create", "--cpu-count", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cpu count must be at least 1"));
}

#[test]
fn test_missing_config_file() {
    let temp = TempDir::new().unwrap();
    pxevm()
        .args(["--backend", "memory", "--config"])
        .arg(temp.path().join("missing.json"))
        .args(["list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open config"));
}

#[test]
fn test_reclaim_removes_empty_storage_root() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("VMs");
    fs::create_dir_all(&root).unwrap();

    pxevm()
        .args(["--backend", "memory", "--storage-root"])
        .arg(&root)
        .arg("reclaim")
        .assert()
        .success()
        .stdout(predicate::str::contains("No VMs match 'PXE-CLIENT-'"))
        .stdout(predicate::str::contains("Removed empty storage root"));
    assert!(!root.exists());
}

#[test]
fn test_reclaim_keeps_occupied_storage_root() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("VMs");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("keep.txt"), "x").unwrap();

    let output = pxevm()
        .args(["--backend", "memory", "--storage-root"])
        .arg(&root)
        .args(["reclaim", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["storage_root_removed"], false);
    assert!(root.join("keep.txt").exists());
}

#[test]
fn test_list_empty_inventory() {
    pxevm()
        .args(["--backend", "memory", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_install_fish_completions() {
    let temp_config = TempDir::new().unwrap();
    let output = pxevm()
        .env("HOME", temp_config.path())
        .env("XDG_CONFIG_HOME", temp_config.path())
        .arg("install-fish")
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Fish completions installed to:"));
    assert!(temp_config
        .path()
        .join("fish")
        .join("completions")
        .join("pxevm.fish")
        .exists());
}

#[test]
fn test_reclaim_rejects_empty_pattern() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("VMs");
    fs::create_dir_all(&root).unwrap();

    pxevm()
        .args(["--backend", "memory", "--storage-root"])
        .arg(&root)
        .args(["reclaim", "--pattern", ""])
        .assert()
        .failure()
        .stderr(predicate::str::contains("would match every VM"));
    assert!(root.exists());
}
