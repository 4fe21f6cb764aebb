use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// `cordon` pointed at a throwaway state dir and a runtime that does not exist
fn cordon(state: &TempDir) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cordon"));
    cmd.env_remove("RUST_LOG")
        .env("CORDON_STATE_DIR", state.path())
        .env("CORDON_RUNTIME", "/nonexistent/cordon-test-runtime");
    cmd
}

#[test]
fn test_help_command() {
    Command::new(env!("CARGO_BIN_EXE_cordon"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("controlled network egress"))
        .stdout(predicate::str::contains("Commands:"))
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("rm"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("network"));
}

#[test]
fn test_network_help_lists_subcommands() {
    Command::new(env!("CARGO_BIN_EXE_cordon"))
        .args(["network", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("allow"))
        .stdout(predicate::str::contains("block"))
        .stdout(predicate::str::contains("reset"))
        .stdout(predicate::str::contains("logs"));
}

#[test]
fn test_version_command() {
    Command::new(env!("CARGO_BIN_EXE_cordon"))
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cordon"));
}

#[test]
fn test_invalid_command() {
    Command::new(env!("CARGO_BIN_EXE_cordon"))
        .arg("invalid")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_create_without_name() {
    Command::new(env!("CARGO_BIN_EXE_cordon"))
        .arg("create")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_allow_requires_a_target() {
    Command::new(env!("CARGO_BIN_EXE_cordon"))
        .args(["network", "allow", "web"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_allow_rejects_two_targets() {
    Command::new(env!("CARGO_BIN_EXE_cordon"))
        .args(["network", "allow", "web", "--domain", "a.com", "--port", "443"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_block_has_no_port_option() {
    Command::new(env!("CARGO_BIN_EXE_cordon"))
        .args(["network", "block", "web", "--port", "22"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected argument"));
}

#[test]
fn test_create_with_unknown_profile_lists_valid_ones() {
    let state = TempDir::new().unwrap();
    cordon(&state)
        .args(["create", "web", "--egress", "bogus"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown egress profile 'bogus'"))
        .stderr(predicate::str::contains("permissive, standard, strict, airgapped"));

    // Nothing was provisioned.
    assert!(!state.path().join("rules").exists());
}

#[test]
fn test_create_with_invalid_rule_fails_early() {
    let state = TempDir::new().unwrap();
    cordon(&state)
        .args(["create", "web", "--allow-port", "70000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid allow-port rule '70000'"));

    assert!(!state.path().join("rules").exists());
}

#[test]
fn test_create_without_runtime_fails() {
    let state = TempDir::new().unwrap();
    cordon(&state)
        .args(["create", "web"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to query container runtime"));

    assert!(!state.path().join("rules").exists());
}

#[test]
fn test_invalid_container_name() {
    let state = TempDir::new().unwrap();
    cordon(&state)
        .args(["network", "show", "bad name"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid container name"));
}

#[test]
fn test_allow_persists_rule_without_runtime() {
    let state = TempDir::new().unwrap();
    let rules = state.path().join("rules").join("web");
    std::fs::create_dir_all(&rules).unwrap();
    std::fs::write(rules.join("profile"), "strict\n").unwrap();

    cordon(&state)
        .args(["network", "allow", "web", "--domain", "HTTPBin.org."])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added 'ALLOW_DOMAIN httpbin.org'"))
        .stdout(predicate::str::contains("Takes effect when 'web' starts"));

    let stored = std::fs::read_to_string(rules.join("allow-domains.txt")).unwrap();
    assert_eq!(stored, "httpbin.org\n");

    // Second add is a no-op.
    cordon(&state)
        .args(["network", "allow", "web", "--domain", "httpbin.org"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already present"));

    let stored = std::fs::read_to_string(rules.join("allow-domains.txt")).unwrap();
    assert_eq!(stored.lines().count(), 1);
}

#[test]
fn test_block_ip_persists_rule() {
    let state = TempDir::new().unwrap();

    cordon(&state)
        .args(["network", "block", "web", "--ip", "10.1.2.3/8"])
        .assert()
        .success();

    let stored =
        std::fs::read_to_string(state.path().join("rules/web/block-ips.txt")).unwrap();
    assert_eq!(stored, "10.0.0.0/8\n");
}

#[test]
fn test_show_json_without_runtime() {
    let state = TempDir::new().unwrap();
    let rules = state.path().join("rules").join("web");
    std::fs::create_dir_all(&rules).unwrap();
    std::fs::write(rules.join("profile"), "strict\n").unwrap();
    std::fs::write(rules.join("allow-domains.txt"), "httpbin.org\n").unwrap();

    let output = cordon(&state)
        .args(["network", "show", "web", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["policy"]["profile"], "strict");
    assert_eq!(json["policy"]["default_action"], "drop");
    assert_eq!(json["custom_rules"][0], "ALLOW_DOMAIN httpbin.org");
    assert!(json["sidecar"].is_null());
}

#[test]
fn test_reset_to_other_profile_requires_force() {
    let state = TempDir::new().unwrap();
    let rules = state.path().join("rules").join("web");
    std::fs::create_dir_all(&rules).unwrap();
    std::fs::write(rules.join("profile"), "standard\n").unwrap();

    cordon(&state)
        .args(["network", "reset", "web", "--profile", "strict"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    cordon(&state)
        .args(["network", "reset", "web", "--profile", "airgapped", "--force"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("recreate the container"));

    let profile = std::fs::read_to_string(rules.join("profile")).unwrap();
    assert_eq!(profile.trim(), "standard");
}
