//! Exec bridge tests against the real `kustomize` binary, plus a CLI smoke
//! test. The kustomize tests run only with `HAMBONE_KUSTOMIZE_TESTS=1`.

use assert_cmd::Command;
use predicates::prelude::*;

use hambone::exec::{self, ExecError};

#[allow(deprecated)]
fn hambone_cmd() -> Command {
    Command::cargo_bin("hambone").unwrap()
}

fn kustomize_tests_enabled() -> bool {
    std::env::var("HAMBONE_KUSTOMIZE_TESTS")
        .map(|value| value == "1")
        .unwrap_or(false)
}

#[tokio::test]
async fn test_kustomize_build_renders_overlay() {
    if !kustomize_tests_enabled() {
        eprintln!("HAMBONE_KUSTOMIZE_TESTS not set, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let overlay = dir.path().join("my-client-1");
    std::fs::create_dir_all(&overlay).unwrap();
    std::fs::write(
        overlay.join("kustomization.yaml"),
        "namePrefix: my-client-1-\nresources:\n- deployment.yaml\n",
    )
    .unwrap();
    std::fs::write(
        overlay.join("deployment.yaml"),
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: my-product\n",
    )
    .unwrap();

    exec::kustomize_build(&overlay).await.unwrap();
}

#[tokio::test]
async fn test_empty_build_output_is_rejected() {
    if !kustomize_tests_enabled() {
        eprintln!("HAMBONE_KUSTOMIZE_TESTS not set, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let overlay = dir.path().join("my-client-1");
    std::fs::create_dir_all(&overlay).unwrap();
    // an overlay with no resources builds to nothing
    std::fs::write(overlay.join("kustomization.yaml"), "namePrefix: my-client-1-\n").unwrap();

    let err = exec::kustomize_build(&overlay).await.unwrap_err();
    match err {
        ExecError::NoKustomizeOutput { .. } => {
            assert!(err.to_string().contains("No output from `kustomize build"));
        }
        other => panic!("expected NoKustomizeOutput, got {other:?}"),
    }
}

#[test]
fn test_cli_help_lists_flags() {
    hambone_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--listen_address"))
        .stdout(predicate::str::contains("--state_store"))
        .stdout(predicate::str::contains("--etcd_endpoints"))
        .stdout(predicate::str::contains("--enable_kubectl"));
}

#[test]
fn test_cli_rejects_unknown_state_store() {
    hambone_cmd()
        .args(["--state_store", "zookeeper"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
