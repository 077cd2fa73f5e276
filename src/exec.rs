//! Subprocess plumbing for the external reconciliation pipeline:
//! `kustomize build <dir> | kubectl <verb> -f -`, plus a combined-output
//! helper used by the git state store.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("No output from `kustomize build {dir}`")]
    NoKustomizeOutput { dir: String },
    #[error("ERROR running `{command}`: {status}\n\t{output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// The raw subprocess output, for surfacing in status error fields.
    pub fn output(&self) -> String {
        match self {
            ExecError::NoKustomizeOutput { .. } => self.to_string(),
            ExecError::Failed { output, .. } => output.clone(),
            ExecError::Io(_) => String::new(),
        }
    }
}

/// Runs `kustomize build <instance_dir>` and returns its buffered stdout.
///
/// An empty stdout is an error regardless of exit status, so an accidental
/// apply of nothing can never reach the cluster.
async fn kustomize_stdout(instance_dir: &Path) -> Result<Vec<u8>, ExecError> {
    let dir = instance_dir.display().to_string();
    let mut kustomize = Command::new("kustomize")
        .arg("build")
        .arg(instance_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout = Vec::new();
    kustomize
        .stdout
        .take()
        .unwrap()
        .read_to_end(&mut stdout)
        .await?;
    let mut stderr = Vec::new();
    kustomize
        .stderr
        .take()
        .unwrap()
        .read_to_end(&mut stderr)
        .await?;
    let status = kustomize.wait().await?;

    if stdout.is_empty() {
        return Err(ExecError::NoKustomizeOutput { dir });
    }
    if !status.success() {
        return Err(ExecError::Failed {
            command: format!("kustomize build {dir}"),
            status: status.to_string(),
            output: String::from_utf8_lossy(&stderr).trim_end().to_string(),
        });
    }

    debug!(dir = %dir, bytes = stdout.len(), "kustomize build succeeded");
    Ok(stdout)
}

/// Verifies the overlay builds without applying anything.
pub async fn kustomize_build(instance_dir: &Path) -> Result<(), ExecError> {
    kustomize_stdout(instance_dir).await.map(|_| ())
}

/// Runs `kustomize build <instance_dir>` piped into `kubectl <args>` and
/// returns kubectl's combined output.
///
/// The buffered kustomize stdout is copied into kubectl's stdin on a spawned
/// task, which is joined before returning. Every step is fatal to the current
/// operation; there are no retries.
pub async fn pipe_kustomize_to_kubectl(
    instance_dir: &Path,
    suppress_output: bool,
    kubectl_args: &[&str],
) -> Result<Vec<u8>, ExecError> {
    let manifests = kustomize_stdout(instance_dir).await?;

    let mut kubectl = Command::new("kubectl")
        .args(kubectl_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdin = kubectl.stdin.take().unwrap();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&manifests).await;
        // stdin closes when the handle drops
    });

    let output = kubectl.wait_with_output().await;
    let _ = writer.await;
    let output = output?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let command = format!(
        "kustomize build {} | kubectl {}",
        instance_dir.display(),
        kubectl_args.join(" ")
    );

    if !output.status.success() {
        return Err(ExecError::Failed {
            command,
            status: output.status.to_string(),
            output: String::from_utf8_lossy(&combined).trim_end().to_string(),
        });
    }

    if suppress_output {
        debug!(command = %command, "pipeline succeeded");
    } else {
        debug!(command = %command, output = %String::from_utf8_lossy(&combined), "pipeline succeeded");
    }
    Ok(combined)
}

/// Runs a command to completion and returns its combined stdout and stderr.
/// A non-zero exit becomes an [`ExecError::Failed`] carrying that output.
pub async fn run_command(cwd: &Path, program: &str, args: &[&str]) -> Result<Vec<u8>, ExecError> {
    let command = format!("{program} {}", args.join(" "));
    debug!(command = %command, cwd = %cwd.display(), "running command");

    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);

    if !output.status.success() {
        return Err(ExecError::Failed {
            command,
            status: output.status.to_string(),
            output: String::from_utf8_lossy(&combined).trim_end().to_string(),
        });
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_run_command_combined_output() {
        let output = run_command(&PathBuf::from("."), "sh", &["-c", "echo out; echo err >&2"])
            .await
            .unwrap();
        let combined = String::from_utf8_lossy(&output);
        assert!(combined.contains("out"));
        assert!(combined.contains("err"));
    }

    #[tokio::test]
    async fn test_run_command_failure_carries_output() {
        let err = run_command(&PathBuf::from("."), "sh", &["-c", "echo doomed; exit 3"])
            .await
            .unwrap_err();
        match err {
            ExecError::Failed {
                command, output, ..
            } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(output, "doomed");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_missing_binary_is_io() {
        let err = run_command(&PathBuf::from("."), "hambone-no-such-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Io(_)));
    }
}
