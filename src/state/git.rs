//! Git-backed state store. The repository working tree is the system of
//! record: an apply writes the overlay directory and commits it, a delete
//! `git rm`s it, and both push upstream. An optional repo-wide etcd lock
//! serializes writers across replicas.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    CleanupStack, Deleter, FsTemplatesGetter, Getter, StateEngine, StateError, TemplatesGetter,
    Updater, etcd, old_instance_matches,
};
use crate::exec::{self, ExecError};
use crate::helpers;
use crate::pb;

/// Repo-wide write lock taken through the etcd lock service.
#[derive(Clone)]
pub struct GitLockConfig {
    pub endpoints: Vec<String>,
    pub key: String,
}

/// Git implementation of the state store interface.
pub struct GitEngine {
    repo_dir: PathBuf,
    branch: String,
    lock: Option<GitLockConfig>,
}

impl GitEngine {
    pub fn new(repo_dir: PathBuf, branch: String, lock: Option<GitLockConfig>) -> Self {
        Self {
            repo_dir,
            branch,
            lock,
        }
    }
}

#[async_trait]
impl StateEngine for GitEngine {
    async fn init(&self) -> Result<(), StateError> {
        // the branch from a previous run may have been deleted upstream, so
        // sync master first and only then move to the configured branch
        exec::run_command(&self.repo_dir, "git", &["checkout", "master"]).await?;
        exec::run_command(&self.repo_dir, "git", &["pull"]).await?;
        if self.branch != "master" {
            exec::run_command(&self.repo_dir, "git", &["checkout", &self.branch]).await?;
        }
        debug!(repo = %self.repo_dir.display(), branch = %self.branch, "git state store ready");
        Ok(())
    }

    fn new_updater(&self, instance: pb::Instance, instances_dir: &Path) -> Box<dyn Updater> {
        let (instance_dir, instance_file) = helpers::instance_dir_file(instances_dir, &instance.name);
        Box::new(GitUpdater {
            instance,
            repo_dir: self.repo_dir.clone(),
            instances_dir: instances_dir.to_path_buf(),
            instance_dir,
            instance_file,
            lock: self.lock.clone(),
            cleanup: CleanupStack::new(),
        })
    }

    fn new_deleter(&self, instance: pb::Instance, instances_dir: &Path) -> Box<dyn Deleter> {
        let (instance_dir, instance_file) = helpers::instance_dir_file(instances_dir, &instance.name);
        Box::new(GitDeleter {
            instance,
            repo_dir: self.repo_dir.clone(),
            instance_dir,
            instance_file,
            lock: self.lock.clone(),
            cleanup: CleanupStack::new(),
        })
    }

    fn new_getter(&self, options: pb::GetOptions, instances_dir: &Path) -> Box<dyn Getter> {
        Box::new(GitGetter {
            options,
            repo_dir: self.repo_dir.clone(),
            instances_dir: instances_dir.to_path_buf(),
        })
    }

    fn new_templates_getter(
        &self,
        options: pb::GetOptions,
        templates_dir: &Path,
    ) -> Box<dyn TemplatesGetter> {
        Box::new(FsTemplatesGetter::new(options, templates_dir))
    }
}

/// Acquires the repo-wide etcd lock when one is configured.
async fn acquire_repo_lock(
    lock: &Option<GitLockConfig>,
    cleanup: &mut CleanupStack,
) -> Result<(), StateError> {
    let Some(config) = lock else {
        return Ok(());
    };
    let client = etcd::connect(&config.endpoints).await?;
    let held = etcd::acquire_lock(&client, &config.key).await?;
    cleanup.push("release repo lock", move || held.release());
    Ok(())
}

/// Fails when the path has tracked or untracked uncommitted changes; such
/// changes indicate out-of-band corruption that must be resolved manually.
async fn ensure_clean(repo_dir: &Path, path: &Path) -> Result<(), StateError> {
    let path = path.display().to_string();
    match exec::run_command(repo_dir, "git", &["diff", "--exit-code", "--", &path]).await {
        Ok(_) => {}
        Err(ExecError::Failed { output, .. }) => {
            return Err(StateError::TrackedUncommittedChanges(helpers::indent(&output)));
        }
        Err(err) => return Err(err.into()),
    }

    let output = exec::run_command(
        repo_dir,
        "git",
        &["ls-files", "--exclude-standard", "--others", "--", &path],
    )
    .await?;
    let untracked = String::from_utf8_lossy(&output);
    if !untracked.trim().is_empty() {
        return Err(StateError::UntrackedUncommittedChanges(helpers::indent(
            untracked.trim(),
        )));
    }
    Ok(())
}

/// True when `git diff --exit-code HEAD -- <path>` reports changes or the
/// path holds untracked files, i.e. there is something to commit.
async fn has_changes(repo_dir: &Path, path: &Path) -> Result<bool, StateError> {
    let path = path.display().to_string();
    match exec::run_command(repo_dir, "git", &["diff", "--exit-code", "HEAD", "--", &path]).await {
        Ok(_) => {}
        Err(ExecError::Failed { .. }) => return Ok(true),
        Err(err) => return Err(err.into()),
    }
    let output = exec::run_command(
        repo_dir,
        "git",
        &["ls-files", "--exclude-standard", "--others", "--", &path],
    )
    .await?;
    Ok(!String::from_utf8_lossy(&output).trim().is_empty())
}

/// Runs a git subcommand; on failure, resets the instance tree before
/// handing back the original error.
async fn rollback_command(
    repo_dir: &Path,
    instance_dir: &Path,
    instance_file: &Path,
    args: &[&str],
) -> Result<(), StateError> {
    match exec::run_command(repo_dir, "git", args).await {
        Ok(_) => Ok(()),
        Err(err) => Err(rollback_and_error(repo_dir, instance_dir, instance_file, err.into()).await),
    }
}

async fn rollback_and_error(
    repo_dir: &Path,
    instance_dir: &Path,
    instance_file: &Path,
    err: StateError,
) -> StateError {
    if let Err(rollback_err) = rollback(repo_dir, instance_dir, instance_file).await {
        return StateError::Cleanup(format!(
            "rollback failed: {rollback_err}; original error: {err}"
        ));
    }
    err
}

/// Resets the instance tree to HEAD: tracked files are checked out again,
/// untracked files and directories are removed.
async fn rollback(repo_dir: &Path, instance_dir: &Path, instance_file: &Path) -> Result<(), StateError> {
    let file = instance_file.display().to_string();
    let dir = instance_dir.display().to_string();

    let file_tracked = exec::run_command(repo_dir, "git", &["ls-files", "--error-unmatch", &file])
        .await
        .is_ok();
    if file_tracked {
        exec::run_command(repo_dir, "git", &["reset", "HEAD", "--", &file]).await?;
        exec::run_command(repo_dir, "git", &["checkout", "--", &file]).await?;
        return Ok(());
    }

    let dir_tracked = exec::run_command(repo_dir, "git", &["ls-files", "--error-unmatch", &dir])
        .await
        .is_ok();
    if dir_tracked {
        if let Err(err) = tokio::fs::remove_file(instance_file).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            return Err(err.into());
        }
    } else if let Err(err) = tokio::fs::remove_dir_all(instance_dir).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        return Err(err.into());
    }
    Ok(())
}

struct GitUpdater {
    instance: pb::Instance,
    repo_dir: PathBuf,
    instances_dir: PathBuf,
    instance_dir: PathBuf,
    instance_file: PathBuf,
    lock: Option<GitLockConfig>,
    cleanup: CleanupStack,
}

#[async_trait]
impl Updater for GitUpdater {
    async fn init(&mut self) -> Result<(), StateError> {
        acquire_repo_lock(&self.lock, &mut self.cleanup).await?;

        exec::run_command(&self.repo_dir, "git", &["pull"]).await?;
        ensure_clean(&self.repo_dir, &self.instance_dir).await?;

        if let Some(old_instance) = self.instance.old_instance.as_deref() {
            if !self.instance_file.is_file() {
                return Err(StateError::InstanceNoExist);
            }
            let stored = tokio::fs::read_to_string(&self.instance_file).await?;
            old_instance_matches(&stored, old_instance)?;
        }

        helpers::write_instance_tree(&self.instances_dir, &self.instance).await?;
        Ok(())
    }

    async fn commit(&mut self, skip_commit: bool) -> Result<(), StateError> {
        if !has_changes(&self.repo_dir, &self.instance_dir).await? {
            debug!(instance = %self.instance.name, "nothing to commit");
            return Ok(());
        }

        let dir = self.instance_dir.display().to_string();
        rollback_command(
            &self.repo_dir,
            &self.instance_dir,
            &self.instance_file,
            &["add", "--", &dir],
        )
        .await?;
        if skip_commit {
            return Ok(());
        }

        let message = format!("Automate hambone apply for {}", self.instance.name);
        rollback_command(
            &self.repo_dir,
            &self.instance_dir,
            &self.instance_file,
            &["commit", "-m", &message],
        )
        .await?;
        rollback_command(&self.repo_dir, &self.instance_dir, &self.instance_file, &["push"]).await
    }

    async fn cancel(&mut self, err: StateError) -> StateError {
        // the tree written during init is uncommitted; leaving it behind
        // would trip the clean-tree assertion on the next session
        rollback_and_error(&self.repo_dir, &self.instance_dir, &self.instance_file, err).await
    }

    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError> {
        self.cleanup.run().await
    }

    fn instance(&self) -> &pb::Instance {
        &self.instance
    }
}

struct GitDeleter {
    instance: pb::Instance,
    repo_dir: PathBuf,
    instance_dir: PathBuf,
    instance_file: PathBuf,
    lock: Option<GitLockConfig>,
    cleanup: CleanupStack,
}

#[async_trait]
impl Deleter for GitDeleter {
    async fn init(&mut self) -> Result<(), StateError> {
        acquire_repo_lock(&self.lock, &mut self.cleanup).await?;

        exec::run_command(&self.repo_dir, "git", &["pull"]).await?;

        if !self.instance_file.is_file() {
            return Err(StateError::InstanceNotFound(self.instance.name.clone()));
        }
        ensure_clean(&self.repo_dir, &self.instance_dir).await?;

        if let Some(old_instance) = self.instance.old_instance.as_deref() {
            let stored = tokio::fs::read_to_string(&self.instance_file).await?;
            old_instance_matches(&stored, old_instance)?;
        }

        // load the stored representation so the caller sees what was deleted
        if let Some((kustomization_yaml, files)) = helpers::read_overlay_dir(&self.instance_dir)? {
            self.instance.kustomization_yaml = kustomization_yaml;
            self.instance.files = files;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StateError> {
        // TODO: the cluster delete has already happened by the time these
        // subcommands run; retry the commit+push here instead of surfacing
        // "retry manually" once a product decision lands on reconciliation
        let dir = self.instance_dir.display().to_string();
        exec::run_command(&self.repo_dir, "git", &["rm", "-r", "--", &dir]).await?;

        let message = format!("Automate hambone delete for {}", self.instance.name);
        exec::run_command(&self.repo_dir, "git", &["commit", "-m", &message])
            .await
            .map_err(|err| retry_manually("git commit", err))?;
        exec::run_command(&self.repo_dir, "git", &["push"])
            .await
            .map_err(|err| retry_manually("git push", err))?;
        Ok(())
    }

    async fn cancel(&mut self, err: StateError) -> StateError {
        err
    }

    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError> {
        self.cleanup.run().await
    }

    fn instance(&self) -> &pb::Instance {
        &self.instance
    }
}

fn retry_manually(command: &str, err: ExecError) -> StateError {
    StateError::Exec(ExecError::Failed {
        command: command.to_string(),
        status: "failed after the cluster delete, retry manually".to_string(),
        output: err.output(),
    })
}

struct GitGetter {
    options: pb::GetOptions,
    repo_dir: PathBuf,
    instances_dir: PathBuf,
}

#[async_trait]
impl Getter for GitGetter {
    async fn run(&mut self) -> Result<pb::InstanceList, StateError> {
        exec::run_command(&self.repo_dir, "git", &["pull"]).await?;

        let mut entries: Vec<_> = match std::fs::read_dir(&self.instances_dir) {
            Ok(entries) => entries.collect::<Result<_, _>>()?,
            // nothing applied yet
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        entries.sort_by_key(|entry| entry.file_name());

        if !self.options.name.is_empty() {
            for entry in entries {
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name != self.options.name {
                    continue;
                }
                let Some((kustomization_yaml, files)) = helpers::read_overlay_dir(&entry.path())?
                else {
                    return Err(StateError::MissingKustomization(entry.path()));
                };
                return Ok(pb::InstanceList {
                    instances: vec![pb::Instance {
                        name,
                        kustomization_yaml,
                        files,
                        ..Default::default()
                    }],
                });
            }
            return Ok(pb::InstanceList::default());
        }

        let mut instances = Vec::new();
        for entry in entries {
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match helpers::read_overlay_dir(&entry.path())? {
                Some((kustomization_yaml, files)) => instances.push(pb::Instance {
                    name,
                    kustomization_yaml,
                    files,
                    ..Default::default()
                }),
                None => {
                    warn!(
                        dir = %entry.path().display(),
                        "directory has no kustomization.yaml, skipping"
                    );
                }
            }
        }

        let instances = helpers::paginate(instances, self.options.start, self.options.stop);
        Ok(pb::InstanceList { instances })
    }

    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError> {
        Ok(())
    }
}
