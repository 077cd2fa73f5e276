//! The state store abstraction. Each mutation opens an [`Updater`] or
//! [`Deleter`] session that runs `init -> (commit | cancel) -> cleanup`
//! under a per-Instance lock; reads go through a [`Getter`]. Three engines
//! implement the interface: etcd, git, and an in-memory store.

pub mod etcd;
pub mod git;
pub mod memory;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

use crate::exec::ExecError;
use crate::helpers;
use crate::pb;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("OldInstance was passed, but there's no existing Instance")]
    InstanceNoExist,
    #[error("OldInstance differs from existing Instance")]
    OldInstanceDiffers,
    #[error("no stored Instance found for `{0}`")]
    InstanceNotFound(String),
    #[error(
        "There are tracked uncommitted changes for this Instance! This should not happen and could indicate a bug. Fix this manually:\n\t{0}"
    )]
    TrackedUncommittedChanges(String),
    #[error(
        "There are untracked uncommitted changes for this Instance! This should not happen and could indicate a bug. Fix this manually:\n\t{0}"
    )]
    UntrackedUncommittedChanges(String),
    #[error("found `{}` but it does not contain a `kustomization.yaml` file", .0.display())]
    MissingKustomization(PathBuf),
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),
    #[error("session used before init")]
    NotInitialized,
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cleanup errors: {0}")]
    Cleanup(String),
}

impl From<StateError> for tonic::Status {
    fn from(err: StateError) -> Self {
        let message = err.to_string();
        match err {
            StateError::InstanceNoExist
            | StateError::OldInstanceDiffers
            | StateError::TrackedUncommittedChanges(_)
            | StateError::UntrackedUncommittedChanges(_)
            | StateError::MissingKustomization(_) => tonic::Status::failed_precondition(message),
            StateError::InstanceNotFound(_) => tonic::Status::not_found(message),
            StateError::Etcd(_) | StateError::Timeout(..) => tonic::Status::unavailable(message),
            StateError::Exec(_) => tonic::Status::unknown(message),
            StateError::NotInitialized
            | StateError::Io(_)
            | StateError::Cleanup(_) => tonic::Status::internal(message),
        }
    }
}

/// An engine wires up session objects against one backing store.
#[async_trait]
pub trait StateEngine: Send + Sync {
    /// One-time startup work, e.g. syncing the git working tree.
    async fn init(&self) -> Result<(), StateError>;

    fn new_updater(&self, instance: pb::Instance, instances_dir: &Path) -> Box<dyn Updater>;
    fn new_deleter(&self, instance: pb::Instance, instances_dir: &Path) -> Box<dyn Deleter>;
    fn new_getter(&self, options: pb::GetOptions, instances_dir: &Path) -> Box<dyn Getter>;
    fn new_templates_getter(
        &self,
        options: pb::GetOptions,
        templates_dir: &Path,
    ) -> Box<dyn TemplatesGetter>;
}

/// A single add-or-update session.
///
/// `init` acquires the per-Instance lock, verifies the OldInstance witness,
/// and materializes the scratch tree; `commit` persists; `cancel` rolls back
/// whatever `init` touched and hands the causing error back. Cleanup must
/// always run, in LIFO registration order.
#[async_trait]
pub trait Updater: Send {
    async fn init(&mut self) -> Result<(), StateError>;
    async fn commit(&mut self, skip_commit: bool) -> Result<(), StateError>;
    async fn cancel(&mut self, err: StateError) -> StateError;
    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError>;

    /// The Instance this session operates on.
    fn instance(&self) -> &pb::Instance;
}

/// A single delete session. `init` additionally loads the stored
/// representation into the in-memory Instance so the external pipeline has a
/// tree to run `kubectl delete` against.
#[async_trait]
pub trait Deleter: Send {
    async fn init(&mut self) -> Result<(), StateError>;
    async fn commit(&mut self) -> Result<(), StateError>;
    async fn cancel(&mut self, err: StateError) -> StateError;
    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError>;

    fn instance(&self) -> &pb::Instance;
}

#[async_trait]
pub trait Getter: Send {
    async fn run(&mut self) -> Result<pb::InstanceList, StateError>;
    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError>;
}

#[async_trait]
pub trait TemplatesGetter: Send {
    async fn run(&mut self) -> Result<pb::InstanceList, StateError>;
    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError>;
}

/// Compares the stored kustomization against the client's OldInstance
/// witness, ignoring trailing whitespace.
pub(crate) fn old_instance_matches(stored: &str, old: &pb::Instance) -> Result<(), StateError> {
    if stored.trim_end() != old.kustomization_yaml.trim_end() {
        return Err(StateError::OldInstanceDiffers);
    }
    Ok(())
}

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), StateError>> + Send>;

/// A stack of deferred cleanup actions, run in reverse registration order.
/// Errors are accumulated into one composite rather than aborting the stack,
/// so the lock release and client close always get their turn.
#[derive(Default)]
pub struct CleanupStack {
    funcs: Vec<(&'static str, CleanupFn)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, label: &'static str, func: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), StateError>> + Send + 'static,
    {
        self.funcs.push((label, Box::new(move || func().boxed())));
    }

    pub async fn run(&mut self) -> Result<(), StateError> {
        let mut errors = Vec::new();
        for (label, func) in self.funcs.drain(..).rev() {
            debug!(cleanup = label, "running cleanup");
            if let Err(err) = func().await {
                warn!(cleanup = label, error = %err, "cleanup failed");
                errors.push(format!("{label}: {err}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StateError::Cleanup(errors.join("; ")))
        }
    }
}

/// Serves Instance templates from a directory of overlay sub-directories.
///
/// Templates are read-only seed data on local disk, so every engine shares
/// this filesystem walk. When listing, sub-directories without a top
/// kustomization file are skipped with a warning; when a single template is
/// requested by name, a missing kustomization file is an error.
pub struct FsTemplatesGetter {
    options: pb::GetOptions,
    templates_dir: PathBuf,
}

impl FsTemplatesGetter {
    pub fn new(options: pb::GetOptions, templates_dir: &Path) -> Self {
        Self {
            options,
            templates_dir: templates_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl TemplatesGetter for FsTemplatesGetter {
    async fn run(&mut self) -> Result<pb::InstanceList, StateError> {
        if !self.options.name.is_empty() {
            let dir = self.templates_dir.join(&self.options.name);
            if !dir.is_dir() {
                return Ok(pb::InstanceList::default());
            }
            let Some((kustomization_yaml, files)) = helpers::read_overlay_dir(&dir)? else {
                return Err(StateError::MissingKustomization(dir));
            };
            return Ok(pb::InstanceList {
                instances: vec![pb::Instance {
                    name: self.options.name.clone(),
                    kustomization_yaml,
                    files,
                    ..Default::default()
                }],
            });
        }

        let mut instances = Vec::new();
        let mut entries: Vec<_> = match std::fs::read_dir(&self.templates_dir) {
            Ok(entries) => entries.collect::<Result<_, _>>()?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        entries.sort_by_key(|entry| entry.file_name());

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
                        template = %name,
                        dir = %entry.path().display(),
                        "template directory has no kustomization.yaml, skipping"
                    );
                }
            }
        }

        Ok(pb::InstanceList { instances })
    }

    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_cleanup_runs_in_lifo_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for index in 0..3 {
            let order = order.clone();
            stack.push("record", move || async move {
                order.lock().unwrap().push(index);
                Ok(())
            });
        }

        stack.run().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_cleanup_accumulates_errors() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = CleanupStack::new();
        let counter = ran.clone();
        stack.push("first", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        stack.push("boom", || async { Err(StateError::InstanceNoExist) });

        let err = stack.run().await.unwrap_err();
        assert!(matches!(err, StateError::Cleanup(_)));
        assert!(err.to_string().contains("boom"));
        // the failing entry did not stop the rest of the stack
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_empty_stack_is_idempotent() {
        let mut stack = CleanupStack::new();
        stack.run().await.unwrap();
        stack.run().await.unwrap();
    }

    #[test]
    fn test_old_instance_matches_trims_trailing_whitespace() {
        let old = pb::Instance {
            kustomization_yaml: "namePrefix: x-\n".into(),
            ..Default::default()
        };
        assert!(old_instance_matches("namePrefix: x-", &old).is_ok());
        assert!(matches!(
            old_instance_matches("namePrefix: y-\n", &old),
            Err(StateError::OldInstanceDiffers)
        ));
    }

    fn write_template_dirs(dir: &Path) {
        let good = dir.join("my-template");
        std::fs::create_dir_all(good.join("base")).unwrap();
        std::fs::write(good.join("kustomization.yaml"), "namePrefix: x-\n").unwrap();
        std::fs::write(good.join("base/deployment.yaml"), "kind: Deployment\n").unwrap();
        std::fs::create_dir_all(dir.join("stray")).unwrap();
    }

    #[tokio::test]
    async fn test_templates_getter_skips_bare_dirs() {
        let dir = tempdir().unwrap();
        write_template_dirs(dir.path());

        let mut getter = FsTemplatesGetter::new(pb::GetOptions::default(), dir.path());
        let list = getter.run().await.unwrap();
        assert_eq!(list.instances.len(), 1);
        assert_eq!(list.instances[0].name, "my-template");
        assert_eq!(list.instances[0].files.len(), 1);
        assert_eq!(list.instances[0].files[0].relative_path, "base/deployment.yaml");
    }

    #[tokio::test]
    async fn test_templates_getter_by_name() {
        let dir = tempdir().unwrap();
        write_template_dirs(dir.path());

        let mut getter = FsTemplatesGetter::new(
            pb::GetOptions {
                name: "my-template".into(),
                ..Default::default()
            },
            dir.path(),
        );
        let list = getter.run().await.unwrap();
        assert_eq!(list.instances.len(), 1);
        assert_eq!(list.instances[0].name, "my-template");

        // an unknown name is an empty list, but a named template missing its
        // kustomization file is an error rather than a skip
        let mut getter = FsTemplatesGetter::new(
            pb::GetOptions {
                name: "no-such-template".into(),
                ..Default::default()
            },
            dir.path(),
        );
        assert!(getter.run().await.unwrap().instances.is_empty());

        let mut getter = FsTemplatesGetter::new(
            pb::GetOptions {
                name: "stray".into(),
                ..Default::default()
            },
            dir.path(),
        );
        let err = getter.run().await.unwrap_err();
        assert!(matches!(err, StateError::MissingKustomization(_)));
    }
}
