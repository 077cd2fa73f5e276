//! The Instance lifecycle controller: composes a state store session with
//! the external `kustomize | kubectl` pipeline, enforcing the RPC-edge
//! invariants and attaching live status on the way out.

pub mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::exec::{self, ExecError};
use crate::helpers;
use crate::pb;
use crate::state::{StateEngine, StateError};

/// DNS-1123 label pattern every Instance name must match.
pub const NAME_PATTERN: &str = "^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";
const NAME_MAX_LEN: usize = 253;

static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(NAME_PATTERN).expect("name pattern compiles"));

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Instance.Name and OldInstance.Name do not match")]
    NameMismatch,
    #[error("invalid Instance name `{0}`: must match {NAME_PATTERN}")]
    InvalidName(String),
    #[error("kustomization for `{name}` must set namePrefix `{expected}`, found `{found}`")]
    NamePrefixMismatch {
        name: String,
        expected: String,
        found: String,
    },
    #[error("kustomization for `{name}` does not parse as YAML: {source}")]
    InvalidKustomization {
        name: String,
        source: serde_yaml::Error,
    },
    #[error("file path `{0}` is reserved or escapes the Instance directory")]
    InvalidFilePath(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("failed to parse status output: {0}")]
    StatusParse(#[from] serde_yaml::Error),
}

impl From<InstanceError> for tonic::Status {
    fn from(err: InstanceError) -> Self {
        let message = err.to_string();
        match err {
            InstanceError::NameMismatch => tonic::Status::failed_precondition(message),
            InstanceError::InvalidName(_)
            | InstanceError::NamePrefixMismatch { .. }
            | InstanceError::InvalidKustomization { .. }
            | InstanceError::InvalidFilePath(_) => tonic::Status::invalid_argument(message),
            InstanceError::State(state) => state.into(),
            InstanceError::Exec(_) | InstanceError::StatusParse(_) => {
                tonic::Status::unknown(message)
            }
        }
    }
}

/// Orchestrates Apply, Delete, Get, and GetTemplates against one state store
/// and one cluster.
pub struct Controller {
    state_store: Arc<dyn StateEngine>,
    instances_dir: PathBuf,
    templates_dir: PathBuf,
    enable_kustomize_build: bool,
    enable_kubectl: bool,
}

impl Controller {
    pub fn new(
        state_store: Arc<dyn StateEngine>,
        instances_dir: PathBuf,
        templates_dir: PathBuf,
        enable_kustomize_build: bool,
        enable_kubectl: bool,
    ) -> Self {
        Self {
            state_store,
            instances_dir,
            templates_dir,
            // kubectl consumes the kustomize output, so it implies the build
            enable_kustomize_build: enable_kustomize_build || enable_kubectl,
            enable_kubectl,
        }
    }

    pub async fn init(&self) -> Result<(), StateError> {
        self.state_store.init().await
    }

    /// Adds or updates an Instance, reconciles it into the cluster, and
    /// commits the change, rolling back on pipeline failure.
    pub async fn apply(&self, instance: pb::Instance) -> Result<pb::Instance, InstanceError> {
        validate_name(&instance.name)?;
        names_equate(&instance)?;
        check_name_prefix(&instance)?;
        let instance = normalize_files(instance)?;

        let (instance_dir, _) = helpers::instance_dir_file(&self.instances_dir, &instance.name);
        let mut updater = self.state_store.new_updater(instance, &self.instances_dir);

        let outcome: Result<(), InstanceError> = async {
            updater.init().await?;

            if self.enable_kubectl {
                if let Err(err) =
                    exec::pipe_kustomize_to_kubectl(&instance_dir, false, &["apply", "-f", "-"])
                        .await
                {
                    return Err(updater.cancel(err.into()).await.into());
                }
            } else if self.enable_kustomize_build
                && let Err(err) = exec::kustomize_build(&instance_dir).await
            {
                return Err(updater.cancel(err.into()).await.into());
            }

            updater.commit(false).await?;
            Ok(())
        }
        .await;

        if let Err(err) = updater.run_cleanup_funcs().await {
            warn!(error = %err, "updater cleanup failed");
        }
        outcome?;

        let mut instance = updater.instance().clone();
        if self.enable_kubectl {
            let _ = self.load_statuses(&mut instance).await;
        }
        // never echo the CAS witness back to clients
        instance.old_instance = None;
        info!(instance = %instance.name, "applied");
        Ok(instance)
    }

    /// Deletes an Instance from the cluster and then from the state store.
    pub async fn delete(&self, instance: pb::Instance) -> Result<pb::Instance, InstanceError> {
        validate_name(&instance.name)?;
        names_equate(&instance)?;

        let (instance_dir, _) = helpers::instance_dir_file(&self.instances_dir, &instance.name);
        let mut deleter = self.state_store.new_deleter(instance, &self.instances_dir);

        let outcome: Result<(), InstanceError> = async {
            deleter.init().await?;

            if self.enable_kubectl
                && let Err(err) =
                    exec::pipe_kustomize_to_kubectl(&instance_dir, false, &["delete", "-f", "-"])
                        .await
            {
                return Err(deleter.cancel(err.into()).await.into());
            }

            deleter.commit().await?;
            Ok(())
        }
        .await;

        if let Err(err) = deleter.run_cleanup_funcs().await {
            warn!(error = %err, "deleter cleanup failed");
        }
        outcome?;

        let mut instance = deleter.instance().clone();
        instance.old_instance = None;
        info!(instance = %instance.name, "deleted");
        Ok(instance)
    }

    /// Returns Instances, optionally decorated with live status.
    pub async fn get(&self, options: pb::GetOptions) -> Result<pb::InstanceList, InstanceError> {
        let exclude_statuses = options.exclude_statuses;
        let mut getter = self.state_store.new_getter(options, &self.instances_dir);

        let outcome = getter.run().await;
        if let Err(err) = getter.run_cleanup_funcs().await {
            warn!(error = %err, "getter cleanup failed");
        }
        let mut list = outcome?;

        if self.enable_kubectl && !exclude_statuses {
            for instance in &mut list.instances {
                // status failures stain the instance, never the Get
                let _ = self.load_statuses(instance).await;
            }
        }
        Ok(list)
    }

    /// Returns the Instance templates available under the templates dir,
    /// or exactly one of them when `options.name` is set.
    pub async fn get_templates(
        &self,
        options: pb::GetOptions,
    ) -> Result<pb::InstanceList, InstanceError> {
        let mut getter = self
            .state_store
            .new_templates_getter(options, &self.templates_dir);
        let outcome = getter.run().await;
        if let Err(err) = getter.run_cleanup_funcs().await {
            warn!(error = %err, "templates getter cleanup failed");
        }
        Ok(outcome?)
    }

    /// Probes the cluster for the Instance's object statuses via
    /// `kustomize build | kubectl get -o yaml -f -`. Failures are recorded in
    /// `statuses_error_message` and returned, but callers treat them as
    /// non-fatal.
    async fn load_statuses(&self, instance: &mut pb::Instance) -> Result<(), InstanceError> {
        let (instance_dir, _) = helpers::instance_dir_file(&self.instances_dir, &instance.name);
        let output = match exec::pipe_kustomize_to_kubectl(
            &instance_dir,
            true,
            &["get", "-o", "yaml", "-f", "-"],
        )
        .await
        {
            Ok(output) => output,
            Err(err) => {
                warn!(instance = %instance.name, error = %err, "status probe failed");
                instance.statuses_error_message = err.output();
                return Err(err.into());
            }
        };

        let items: ItemStatuses = match serde_yaml::from_slice(&output) {
            Ok(items) => items,
            Err(err) => {
                warn!(instance = %instance.name, error = %err, "status output did not parse");
                instance.statuses_error_message = String::from_utf8_lossy(&output).into_owned();
                return Err(err.into());
            }
        };
        instance.statuses = parse_statuses(items);
        Ok(())
    }
}

/// The subset of `kubectl get -o yaml -f -` output the status probe reads.
#[derive(Deserialize, Default)]
struct ItemStatuses {
    #[serde(default)]
    items: Vec<Item>,
}

#[derive(Deserialize, Default)]
struct Item {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    status: ItemStatus,
}

#[derive(Deserialize, Default)]
struct Metadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    namespace: String,
}

#[derive(Deserialize, Default)]
struct ItemStatus {
    #[serde(default, rename = "availableReplicas")]
    available_replicas: i32,
    #[serde(default, rename = "readyReplicas")]
    ready_replicas: i32,
    #[serde(default, rename = "replicas")]
    desired_replicas: i32,
    #[serde(default, rename = "updatedReplicas")]
    updated_replicas: i32,
}

fn parse_statuses(items: ItemStatuses) -> Vec<pb::Status> {
    let mut statuses = Vec::new();
    for item in items.items {
        match item.kind.as_str() {
            "Deployment" => statuses.push(pb::Status {
                item: Some(pb::status::Item::Deployment(pb::DeploymentStatus {
                    name: item.metadata.name,
                    desired: item.status.desired_replicas,
                    current: item.status.ready_replicas,
                    available: item.status.available_replicas,
                    up_to_date: item.status.updated_replicas,
                })),
            }),
            // other kinds are ignored until they grow a status mapping
            _ => {}
        }
    }
    statuses
}

fn validate_name(name: &str) -> Result<(), InstanceError> {
    if name.is_empty() || name.len() > NAME_MAX_LEN || !NAME_REGEX.is_match(name) {
        return Err(InstanceError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Ensures Instance.Name and OldInstance.Name are the same.
fn names_equate(instance: &pb::Instance) -> Result<(), InstanceError> {
    if let Some(old_instance) = instance.old_instance.as_deref()
        && old_instance.name != instance.name
    {
        return Err(InstanceError::NameMismatch);
    }
    Ok(())
}

#[derive(Deserialize)]
struct KustomizationDoc {
    #[serde(default, rename = "namePrefix")]
    name_prefix: String,
}

/// Requires the kustomization body to carry `namePrefix: <name>-`, so every
/// object the overlay generates is tagged with the Instance it belongs to.
fn check_name_prefix(instance: &pb::Instance) -> Result<(), InstanceError> {
    let expected = format!("{}-", instance.name);
    let doc: KustomizationDoc = serde_yaml::from_str(&instance.kustomization_yaml).map_err(
        |source| InstanceError::InvalidKustomization {
            name: instance.name.clone(),
            source,
        },
    )?;
    if doc.name_prefix != expected {
        return Err(InstanceError::NamePrefixMismatch {
            name: instance.name.clone(),
            expected,
            found: doc.name_prefix,
        });
    }
    Ok(())
}

/// Rejects reserved and tree-escaping file paths, and pins each file's
/// `directory` to the dirname of its relative path.
fn normalize_files(mut instance: pb::Instance) -> Result<pb::Instance, InstanceError> {
    for file in &mut instance.files {
        let path = Path::new(&file.relative_path);
        let escapes = path.is_absolute()
            || path
                .components()
                .any(|component| matches!(component, std::path::Component::ParentDir));
        if file.relative_path.is_empty()
            || file.relative_path == helpers::KUSTOMIZATION_FILE_NAME
            || escapes
        {
            return Err(InstanceError::InvalidFilePath(file.relative_path.clone()));
        }
        file.directory = helpers::dirname(&file.relative_path);
    }
    Ok(instance)
}
