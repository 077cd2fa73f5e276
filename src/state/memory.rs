//! In-memory state store: the full session interface over a process-local
//! map. Not durable; intended for tests and demos where neither etcd nor a
//! git remote is available.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

use super::{
    CleanupStack, Deleter, FsTemplatesGetter, Getter, StateEngine, StateError, TemplatesGetter,
    Updater, old_instance_matches,
};
use crate::helpers;
use crate::pb;

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct StoredInstance {
    kustomization_yaml: String,
    files: Vec<pb::File>,
}

type InstanceMap = Arc<Mutex<BTreeMap<String, StoredInstance>>>;
type LockMap = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Memory implementation of the state store interface. Clones share the same
/// underlying map, so a server and a test can observe the same store.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    instances: InstanceMap,
    locks: LockMap,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(name.to_string()).or_default().clone()
    }
}

async fn acquire(
    engine: &MemoryEngine,
    name: &str,
    cleanup: &mut CleanupStack,
) -> Result<(), StateError> {
    let lock = engine.name_lock(name).await;
    let guard: OwnedMutexGuard<()> = timeout(LOCK_TIMEOUT, lock.lock_owned())
        .await
        .map_err(|_| StateError::Timeout(LOCK_TIMEOUT, "memory lock"))?;
    cleanup.push("release lock", move || async move {
        drop(guard);
        Ok(())
    });
    Ok(())
}

#[async_trait]
impl StateEngine for MemoryEngine {
    async fn init(&self) -> Result<(), StateError> {
        Ok(())
    }

    fn new_updater(&self, instance: pb::Instance, instances_dir: &Path) -> Box<dyn Updater> {
        Box::new(MemoryUpdater {
            engine: self.clone(),
            instance,
            instances_dir: instances_dir.to_path_buf(),
            cleanup: CleanupStack::new(),
        })
    }

    fn new_deleter(&self, instance: pb::Instance, instances_dir: &Path) -> Box<dyn Deleter> {
        Box::new(MemoryDeleter {
            engine: self.clone(),
            instance,
            instances_dir: instances_dir.to_path_buf(),
            cleanup: CleanupStack::new(),
        })
    }

    fn new_getter(&self, options: pb::GetOptions, _instances_dir: &Path) -> Box<dyn Getter> {
        Box::new(MemoryGetter {
            engine: self.clone(),
            options,
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

struct MemoryUpdater {
    engine: MemoryEngine,
    instance: pb::Instance,
    instances_dir: PathBuf,
    cleanup: CleanupStack,
}

#[async_trait]
impl Updater for MemoryUpdater {
    async fn init(&mut self) -> Result<(), StateError> {
        acquire(&self.engine, &self.instance.name, &mut self.cleanup).await?;

        if let Some(old_instance) = self.instance.old_instance.as_deref() {
            let instances = self.engine.instances.lock().await;
            let Some(stored) = instances.get(&self.instance.name) else {
                return Err(StateError::InstanceNoExist);
            };
            old_instance_matches(&stored.kustomization_yaml, old_instance)?;
        }

        helpers::write_instance_tree(&self.instances_dir, &self.instance).await?;
        Ok(())
    }

    async fn commit(&mut self, _skip_commit: bool) -> Result<(), StateError> {
        let mut instances = self.engine.instances.lock().await;
        instances.insert(
            self.instance.name.clone(),
            StoredInstance {
                kustomization_yaml: self.instance.kustomization_yaml.clone(),
                files: self.instance.files.clone(),
            },
        );
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

struct MemoryDeleter {
    engine: MemoryEngine,
    instance: pb::Instance,
    instances_dir: PathBuf,
    cleanup: CleanupStack,
}

#[async_trait]
impl Deleter for MemoryDeleter {
    async fn init(&mut self) -> Result<(), StateError> {
        {
            let instances = self.engine.instances.lock().await;
            if !instances.contains_key(&self.instance.name) {
                return Err(StateError::InstanceNotFound(self.instance.name.clone()));
            }
        }

        acquire(&self.engine, &self.instance.name, &mut self.cleanup).await?;

        let instances = self.engine.instances.lock().await;
        let Some(stored) = instances.get(&self.instance.name) else {
            return Err(StateError::InstanceNotFound(self.instance.name.clone()));
        };
        if let Some(old_instance) = self.instance.old_instance.as_deref() {
            old_instance_matches(&stored.kustomization_yaml, old_instance)?;
        }
        self.instance.kustomization_yaml = stored.kustomization_yaml.clone();
        self.instance.files = stored.files.clone();
        drop(instances);

        helpers::write_instance_tree(&self.instances_dir, &self.instance).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StateError> {
        let mut instances = self.engine.instances.lock().await;
        instances.remove(&self.instance.name);
        drop(instances);

        let (instance_dir, _) = helpers::instance_dir_file(&self.instances_dir, &self.instance.name);
        if let Err(err) = tokio::fs::remove_dir_all(&instance_dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            return Err(err.into());
        }
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

struct MemoryGetter {
    engine: MemoryEngine,
    options: pb::GetOptions,
}

#[async_trait]
impl Getter for MemoryGetter {
    async fn run(&mut self) -> Result<pb::InstanceList, StateError> {
        let stored = self.engine.instances.lock().await;

        if !self.options.name.is_empty() {
            let instances = match stored.get(&self.options.name) {
                Some(instance) => vec![pb::Instance {
                    name: self.options.name.clone(),
                    kustomization_yaml: instance.kustomization_yaml.clone(),
                    files: instance.files.clone(),
                    ..Default::default()
                }],
                None => Vec::new(),
            };
            return Ok(pb::InstanceList { instances });
        }

        let instances: Vec<_> = stored
            .iter()
            .map(|(name, instance)| pb::Instance {
                name: name.clone(),
                kustomization_yaml: instance.kustomization_yaml.clone(),
                files: instance.files.clone(),
                ..Default::default()
            })
            .collect();
        drop(stored);

        let instances = helpers::paginate(instances, self.options.start, self.options.stop);
        Ok(pb::InstanceList { instances })
    }

    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError> {
        Ok(())
    }
}
