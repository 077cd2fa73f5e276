//! etcd-backed state store. Instances live under `hambone_instance_<name>`
//! keys, auxiliary files under `<instance_key>/<relative_path>`, and every
//! mutation runs under a lease-backed lock on `<instance_key>-lock`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions as EtcdGetOptions,
    LockOptions, SortOrder, SortTarget, Txn, TxnOp, TxnOpResponse,
};
use tokio::time::timeout;
use tracing::debug;

use super::{
    CleanupStack, Deleter, FsTemplatesGetter, Getter, StateEngine, StateError, TemplatesGetter,
    Updater, old_instance_matches,
};
use crate::helpers;
use crate::pb;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_TTL_SECS: i64 = 60;

pub(crate) const INSTANCE_KEY_PREFIX: &str = "hambone_instance_";

fn instance_key(name: &str) -> String {
    format!("{INSTANCE_KEY_PREFIX}{name}")
}

fn file_key(instance_key: &str, relative_path: &str) -> String {
    format!("{instance_key}/{relative_path}")
}

/// etcd implementation of the state store interface.
pub struct EtcdEngine {
    endpoints: Vec<String>,
}

impl EtcdEngine {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl StateEngine for EtcdEngine {
    async fn init(&self) -> Result<(), StateError> {
        // fail fast on unreachable endpoints instead of at the first RPC
        connect(&self.endpoints).await?;
        Ok(())
    }

    fn new_updater(&self, instance: pb::Instance, instances_dir: &Path) -> Box<dyn Updater> {
        Box::new(EtcdUpdater {
            instance,
            instances_dir: instances_dir.to_path_buf(),
            endpoints: self.endpoints.clone(),
            client: None,
            cleanup: CleanupStack::new(),
        })
    }

    fn new_deleter(&self, instance: pb::Instance, instances_dir: &Path) -> Box<dyn Deleter> {
        Box::new(EtcdDeleter {
            instance,
            instances_dir: instances_dir.to_path_buf(),
            endpoints: self.endpoints.clone(),
            client: None,
            cleanup: CleanupStack::new(),
        })
    }

    fn new_getter(&self, options: pb::GetOptions, _instances_dir: &Path) -> Box<dyn Getter> {
        Box::new(EtcdGetter {
            options,
            endpoints: self.endpoints.clone(),
            cleanup: CleanupStack::new(),
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

pub(crate) async fn connect(endpoints: &[String]) -> Result<Client, StateError> {
    let options = ConnectOptions::new().with_connect_timeout(DIAL_TIMEOUT);
    let client = timeout(DIAL_TIMEOUT, Client::connect(endpoints, Some(options)))
        .await
        .map_err(|_| StateError::Timeout(DIAL_TIMEOUT, "etcd dial"))??;
    debug!(endpoints = ?endpoints, "connected to etcd");
    Ok(client)
}

/// A held mutual-exclusion lock: a lease plus the lock ownership key.
/// Releasing unlocks and revokes the lease, mirroring session close.
pub(crate) struct EtcdLock {
    client: Client,
    lease_id: i64,
    ownership_key: Vec<u8>,
    name: String,
}

/// Acquires the lock guarding `storage_key`. The `-lock` suffix keeps the
/// lock key from ever colliding with a storage key.
pub(crate) async fn acquire_lock(client: &Client, storage_key: &str) -> Result<EtcdLock, StateError> {
    let name = format!("{storage_key}-lock");
    let mut client = client.clone();

    let lease = timeout(LOCK_TIMEOUT, client.lease_grant(SESSION_TTL_SECS, None))
        .await
        .map_err(|_| StateError::Timeout(LOCK_TIMEOUT, "etcd lease grant"))??;
    let lease_id = lease.id();

    let options = LockOptions::new().with_lease(lease_id);
    let response = match timeout(LOCK_TIMEOUT, client.lock(name.as_str(), Some(options))).await {
        Ok(response) => response?,
        Err(_) => {
            let _ = client.lease_revoke(lease_id).await;
            return Err(StateError::Timeout(LOCK_TIMEOUT, "etcd lock"));
        }
    };

    debug!(lock = %name, lease_id, "obtained lock");
    Ok(EtcdLock {
        client,
        lease_id,
        ownership_key: response.key().to_vec(),
        name,
    })
}

impl EtcdLock {
    pub(crate) async fn release(mut self) -> Result<(), StateError> {
        timeout(REQUEST_TIMEOUT, self.client.unlock(self.ownership_key.clone()))
            .await
            .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd unlock"))??;
        timeout(REQUEST_TIMEOUT, self.client.lease_revoke(self.lease_id))
            .await
            .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd lease revoke"))??;
        debug!(lock = %self.name, "released lock");
        Ok(())
    }
}

async fn key_exists(client: &mut Client, key: &str) -> Result<bool, StateError> {
    let txn = Txn::new().when(vec![Compare::version(key, CompareOp::Greater, 0)]);
    let response = timeout(REQUEST_TIMEOUT, client.txn(txn))
        .await
        .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd txn"))??;
    Ok(response.succeeded())
}

/// When an OldInstance witness was supplied, requires the stored value to
/// exist and to match it. Runs as one transaction so the read is atomic with
/// the existence check.
async fn old_instance_equals_current_if_set(
    client: &mut Client,
    instance_key: &str,
    old_instance: Option<&pb::Instance>,
) -> Result<(), StateError> {
    let Some(old_instance) = old_instance else {
        return Ok(());
    };

    let txn = Txn::new()
        .when(vec![Compare::version(instance_key, CompareOp::Greater, 0)])
        .and_then(vec![TxnOp::get(instance_key, None)]);
    let response = timeout(REQUEST_TIMEOUT, client.txn(txn))
        .await
        .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd txn"))??;
    if !response.succeeded() {
        return Err(StateError::InstanceNoExist);
    }

    let current = match response.op_responses().into_iter().next() {
        Some(TxnOpResponse::Get(get)) => get
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).into_owned())
            .unwrap_or_default(),
        _ => String::new(),
    };
    old_instance_matches(&current, old_instance)
}

struct EtcdUpdater {
    instance: pb::Instance,
    instances_dir: PathBuf,
    endpoints: Vec<String>,
    client: Option<Client>,
    cleanup: CleanupStack,
}

#[async_trait]
impl Updater for EtcdUpdater {
    async fn init(&mut self) -> Result<(), StateError> {
        let key = instance_key(&self.instance.name);

        let client = connect(&self.endpoints).await?;
        self.client = Some(client.clone());

        let lock = acquire_lock(&client, &key).await?;
        self.cleanup.push("release updater lock", move || lock.release());

        let mut kv = client;
        old_instance_equals_current_if_set(&mut kv, &key, self.instance.old_instance.as_deref())
            .await?;

        helpers::write_instance_tree(&self.instances_dir, &self.instance).await?;
        Ok(())
    }

    async fn commit(&mut self, _skip_commit: bool) -> Result<(), StateError> {
        let mut client = self.client.clone().ok_or(StateError::NotInitialized)?;
        let key = instance_key(&self.instance.name);

        // OldInstance matched (when present) and we hold the lock, so it no
        // longer matters whether the key pre-exists: just put
        timeout(
            REQUEST_TIMEOUT,
            client.put(key.clone(), self.instance.kustomization_yaml.clone(), None),
        )
        .await
        .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd put"))??;

        for file in &self.instance.files {
            timeout(
                REQUEST_TIMEOUT,
                client.put(file_key(&key, &file.relative_path), file.contents.clone(), None),
            )
            .await
            .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd put"))??;
        }
        Ok(())
    }

    async fn cancel(&mut self, err: StateError) -> StateError {
        // storage has not been mutated yet and the scratch tree is
        // disposable, so there is nothing to roll back
        err
    }

    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError> {
        self.cleanup.run().await
    }

    fn instance(&self) -> &pb::Instance {
        &self.instance
    }
}

struct EtcdDeleter {
    instance: pb::Instance,
    instances_dir: PathBuf,
    endpoints: Vec<String>,
    client: Option<Client>,
    cleanup: CleanupStack,
}

#[async_trait]
impl Deleter for EtcdDeleter {
    async fn init(&mut self) -> Result<(), StateError> {
        let key = instance_key(&self.instance.name);

        let mut client = connect(&self.endpoints).await?;
        self.client = Some(client.clone());

        if !key_exists(&mut client, &key).await? {
            return Err(StateError::InstanceNotFound(self.instance.name.clone()));
        }

        let lock = acquire_lock(&client, &key).await?;
        self.cleanup.push("release deleter lock", move || lock.release());

        old_instance_equals_current_if_set(&mut client, &key, self.instance.old_instance.as_deref())
            .await?;

        // load the stored representation so the external pipeline has a tree
        // to run `kubectl delete` against, whatever the caller supplied
        let response = timeout(REQUEST_TIMEOUT, client.get(key.clone(), None))
            .await
            .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd get"))??;
        let Some(kv) = response.kvs().first() else {
            return Err(StateError::InstanceNotFound(self.instance.name.clone()));
        };
        self.instance.kustomization_yaml = String::from_utf8_lossy(kv.value()).into_owned();

        let file_prefix = format!("{key}/");
        let response = timeout(
            REQUEST_TIMEOUT,
            client.get(file_prefix.clone(), Some(EtcdGetOptions::new().with_prefix())),
        )
        .await
        .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd get"))??;
        self.instance.files = response
            .kvs()
            .iter()
            .map(|kv| {
                let relative_path =
                    String::from_utf8_lossy(&kv.key()[file_prefix.len()..]).into_owned();
                pb::File {
                    directory: helpers::dirname(&relative_path),
                    contents: String::from_utf8_lossy(kv.value()).into_owned(),
                    relative_path,
                }
            })
            .collect();

        helpers::write_instance_tree(&self.instances_dir, &self.instance).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StateError> {
        let mut client = self.client.clone().ok_or(StateError::NotInitialized)?;
        let key = instance_key(&self.instance.name);

        // delete the instance key exactly, then its file sub-keys; a raw
        // prefix delete on the key would also take out sibling instances
        // whose names share the prefix
        timeout(REQUEST_TIMEOUT, client.delete(key.clone(), None))
            .await
            .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd delete"))??;
        timeout(
            REQUEST_TIMEOUT,
            client.delete(format!("{key}/"), Some(DeleteOptions::new().with_prefix())),
        )
        .await
        .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd delete"))??;

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

struct EtcdGetter {
    options: pb::GetOptions,
    endpoints: Vec<String>,
    cleanup: CleanupStack,
}

#[async_trait]
impl Getter for EtcdGetter {
    async fn run(&mut self) -> Result<pb::InstanceList, StateError> {
        let mut client = connect(&self.endpoints).await?;

        if !self.options.name.is_empty() {
            let key = instance_key(&self.options.name);
            let response = timeout(
                REQUEST_TIMEOUT,
                client.get(key, Some(EtcdGetOptions::new().with_prefix())),
            )
            .await
            .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd get"))??;
            let pairs = key_value_pairs(response.kvs());
            let instances: Vec<_> = instances_from_scan(&pairs)
                .into_iter()
                .filter(|instance| instance.name == self.options.name)
                .collect();
            return Ok(pb::InstanceList { instances });
        }

        let response = timeout(
            REQUEST_TIMEOUT,
            client.get(
                INSTANCE_KEY_PREFIX,
                Some(
                    EtcdGetOptions::new()
                        .with_prefix()
                        .with_sort(SortTarget::Key, SortOrder::Ascend),
                ),
            ),
        )
        .await
        .map_err(|_| StateError::Timeout(REQUEST_TIMEOUT, "etcd get"))??;

        let pairs = key_value_pairs(response.kvs());
        let instances = helpers::paginate(
            instances_from_scan(&pairs),
            self.options.start,
            self.options.stop,
        );
        Ok(pb::InstanceList { instances })
    }

    async fn run_cleanup_funcs(&mut self) -> Result<(), StateError> {
        self.cleanup.run().await
    }
}

fn key_value_pairs(kvs: &[etcd_client::KeyValue]) -> Vec<(String, String)> {
    kvs.iter()
        .map(|kv| {
            (
                String::from_utf8_lossy(kv.key()).into_owned(),
                String::from_utf8_lossy(kv.value()).into_owned(),
            )
        })
        .collect()
}

/// Converts a key-ascending prefix scan into an Instance list. Bare keys are
/// instances, `<name>/<path>` keys are their auxiliary files, and lock
/// ownership keys (`<name>-lock/<lease>`) are skipped.
fn instances_from_scan(pairs: &[(String, String)]) -> Vec<pb::Instance> {
    let mut instances: Vec<pb::Instance> = Vec::new();
    for (key, value) in pairs {
        let Some(stripped) = key.strip_prefix(INSTANCE_KEY_PREFIX) else {
            continue;
        };
        match stripped.split_once('/') {
            None => instances.push(pb::Instance {
                name: stripped.to_string(),
                kustomization_yaml: value.clone(),
                ..Default::default()
            }),
            Some((owner, relative_path)) => {
                if owner.ends_with("-lock") {
                    continue;
                }
                if let Some(last) = instances.last_mut()
                    && last.name == owner
                {
                    last.files.push(pb::File {
                        relative_path: relative_path.to_string(),
                        directory: helpers::dirname(relative_path),
                        contents: value.clone(),
                    });
                }
            }
        }
    }
    instances
}
