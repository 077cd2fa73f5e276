use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hambone::instances::Controller;
use hambone::instances::server::InstancesService;
use hambone::pb;
use hambone::state::StateEngine;
use hambone::state::etcd::EtcdEngine;
use hambone::state::git::{GitEngine, GitLockConfig};
use hambone::state::memory::MemoryEngine;

#[derive(Parser)]
#[command(name = "hambone")]
#[command(about = "Centralized Kustomize overlay manager", long_about = None)]
struct Cli {
    /// Network address the gRPC server listens on
    #[arg(long = "listen_address", default_value = "127.0.0.1:50051")]
    listen_address: String,

    /// Root of the state repository (and base for relative directories)
    #[arg(long = "repo_dir", default_value = ".")]
    repo_dir: PathBuf,

    /// Directory in which to create Instance directories
    #[arg(long = "instances_dir", default_value = "./instances")]
    instances_dir: PathBuf,

    /// Directory holding Instance templates
    #[arg(long = "templates_dir", default_value = "./templates")]
    templates_dir: PathBuf,

    /// State store backend
    #[arg(long = "state_store", value_enum, default_value = "etcd")]
    state_store: StateStoreKind,

    /// Comma-separated list of etcd endpoints
    #[arg(long = "etcd_endpoints", default_value = "http://127.0.0.1:2379")]
    etcd_endpoints: String,

    /// Verify overlays with `kustomize build` before committing
    #[arg(long = "enable_kustomize_build")]
    enable_kustomize_build: bool,

    /// Reconcile overlays into the cluster with kubectl (implies
    /// --enable_kustomize_build)
    #[arg(long = "enable_kubectl")]
    enable_kubectl: bool,

    /// Serialize all git-backend writers through one etcd lock on this key
    #[arg(long = "etcd_locks_with_git_key")]
    etcd_locks_with_git_key: Option<String>,

    /// Branch the git backend commits to
    #[arg(long = "git_branch", default_value = "master")]
    git_branch: String,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Copy, Clone, ValueEnum)]
enum StateStoreKind {
    Git,
    Etcd,
    Memory,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let endpoints: Vec<String> = cli
        .etcd_endpoints
        .split(',')
        .map(|endpoint| endpoint.trim().to_string())
        .filter(|endpoint| !endpoint.is_empty())
        .collect();

    let instances_dir = resolve_dir(&cli.repo_dir, &cli.instances_dir);
    let templates_dir = resolve_dir(&cli.repo_dir, &cli.templates_dir);

    let state_store: Arc<dyn StateEngine> = match cli.state_store {
        StateStoreKind::Git => Arc::new(GitEngine::new(
            cli.repo_dir.clone(),
            cli.git_branch.clone(),
            cli.etcd_locks_with_git_key.clone().map(|key| GitLockConfig {
                endpoints: endpoints.clone(),
                key,
            }),
        )),
        StateStoreKind::Etcd => Arc::new(EtcdEngine::new(endpoints)),
        StateStoreKind::Memory => Arc::new(MemoryEngine::new()),
    };

    let controller = Arc::new(Controller::new(
        state_store,
        instances_dir,
        templates_dir,
        cli.enable_kustomize_build,
        cli.enable_kubectl,
    ));
    controller
        .init()
        .await
        .context("state store initialization failed")?;

    let address: SocketAddr = cli
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address `{}`", cli.listen_address))?;

    info!(address = %address, "listening");
    Server::builder()
        .add_service(pb::instances_server::InstancesServer::new(
            InstancesService::new(controller),
        ))
        .serve_with_shutdown(address, shutdown_signal())
        .await
        .context("gRPC server failed")?;

    info!("shut down cleanly");
    Ok(())
}

/// Relative directories are resolved against the repo root, so the default
/// `./instances` lands inside the state repository.
fn resolve_dir(repo_dir: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        repo_dir.join(dir)
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}

fn setup_tracing(verbose: bool) {
    let default = if verbose { "hambone=debug" } else { "hambone=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
