//! crucibled — Crucible daemon.
//!
//! One binary, two roles:
//!   crucibled api      HTTP ingress + websocket hub + bus subscriber
//!   crucibled worker   queue consumer for WORKER_TYPE (compile | deploy)
//!
//! Both roles share the config file and env overrides; horizontal scale
//! is more processes, coordinated only through the broker and the store.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast;

use crucible_api::ApiState;
use crucible_core::config::{CrucibleConfig, WorkerType};
use crucible_core::user::Tier;
use crucible_services::{
    AuditHooks, Bus, CompileRunner, DeployRunner, Directory, JobStore, QueueAdapter, QuotaGate,
    SocketHub, bus, open_store, worker,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let role = std::env::args().nth(1).unwrap_or_else(|| "api".to_string());
    let config_path = CrucibleConfig::write_default_if_missing().context("writing default config")?;
    let config = CrucibleConfig::load().context("loading config")?;
    tracing::info!(config = %config_path.display(), role, "crucibled starting");

    let conn = open_store(&config.store.uri)
        .await
        .context("opening job store")?;
    let store = JobStore::new(conn.clone());
    let directory = Directory::new(conn.clone());
    let audit = AuditHooks::new(conn, directory.clone());

    seed_dev_accounts(&directory).await?;

    // Shutdown broadcast: SIGTERM/SIGINT fan out to every loop.
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    spawn_signal_handler(shutdown_tx.clone());

    match role.as_str() {
        "api" => run_api(config, store, directory, shutdown_tx).await,
        "worker" => run_worker(config, store, audit, shutdown_tx).await,
        other => bail!("unknown role '{other}' (expected 'api' or 'worker')"),
    }
}

async fn run_api(
    config: CrucibleConfig,
    store: JobStore,
    directory: Directory,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let queue = QueueAdapter::connect(&config.broker)
        .await
        .context("connecting to broker")?;
    let bus_handle = match Bus::connect(&config.broker).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "bus unavailable, events will be dropped");
            Bus::offline()
        }
    };
    let hub = SocketHub::new();

    // Bus subscriber feeds the hub's rooms; reconnects until shutdown.
    {
        let broker = config.broker.clone();
        let hub = hub.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            loop {
                let rx = shutdown_tx.subscribe();
                match bus::subscribe_loop(&broker, hub.clone(), rx).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "bus subscriber failed, reconnecting");
                    }
                }
                let mut rx = shutdown_tx.subscribe();
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        });
    }

    let state = ApiState {
        store,
        directory: directory.clone(),
        queue,
        bus: bus_handle,
        hub,
        quota: QuotaGate::new(directory),
        shutdown_tx,
    };
    crucible_api::serve(state, &config.api).await
}

async fn run_worker(
    config: CrucibleConfig,
    store: JobStore,
    audit: AuditHooks,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let queue = QueueAdapter::connect(&config.broker)
        .await
        .context("connecting to broker")?;
    let bus_handle = match Bus::connect(&config.broker).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "bus unavailable, events will be dropped");
            Bus::offline()
        }
    };

    let worker_type = config.worker.worker_type;
    let concurrency = match worker_type {
        WorkerType::Compile => config.worker.compile_concurrency,
        WorkerType::Deploy => config.worker.deploy_concurrency,
    };

    let ctx = worker::WorkerContext {
        store,
        bus: bus_handle,
        audit,
        compile_runner: CompileRunner::new(config.worker.work_dir.clone()),
        deploy_runner: DeployRunner::new(config.worker.work_dir.clone(), config.deploy.clone()),
    };

    worker::run(ctx, queue, worker_type, concurrency, shutdown_tx.subscribe()).await;
    Ok(())
}

fn spawn_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate => {}
        }
        tracing::info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(());
    });
}

/// Identity is an external collaborator; this bridges it for dev setups.
/// CRUCIBLE_SEED_USER="id:token[:tier]" and
/// CRUCIBLE_SEED_PROJECT="id:owner" upsert rows at boot.
async fn seed_dev_accounts(directory: &Directory) -> Result<()> {
    if let Ok(spec) = std::env::var("CRUCIBLE_SEED_USER") {
        let mut parts = spec.splitn(3, ':');
        let (Some(id), Some(token)) = (parts.next(), parts.next()) else {
            bail!("CRUCIBLE_SEED_USER must be id:token[:tier]");
        };
        let tier = match parts.next() {
            Some("tier_mid") => Tier::TierMid,
            Some("tier_top") => Tier::TierTop,
            _ => Tier::Free,
        };
        directory
            .upsert_user(id, token, tier)
            .await
            .context("seeding user")?;
        tracing::info!(user = id, ?tier, "seeded dev user");
    }
    if let Ok(spec) = std::env::var("CRUCIBLE_SEED_PROJECT") {
        let mut parts = spec.splitn(2, ':');
        let (Some(id), Some(owner)) = (parts.next(), parts.next()) else {
            bail!("CRUCIBLE_SEED_PROJECT must be id:owner");
        };
        directory
            .upsert_project(id, owner, &[])
            .await
            .context("seeding project")?;
        tracing::info!(project = id, owner, "seeded dev project");
    }
    Ok(())
}
