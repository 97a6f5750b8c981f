//! Worker loop — dequeues payloads and drives jobs through
//! `queued → active → completed | failed`.
//!
//! Dispatch is at-least-once, so every start is treated as a possible
//! repeat: a payload whose job is already terminal is acked without
//! re-running, and side effects only fire on the invocation that
//! performed the terminal write. Runner errors are recorded terminally;
//! transient infrastructure errors additionally hand the payload back
//! to the broker for retry.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::FutureExt;
use tokio::sync::{Semaphore, broadcast, mpsc};

use crucible_core::JobError;
use crucible_core::config::WorkerType;
use crucible_core::job::{
    CompilePayload, CompileResult, DeployPayload, DeployResult, JobResult, JobType, LogEvent,
    LogRecord, StatusEvent,
};

use crate::audit::AuditHooks;
use crate::bus::Bus;
use crate::compile_runner::{CompileRequest, CompileRunner, LogTx};
use crate::deploy_runner::{DeployRequest, DeployRunner};
use crate::job_store::JobStore;
use crate::queue::{Claimed, Delivery, QueueAdapter};

const CLAIM_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a worker needs. Cheap to clone into per-payload tasks.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: JobStore,
    pub bus: Bus,
    pub audit: AuditHooks,
    pub compile_runner: CompileRunner,
    pub deploy_runner: DeployRunner,
}

/// What the loop should do with a processed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done (including absorbed repeats); remove from the broker.
    Ack,
    /// Transient trouble; hand back so broker retry policy applies.
    Retry,
}

/// Consume a queue until shutdown, then drain in-flight handlers.
pub async fn run(
    ctx: WorkerContext,
    queue: QueueAdapter,
    worker_type: WorkerType,
    concurrency: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let queue_name = match worker_type {
        WorkerType::Compile => "compile",
        WorkerType::Deploy => "deploy",
    };
    let concurrency = concurrency.max(1) as usize;

    match queue.recover(queue_name).await {
        Ok(0) => {}
        Ok(n) => tracing::info!(queue = queue_name, recovered = n, "re-queued stale payloads"),
        Err(e) => tracing::warn!(queue = queue_name, error = %e, "queue recovery failed"),
    }

    let semaphore = Arc::new(Semaphore::new(concurrency));
    tracing::info!(queue = queue_name, concurrency, "worker started");

    loop {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break, // semaphore closed
        };

        let stop = tokio::select! {
            _ = shutdown.recv() => true,
            claimed = claim_and_spawn(&ctx, &queue, queue_name, worker_type) => {
                match claimed {
                    Ok(Some(task)) => {
                        tokio::spawn(async move {
                            task.await;
                            drop(permit);
                        });
                        continue;
                    }
                    Ok(None) => {
                        drop(permit);
                        false
                    }
                    Err(e) => {
                        tracing::warn!(queue = queue_name, error = %e, "claim failed");
                        drop(permit);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        false
                    }
                }
            }
        };
        if stop {
            break;
        }
    }

    // Await in-flight handlers before exit.
    let _ = semaphore.acquire_many(concurrency as u32).await;
    tracing::info!(queue = queue_name, "worker drained");
}

/// Claim one payload and package it into a future that processes it and
/// settles it with the broker.
async fn claim_and_spawn(
    ctx: &WorkerContext,
    queue: &QueueAdapter,
    queue_name: &'static str,
    worker_type: WorkerType,
) -> Result<Option<std::pin::Pin<Box<dyn Future<Output = ()> + Send>>>, JobError> {
    match worker_type {
        WorkerType::Compile => {
            let Some(claimed) = queue.next::<CompilePayload>(queue_name, CLAIM_TIMEOUT).await?
            else {
                return Ok(None);
            };
            let ctx = ctx.clone();
            let queue = queue.clone();
            Ok(Some(Box::pin(async move {
                let disposition = process_compile(&ctx, &claimed.delivery).await;
                settle(&queue, queue_name, claimed, disposition).await;
            })))
        }
        WorkerType::Deploy => {
            let Some(claimed) = queue.next::<DeployPayload>(queue_name, CLAIM_TIMEOUT).await?
            else {
                return Ok(None);
            };
            let ctx = ctx.clone();
            let queue = queue.clone();
            Ok(Some(Box::pin(async move {
                let disposition = process_deploy(&ctx, &claimed.delivery).await;
                settle(&queue, queue_name, claimed, disposition).await;
            })))
        }
    }
}

async fn settle<T: serde::Serialize>(
    queue: &QueueAdapter,
    queue_name: &str,
    claimed: Claimed<T>,
    disposition: Disposition,
) {
    let outcome = match disposition {
        Disposition::Ack => queue.complete(queue_name, &claimed).await,
        Disposition::Retry => queue.retry(queue_name, claimed).await.map(|d| {
            tracing::info!(queue = queue_name, ?d, "payload handed back");
        }),
    };
    if let Err(e) = outcome {
        tracing::warn!(queue = queue_name, error = %e, "settling payload failed");
    }
}

// ── Log pump ──────────────────────────────────────────────────────────────────

/// Drains runner-emitted records in FIFO order, persisting the tail and
/// publishing each on the bus. Resolves to the full emitted sequence
/// once the sender side is dropped.
fn start_log_pump(
    store: JobStore,
    bus: Bus,
    job_id: String,
) -> (LogTx, tokio::task::JoinHandle<Vec<LogRecord>>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
    let pump = tokio::spawn(async move {
        let mut emitted: Vec<LogRecord> = Vec::new();
        while let Some(record) = rx.recv().await {
            emitted.push(record.clone());
            if let Err(e) = store.append_logs(&job_id, &emitted).await {
                tracing::warn!(job_id = %job_id, error = %e, "log tail write failed");
            }
            bus.publish_log(&LogEvent {
                job_id: job_id.clone(),
                log: record,
            })
            .await;
        }
        emitted
    });
    (tx, pump)
}

// ── Payload processing ────────────────────────────────────────────────────────

/// Idempotency check shared by both job kinds. `Some(disposition)` means
/// stop here.
async fn absorb_repeat(ctx: &WorkerContext, job_id: &str) -> Option<Disposition> {
    match ctx.store.get(job_id).await {
        Ok(Some(job)) if job.is_terminal() => {
            tracing::info!(job_id, status = ?job.status, "job already terminal, absorbing redelivery");
            Some(Disposition::Ack)
        }
        Ok(Some(_)) => None,
        Ok(None) => {
            // Enqueue happened but the job row never landed; there is no
            // state to protect, so the payload is acked away.
            tracing::warn!(job_id, "payload for unknown job, acking");
            Some(Disposition::Ack)
        }
        Err(e) => {
            tracing::warn!(job_id, error = %e, "store unreachable during idempotency check");
            Some(Disposition::Retry)
        }
    }
}

pub async fn process_compile(
    ctx: &WorkerContext,
    delivery: &Delivery<CompilePayload>,
) -> Disposition {
    let payload = &delivery.payload;
    let job_id = payload.job_id.clone();

    if let Some(disposition) = absorb_repeat(ctx, &job_id).await {
        return disposition;
    }

    if let Err(e) = ctx.store.mark_active(&job_id).await {
        tracing::warn!(job_id = %job_id, error = %e, "activation failed");
        return Disposition::Retry;
    }
    // Live-only start marker; the persisted tail stays the runner's stream.
    ctx.bus
        .publish_log(&LogEvent {
            job_id: job_id.clone(),
            log: LogRecord::info(format!("Compile job started (attempt {})", delivery.attempt)),
        })
        .await;

    let (log_tx, pump) = start_log_pump(ctx.store.clone(), ctx.bus.clone(), job_id.clone());
    let request = CompileRequest {
        project_id: payload.project_id.clone(),
        job_id: job_id.clone(),
        files: payload.files.clone(),
    };

    let outcome = std::panic::AssertUnwindSafe(ctx.compile_runner.compile(&request, &log_tx))
        .catch_unwind()
        .await;
    drop(log_tx);
    let mut logs = pump.await.unwrap_or_default();

    match outcome {
        Ok(Ok(output)) => {
            let result = JobResult::Compile(CompileResult {
                wasm_base64: BASE64.encode(&output.wasm),
                wasm_filename: output.wasm_filename,
                backend_used: output.backend,
            });
            finalize_success(ctx, &job_id, result).await
        }
        Ok(Err(e)) => finalize_failure(ctx, &job_id, e, &mut logs).await,
        Err(_) => {
            let e = JobError::SpawnError("compile runner panicked".into());
            let disposition = finalize_failure(ctx, &job_id, e, &mut logs).await;
            // A panic is raise-like: give the broker a chance to retry.
            if disposition == Disposition::Ack {
                Disposition::Retry
            } else {
                disposition
            }
        }
    }
}

pub async fn process_deploy(ctx: &WorkerContext, delivery: &Delivery<DeployPayload>) -> Disposition {
    let payload = &delivery.payload;
    let job_id = payload.job_id.clone();

    if let Some(disposition) = absorb_repeat(ctx, &job_id).await {
        return disposition;
    }

    if let Err(e) = ctx.store.mark_active(&job_id).await {
        tracing::warn!(job_id = %job_id, error = %e, "activation failed");
        return Disposition::Retry;
    }
    ctx.bus
        .publish_log(&LogEvent {
            job_id: job_id.clone(),
            log: LogRecord::info(format!("Deploy job started (attempt {})", delivery.attempt)),
        })
        .await;

    let (log_tx, pump) = start_log_pump(ctx.store.clone(), ctx.bus.clone(), job_id.clone());

    let outcome = match BASE64.decode(&payload.wasm_base64) {
        Ok(wasm) => {
            let request = DeployRequest {
                project_id: payload.project_id.clone(),
                job_id: job_id.clone(),
                wasm: wasm.into(),
                network: payload.network,
                wallet_info: payload.wallet_info.clone(),
            };
            std::panic::AssertUnwindSafe(ctx.deploy_runner.deploy(&request, &log_tx))
                .catch_unwind()
                .await
        }
        Err(e) => Ok(Err(JobError::InvalidWasm(format!("base64 decode: {e}")))),
    };
    drop(log_tx);
    let mut logs = pump.await.unwrap_or_default();

    match outcome {
        Ok(Ok(deployed)) => {
            let result = JobResult::Deploy(DeployResult {
                contract_id: deployed.contract_id,
                network: payload.network,
                signer_identity: deployed.signer_identity,
                signer_address: deployed.signer_address,
            });
            finalize_success(ctx, &job_id, result).await
        }
        Ok(Err(e)) => finalize_failure(ctx, &job_id, e, &mut logs).await,
        Err(_) => {
            let e = JobError::SpawnError("deploy runner panicked".into());
            let disposition = finalize_failure(ctx, &job_id, e, &mut logs).await;
            if disposition == Disposition::Ack {
                Disposition::Retry
            } else {
                disposition
            }
        }
    }
}

/// Terminal success write plus status publish. Side effects belong to
/// the caller and must key off `fresh`.
async fn finalize_success(ctx: &WorkerContext, job_id: &str, result: JobResult) -> Disposition {
    match ctx.store.complete(job_id, result).await {
        Ok(terminal) => {
            ctx.bus
                .publish_status(&StatusEvent {
                    job_id: job_id.to_string(),
                    status: terminal.job.status,
                    result: terminal.job.result.clone(),
                })
                .await;
            if terminal.fresh {
                if let Some(JobResult::Deploy(deployed)) = &terminal.job.result {
                    ctx.audit
                        .record_deploy_success(
                            &terminal.job.owner_id,
                            job_id,
                            &deployed.contract_id,
                        )
                        .await;
                }
            }
            Disposition::Ack
        }
        Err(e) => {
            tracing::warn!(job_id, error = %e, "terminal complete write failed");
            Disposition::Retry
        }
    }
}

/// Terminal failure write plus status publish. The error record is
/// appended to the captured tail so clients can see what went wrong
/// even when the runner failed before emitting anything.
async fn finalize_failure(
    ctx: &WorkerContext,
    job_id: &str,
    error: JobError,
    logs: &mut Vec<LogRecord>,
) -> Disposition {
    let error_text = error.to_string();
    logs.push(LogRecord::error(error_text.clone()));

    match ctx.store.fail(job_id, &error_text, logs).await {
        Ok(terminal) => {
            ctx.bus
                .publish_status(&StatusEvent {
                    job_id: job_id.to_string(),
                    status: terminal.job.status,
                    result: None,
                })
                .await;
            if terminal.fresh && terminal.job.job_type == JobType::Deploy {
                ctx.audit
                    .record_deploy_failure(&terminal.job.owner_id, job_id, &error_text)
                    .await;
            }
            if error.is_transient() {
                Disposition::Retry
            } else {
                Disposition::Ack
            }
        }
        Err(e) => {
            tracing::warn!(job_id, error = %e, "terminal fail write failed");
            Disposition::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_runner::STUB_WASM;
    use crate::directory::Directory;
    use crate::job_store::open_store_in_memory;
    use crucible_core::config::DeploySettings;
    use crucible_core::job::{CompileBackend, JobStatus, LogKind, Network, SourceFile};
    use crucible_core::user::Tier;

    struct Harness {
        ctx: WorkerContext,
        directory: Directory,
        _work: tempfile::TempDir,
    }

    async fn harness(cli: Option<String>) -> Harness {
        let work = tempfile::tempdir().unwrap();
        let conn = open_store_in_memory().await.unwrap();
        let store = JobStore::new(conn.clone());
        let directory = Directory::new(conn.clone());
        directory.upsert_user("u1", "tok", Tier::Free).await.unwrap();

        let mut deploy_runner =
            DeployRunner::new(work.path().to_path_buf(), DeploySettings::default());
        if let Some(cli) = cli {
            deploy_runner = deploy_runner.with_cli(cli);
        }

        Harness {
            ctx: WorkerContext {
                store,
                bus: Bus::offline(),
                audit: AuditHooks::new(conn, directory.clone()),
                compile_runner: CompileRunner::new(work.path().to_path_buf())
                    .with_backend(CompileBackend::Stub),
                deploy_runner,
            },
            directory,
            _work: work,
        }
    }

    /// Scripted stand-in for the deploy CLI: answers probes, identity
    /// lookups, and prints a labeled contract id on deploy.
    fn write_fake_cli(dir: &std::path::Path, contract_id: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-stellar");
        let script = format!(
            "#!/bin/sh\n\
             case \"$1 $2\" in\n\
               \"keys address\") echo GFAKESIGNERADDRESS ;;\n\
               \"keys generate\"|\"keys fund\") exit 0 ;;\n\
               \"contract deploy\") echo \"Contract ID: {contract_id}\" ;;\n\
               *) echo \"stellar 22.0.0\" ;;\n\
             esac\n"
        );
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn delivery<T>(payload: T) -> Delivery<T> {
        Delivery {
            handle: "h".into(),
            attempt: 1,
            enqueued_at: chrono::Utc::now(),
            payload,
        }
    }

    fn compile_payload(job_id: &str) -> CompilePayload {
        CompilePayload {
            project_id: "p1".into(),
            files: vec![
                SourceFile {
                    name: "Cargo.toml".into(),
                    content: "[package]\nname = \"p1\"".into(),
                },
                SourceFile {
                    name: "lib.rs".into(),
                    content: "pub fn f() {}".into(),
                },
            ],
            job_id: job_id.into(),
            user_id: "u1".into(),
        }
    }

    fn deploy_payload(job_id: &str, wasm_base64: &str) -> DeployPayload {
        DeployPayload {
            project_id: "p1".into(),
            wasm_base64: wasm_base64.into(),
            network: Network::Testnet,
            job_id: job_id.into(),
            user_id: "u1".into(),
            wallet_info: None,
        }
    }

    #[tokio::test]
    async fn compile_job_completes_through_stub_backend() {
        let h = harness(None).await;
        h.ctx
            .store
            .create("j1", JobType::Compile, "u1", "p1", vec![])
            .await
            .unwrap();

        let disposition = process_compile(&h.ctx, &delivery(compile_payload("j1"))).await;
        assert_eq!(disposition, Disposition::Ack);

        let job = h.ctx.store.get("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        match job.result.unwrap() {
            JobResult::Compile(r) => {
                assert_eq!(r.wasm_base64, BASE64.encode(STUB_WASM));
                assert_eq!(r.backend_used, CompileBackend::Stub);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(job.logs.iter().any(|l| l.kind == LogKind::Success));
    }

    #[tokio::test]
    async fn terminal_redelivery_is_absorbed() {
        let h = harness(None).await;
        h.ctx
            .store
            .create("j1", JobType::Compile, "u1", "p1", vec![])
            .await
            .unwrap();

        let payload = delivery(compile_payload("j1"));
        assert_eq!(process_compile(&h.ctx, &payload).await, Disposition::Ack);
        let first = h.ctx.store.get("j1").await.unwrap().unwrap();

        // Redelivery: absorbed without re-running the runner.
        assert_eq!(process_compile(&h.ctx, &payload).await, Disposition::Ack);
        let second = h.ctx.store.get("j1").await.unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(second.updated_at, first.updated_at);
    }

    #[tokio::test]
    async fn payload_for_missing_job_is_acked() {
        let h = harness(None).await;
        let disposition = process_compile(&h.ctx, &delivery(compile_payload("ghost"))).await;
        assert_eq!(disposition, Disposition::Ack);
        assert!(h.ctx.store.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compile_without_manifest_fails_terminally() {
        let h = harness(None).await;
        h.ctx
            .store
            .create("j1", JobType::Compile, "u1", "p1", vec![])
            .await
            .unwrap();

        let mut payload = compile_payload("j1");
        payload.files.retain(|f| f.name != "Cargo.toml");
        assert_eq!(
            process_compile(&h.ctx, &delivery(payload)).await,
            Disposition::Ack
        );

        let job = h.ctx.store.get("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("CompilerFailed"));
    }

    #[tokio::test]
    async fn deploy_job_completes_with_mocked_cli() {
        let work = tempfile::tempdir().unwrap();
        let contract_id = format!("C{}", "AB2DEF34GH56".repeat(5));
        let cli = write_fake_cli(work.path(), &contract_id);
        let h = harness(Some(cli)).await;

        h.ctx
            .store
            .create("j1", JobType::Deploy, "u1", "p1", vec![])
            .await
            .unwrap();
        let payload = delivery(deploy_payload("j1", &BASE64.encode(STUB_WASM)));
        assert_eq!(process_deploy(&h.ctx, &payload).await, Disposition::Ack);

        let job = h.ctx.store.get("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        match job.result.unwrap() {
            JobResult::Deploy(r) => {
                assert_eq!(r.contract_id, contract_id);
                assert_eq!(r.network, Network::Testnet);
                assert_eq!(r.signer_address, "GFAKESIGNERADDRESS");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // Side effects fired exactly once.
        let user = h.directory.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.deploy_counter.count, 1);
        let entries = h.ctx.audit.entries_for_job("j1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "success");

        // Worker crash after the terminal write: redelivery is absorbed
        // and the audit log still has exactly one success entry.
        assert_eq!(process_deploy(&h.ctx, &payload).await, Disposition::Ack);
        let entries = h.ctx.audit.entries_for_job("j1").await.unwrap();
        assert_eq!(entries.len(), 1);
        let user = h.directory.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.deploy_counter.count, 1);
    }

    #[tokio::test]
    async fn deploy_with_invalid_wasm_fails_before_signing() {
        let work = tempfile::tempdir().unwrap();
        let cli = write_fake_cli(work.path(), &format!("C{}", "A".repeat(55)));
        let h = harness(Some(cli)).await;

        h.ctx
            .store
            .create("j1", JobType::Deploy, "u1", "p1", vec![])
            .await
            .unwrap();
        // "AAAA" decodes to three zero bytes: far too short for a module.
        let payload = delivery(deploy_payload("j1", "AAAA"));
        assert_eq!(process_deploy(&h.ctx, &payload).await, Disposition::Ack);

        let job = h.ctx.store.get("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_ref().unwrap().contains("InvalidWasm"));
        assert_eq!(job.logs[0].kind, LogKind::Error);

        // Failed attempts never burn quota.
        let user = h.directory.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.deploy_counter.count, 0);
        let entries = h.ctx.audit.entries_for_job("j1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "failure");
    }

    #[tokio::test]
    async fn deploy_without_toolchain_fails_with_toolchain_missing() {
        let h = harness(Some("crucible-no-such-cli".into())).await;
        h.ctx
            .store
            .create("j1", JobType::Deploy, "u1", "p1", vec![])
            .await
            .unwrap();

        let payload = delivery(deploy_payload("j1", &BASE64.encode(STUB_WASM)));
        assert_eq!(process_deploy(&h.ctx, &payload).await, Disposition::Ack);

        let job = h.ctx.store.get("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("ToolchainMissing"));
    }
}
