//! /compile, /deploy, and /jobs handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crucible_core::JobError;
use crucible_core::job::{
    CompilePayload, DeployPayload, Job, JobResult, JobStatus, JobType, LogRecord, Network,
    SourceFile, new_job_id,
};
use crucible_core::user::QuotaAction;
use crucible_services::ListFilter;

use super::{ApiError, ApiState, authenticate};

// ── POST /compile ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CompileBody {
    pub project_id: String,
    pub files: Vec<SourceFile>,
}

#[derive(Serialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub job_id: String,
    pub logs: Vec<LogRecord>,
}

pub async fn handle_compile(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<CompileBody>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let user = authenticate(&state, &headers).await?;

    if body.project_id.is_empty() {
        return Err(JobError::BadInput("project_id is required".into()).into());
    }
    if body.files.is_empty() {
        return Err(JobError::BadInput("files must not be empty".into()).into());
    }

    let project = state
        .directory
        .get_project(&body.project_id)
        .await?
        .ok_or_else(|| JobError::NotFound(format!("project {}", body.project_id)))?;
    if project.owner_id != user.id {
        return Err(JobError::Forbidden("project belongs to another user".into()).into());
    }

    state.quota.admit(&user, QuotaAction::Compile).await?;

    let id_material = serde_json::to_vec(&body.files)
        .map_err(|e| JobError::BadInput(format!("files: {e}")))?;
    let job_id = new_job_id(&user.id, &id_material);
    let seed = vec![LogRecord::info("Compile job queued")];
    let job = state
        .store
        .create(&job_id, JobType::Compile, &user.id, &body.project_id, seed)
        .await?;

    let payload = CompilePayload {
        project_id: body.project_id,
        files: body.files,
        job_id: job_id.clone(),
        user_id: user.id,
    };
    if let Err(e) = state
        .queue
        .enqueue("compile", &job.broker_handle, &payload)
        .await
    {
        let _ = state.store.discard_if_queued(&job_id).await;
        return Err(e.into());
    }

    // Bridge the seed state into local rooms and onto the bus so
    // already-subscribed clients on any replica see the job appear.
    if let Some(seed) = job.logs.first() {
        state.hub.emit_log(&state.bus, &job_id, seed.clone()).await;
    }
    state
        .hub
        .emit_status(&state.bus, &job_id, JobStatus::Queued, None)
        .await;

    tracing::info!(
        job_id = &job_id[..16],
        project_id = %payload.project_id,
        "compile job enqueued"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            success: true,
            job_id,
            logs: job.logs,
        }),
    ))
}

// ── POST /deploy ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DeployBody {
    pub project_id: String,
    pub wasm_base64: String,
    pub network: Network,
    #[serde(default)]
    pub wallet_info: Option<serde_json::Value>,
}

pub async fn handle_deploy(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<DeployBody>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let user = authenticate(&state, &headers).await?;

    if body.project_id.is_empty() {
        return Err(JobError::BadInput("project_id is required".into()).into());
    }
    // Malformed base64 never becomes a job; bad module bytes do, and
    // fail at deploy-side validation.
    if BASE64.decode(&body.wasm_base64).is_err() {
        return Err(JobError::BadInput("wasm_base64 is not valid base64".into()).into());
    }

    state.quota.admit(&user, QuotaAction::Deploy).await?;

    let job_id = new_job_id(&user.id, body.wasm_base64.as_bytes());
    let seed = vec![LogRecord::info("Deploy job queued")];
    let job = state
        .store
        .create(&job_id, JobType::Deploy, &user.id, &body.project_id, seed)
        .await?;

    let payload = DeployPayload {
        project_id: body.project_id,
        wasm_base64: body.wasm_base64,
        network: body.network,
        job_id: job_id.clone(),
        user_id: user.id,
        wallet_info: body.wallet_info,
    };
    if let Err(e) = state
        .queue
        .enqueue("deploy", &job.broker_handle, &payload)
        .await
    {
        let _ = state.store.discard_if_queued(&job_id).await;
        return Err(e.into());
    }

    if let Some(seed) = job.logs.first() {
        state.hub.emit_log(&state.bus, &job_id, seed.clone()).await;
    }
    state
        .hub
        .emit_status(&state.bus, &job_id, JobStatus::Queued, None)
        .await;

    tracing::info!(
        job_id = &job_id[..16],
        network = %payload.network,
        "deploy job enqueued"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            success: true,
            job_id,
            logs: job.logs,
        }),
    ))
}

// ── GET /jobs/{id} and GET /jobs ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct JobResponse {
    pub success: bool,
    pub job: JobJson,
}

#[derive(Serialize)]
pub struct JobJson {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<LogRecord>,
    pub log_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn job_to_json(job: Job) -> JobJson {
    JobJson {
        id: job.id,
        job_type: job.job_type,
        status: job.status,
        project: job.project_id,
        result: job.result,
        error: job.error,
        logs: job.logs,
        log_count: job.log_count,
        created_at: job.created_at,
        updated_at: job.updated_at,
    }
}

pub async fn handle_get_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let job = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| JobError::NotFound(format!("job {id}")))?;
    // Authorization is by owner match; strangers see the same 404 as a
    // missing id.
    if job.owner_id != user.id {
        return Err(JobError::NotFound(format!("job {id}")).into());
    }
    Ok(Json(JobResponse {
        success: true,
        job: job_to_json(job),
    }))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub project_id: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Serialize)]
pub struct JobListResponse {
    pub success: bool,
    pub jobs: Vec<JobJson>,
}

pub async fn handle_list_jobs(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;

    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(
            crucible_services::job_store::status_from_str(s)
                .ok_or_else(|| JobError::BadInput(format!("unknown status '{s}'")))?,
        ),
    };
    let job_type = match query.job_type.as_deref() {
        None => None,
        Some(s) => Some(
            crucible_services::job_store::type_from_str(s)
                .ok_or_else(|| JobError::BadInput(format!("unknown type '{s}'")))?,
        ),
    };

    let jobs = state
        .store
        .list(
            &user.id,
            ListFilter {
                project_id: query.project_id,
                status,
                job_type,
                limit: query.limit,
            },
        )
        .await?;
    Ok(Json(JobListResponse {
        success: true,
        jobs: jobs.into_iter().map(job_to_json).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_body_parses_wire_shape() {
        let body: DeployBody = serde_json::from_str(
            r#"{"project_id":"p1","wasm_base64":"AGFzbQEAAAA=","network":"testnet"}"#,
        )
        .unwrap();
        assert_eq!(body.network, Network::Testnet);
        assert!(body.wallet_info.is_none());

        assert!(
            serde_json::from_str::<DeployBody>(
                r#"{"project_id":"p1","wasm_base64":"x","network":"devnet"}"#
            )
            .is_err()
        );
    }

    #[test]
    fn job_json_uses_wire_field_names() {
        let job = Job {
            id: "j1".into(),
            job_type: JobType::Compile,
            status: JobStatus::Queued,
            owner_id: "u1".into(),
            project_id: "p1".into(),
            broker_handle: "compile-j1".into(),
            result: None,
            error: None,
            logs: vec![],
            log_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(job_to_json(job)).unwrap();
        assert_eq!(json["type"], "compile");
        assert_eq!(json["project"], "p1");
        assert_eq!(json["status"], "queued");
        // Owner and broker handle stay internal.
        assert!(json.get("owner_id").is_none());
        assert!(json.get("broker_handle").is_none());
    }
}
