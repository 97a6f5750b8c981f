//! Job inspection commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct JobListResponse {
    jobs: Vec<JobJson>,
}

#[derive(Deserialize)]
struct JobResponse {
    job: JobJson,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct JobJson {
    id: String,
    #[serde(rename = "type")]
    job_type: String,
    status: String,
    project: String,
    result: Option<serde_json::Value>,
    error: Option<String>,
    logs: Vec<LogJson>,
    log_count: u64,
    created_at: String,
    updated_at: String,
}

#[derive(Deserialize)]
struct LogJson {
    kind: String,
    message: String,
    timestamp: String,
}

pub async fn cmd_jobs(port: u16, token: &str) -> Result<()> {
    let resp: JobListResponse = get_json(&format!("{}/jobs", base_url(port)), token).await?;

    if resp.jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Jobs ({})", resp.jobs.len());
    println!("═══════════════════════════════════════");
    for job in &resp.jobs {
        println!("  ┌─ {}", &job.id[..16.min(job.id.len())]);
        println!("  │  type    : {}", job.job_type);
        println!("  │  status  : {}", job.status);
        println!("  │  project : {}", job.project);
        println!("  └─ updated : {}", job.updated_at);
    }

    Ok(())
}

pub async fn cmd_job(port: u16, token: &str, id: &str) -> Result<()> {
    let resp: JobResponse = get_json(&format!("{}/jobs/{}", base_url(port), id), token).await?;
    let job = &resp.job;

    println!("═══════════════════════════════════════");
    println!("  Job {}", &job.id[..16.min(job.id.len())]);
    println!("═══════════════════════════════════════");
    println!("  Type     : {}", job.job_type);
    println!("  Status   : {}", job.status);
    println!("  Project  : {}", job.project);
    println!("  Created  : {}", job.created_at);
    println!("  Updated  : {}", job.updated_at);
    if let Some(error) = &job.error {
        println!("  Error    : {}", error);
    }
    if let Some(result) = &job.result {
        println!("  Result   : {}", serde_json::to_string_pretty(result)?);
    }

    if job.logs.is_empty() {
        println!("\n  No logs retained.");
    } else {
        println!("\n  Logs ({} of {} emitted):", job.logs.len(), job.log_count);
        for log in &job.logs {
            println!("  [{}] {:<7} {}", log.timestamp, log.kind, log.message);
        }
    }

    Ok(())
}
