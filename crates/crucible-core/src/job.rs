//! Job model — the central entity of the orchestrator.
//!
//! A `Job` is one unit of work (compile or deploy) with a durable state
//! record. Status is monotone except that an at-least-once redelivery
//! may re-observe `active` before the terminal write lands. The terminal
//! transition is write-once; everything downstream leans on that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// What kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Compile,
    Deploy,
}

impl JobType {
    /// Queue name the job is dispatched on.
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobType::Compile => "compile",
            JobType::Deploy => "deploy",
        }
    }

    /// Broker correlation handle, unique per logical job.
    pub fn broker_handle(&self, job_id: &str) -> String {
        format!("{}-{}", self.queue_name(), job_id)
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal statuses are write-once; a job never leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

// ── Log records ───────────────────────────────────────────────────────────────

/// Severity class of a streamed log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Warning,
    Error,
    Success,
    Debug,
}

/// One entry in a job's append-only log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub kind: LogKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogKind::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogKind::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogKind::Error, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogKind::Success, message)
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogKind::Debug, message)
    }

    /// Key clients use to de-duplicate the snapshot+live overlap at
    /// subscribe time.
    pub fn dedup_key(&self) -> (i64, &str, LogKind) {
        (self.timestamp.timestamp_millis(), &self.message, self.kind)
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Which compile backend produced the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileBackend {
    Native,
    Container,
    Stub,
}

/// Target network for a deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Testnet,
    Mainnet,
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "testnet" => Ok(Network::Testnet),
            "mainnet" => Ok(Network::Mainnet),
            other => Err(format!("unknown network '{other}'")),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Testnet => write!(f, "testnet"),
            Network::Mainnet => write!(f, "mainnet"),
        }
    }
}

/// Payload of a completed compile job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileResult {
    /// Base64 of the raw WASM module.
    pub wasm_base64: String,
    pub wasm_filename: String,
    /// Distinguishes real artifacts from stub output for callers that care.
    pub backend_used: CompileBackend,
}

/// Payload of a completed deploy job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    /// Network-assigned contract address, `C…` base32-uppercase.
    pub contract_id: String,
    pub network: Network,
    pub signer_identity: String,
    pub signer_address: String,
}

/// Type-specific result payload. Field sets are disjoint, so the wire
/// shape stays flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Compile(CompileResult),
    Deploy(DeployResult),
}

// ── The job record ────────────────────────────────────────────────────────────

/// Durable job record as held by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque, stable, client-visible id.
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub owner_id: String,
    pub project_id: String,
    /// Opaque broker correlation id, unique per logical job.
    pub broker_handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    /// Human-readable failure description, present iff `status = failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Truncated tail of the emitted log stream. The full stream lives
    /// only on the bus at event time.
    pub logs: Vec<LogRecord>,
    /// Total records emitted, monotone even as the tail truncates.
    pub log_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Derive a fresh job id from the submitter, wall clock, and payload.
pub fn new_job_id(owner_id: &str, payload: &[u8]) -> String {
    let timestamp = Utc::now().timestamp_millis() as u64;
    let mut h = blake3::Hasher::new();
    h.update(owner_id.as_bytes());
    h.update(&timestamp.to_le_bytes());
    h.update(payload);
    hex::encode(h.finalize().as_bytes())
}

// ── Queue payloads ────────────────────────────────────────────────────────────

/// One source file in a submitted project tree. Content is UTF-8 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

/// Payload carried on the `compile` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilePayload {
    pub project_id: String,
    pub files: Vec<SourceFile>,
    pub job_id: String,
    pub user_id: String,
}

/// Payload carried on the `deploy` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployPayload {
    pub project_id: String,
    pub wasm_base64: String,
    pub network: Network,
    pub job_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_info: Option<serde_json::Value>,
}

// ── Bus events ────────────────────────────────────────────────────────────────

/// Message on `job:log:{id}` — one streamed log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub job_id: String,
    pub log: LogRecord,
}

/// Message on `job:status:{id}` — a status transition, terminal ones
/// carrying the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

/// Bus channel carrying log events for one job.
pub fn log_channel(job_id: &str) -> String {
    format!("job:log:{job_id}")
}

/// Bus channel carrying status events for one job.
pub fn status_channel(job_id: &str) -> String {
    format!("job:status:{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_handle_includes_queue_and_id() {
        assert_eq!(JobType::Compile.broker_handle("abc"), "compile-abc");
        assert_eq!(JobType::Deploy.broker_handle("abc"), "deploy-abc");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn job_ids_differ_per_payload() {
        let a = new_job_id("user-1", b"payload-a");
        let b = new_job_id("user-1", b"payload-b");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&JobType::Deploy).unwrap(),
            "\"deploy\""
        );
    }

    #[test]
    fn result_round_trips_untagged() {
        let compile = JobResult::Compile(CompileResult {
            wasm_base64: "AGFzbQEAAAA=".into(),
            wasm_filename: "contract.wasm".into(),
            backend_used: CompileBackend::Native,
        });
        let json = serde_json::to_value(&compile).unwrap();
        assert_eq!(json["backend_used"], "native");
        let back: JobResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, compile);

        let deploy = JobResult::Deploy(DeployResult {
            contract_id: "C".repeat(56),
            network: Network::Testnet,
            signer_identity: "default".into(),
            signer_address: "GABC".into(),
        });
        let json = serde_json::to_value(&deploy).unwrap();
        assert_eq!(json["network"], "testnet");
        let back: JobResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, deploy);
    }

    #[test]
    fn channels_are_per_job() {
        assert_eq!(log_channel("j1"), "job:log:j1");
        assert_eq!(status_channel("j1"), "job:status:j1");
    }
}
