//! Deploy runner — validates WASM bytes and pushes them on-chain
//! through the deploy CLI.
//!
//! The signing identity is a process-wide resource addressed by name at
//! every invocation; concurrent deploys share it because the CLI
//! serializes signing. Each job still owns its own ephemeral directory
//! for the materialized module.

use std::path::PathBuf;
use std::process::Stdio;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;

use crucible_core::JobError;
use crucible_core::config::DeploySettings;
use crucible_core::job::{LogRecord, Network};

use crate::compile_runner::{LogTx, classify_line, probe_tool};

const DEPLOY_CLI: &str = "stellar";

/// WASM magic `\0asm` and version 1, required of any module.
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

static ID_FIELD: Lazy<Regex> = Lazy::new(|| Regex::new(r"id:\s*(C[A-Z0-9]+)").unwrap());
static ID_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r#""id"\s*:\s*"(C[A-Z0-9]+)""#).unwrap());
static WASM_HASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[0-9a-f]{64}\b").unwrap());

pub struct DeployRequest {
    pub project_id: String,
    pub job_id: String,
    pub wasm: Bytes,
    pub network: Network,
    pub wallet_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub contract_id: String,
    pub signer_identity: String,
    pub signer_address: String,
}

/// Summary of a validated module, logged before deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmSummary {
    pub size: usize,
    pub version: u32,
}

#[derive(Clone)]
pub struct DeployRunner {
    work_dir: PathBuf,
    settings: DeploySettings,
    cli: String,
}

impl DeployRunner {
    pub fn new(work_dir: PathBuf, settings: DeploySettings) -> Self {
        Self {
            work_dir,
            settings,
            cli: DEPLOY_CLI.to_string(),
        }
    }

    /// Point at a different CLI binary. Tests use this to substitute a
    /// scripted fake.
    pub fn with_cli(mut self, cli: impl Into<String>) -> Self {
        self.cli = cli.into();
        self
    }

    pub async fn deploy(
        &self,
        req: &DeployRequest,
        log: &LogTx,
    ) -> Result<DeployOutcome, JobError> {
        // 1. Toolchain probe.
        if !probe_tool(&self.cli).await {
            return Err(JobError::ToolchainMissing(self.cli.clone()));
        }

        // 2. WASM validation.
        let summary = validate_wasm(&req.wasm)?;
        emit(
            log,
            LogRecord::info(format!(
                "WASM module valid: magic \\0asm, version {}, {} bytes",
                summary.version, summary.size
            )),
        );

        // 3–4. Signing identity, funded on testnet.
        let identity = self.settings.identity_name.clone();
        let signer_address = self.ensure_identity(&identity, req.network, log).await?;
        if req.network == Network::Testnet {
            self.fund_identity(&identity, log).await;
        }

        // 5. Materialize the module.
        let job_dir = self
            .work_dir
            .join(format!("deploy-{}", &req.job_id[..16.min(req.job_id.len())]));
        let _cleanup = DirCleanup(job_dir.clone());
        tokio::fs::create_dir_all(&job_dir)
            .await
            .map_err(|e| JobError::SpawnError(format!("job dir: {e}")))?;
        let wasm_path = job_dir.join("contract.wasm");
        tokio::fs::write(&wasm_path, &req.wasm)
            .await
            .map_err(|e| JobError::SpawnError(format!("writing wasm: {e}")))?;
        let on_disk = tokio::fs::metadata(&wasm_path)
            .await
            .map_err(|e| JobError::SpawnError(format!("stat wasm: {e}")))?
            .len();
        if on_disk != req.wasm.len() as u64 {
            return Err(JobError::SpawnError(format!(
                "wasm write incomplete: {} of {} bytes",
                on_disk,
                req.wasm.len()
            )));
        }

        // 6. Deploy invocation.
        emit(
            log,
            LogRecord::info(format!("Deploying to {} as {}", req.network, identity)),
        );
        let output = self
            .run_cli(
                &[
                    "contract",
                    "deploy",
                    "--wasm",
                    &wasm_path.to_string_lossy(),
                    "--source-account",
                    &identity,
                    "--network",
                    &req.network.to_string(),
                    "--alias",
                    &req.project_id,
                ],
                Some(log),
            )
            .await?;

        // 7. Contract identifier extraction.
        let contract_id = extract_contract_id(&output).ok_or(JobError::ContractIdNotFound)?;
        emit(log, LogRecord::success(format!("Contract deployed: {contract_id}")));

        Ok(DeployOutcome {
            contract_id,
            signer_identity: identity,
            signer_address,
        })
    }

    /// Upload a module without instantiating it. Returns the on-chain
    /// wasm hash, 64 lowercase hex chars.
    pub async fn upload_wasm(&self, wasm: &Bytes, network: Network) -> Result<String, JobError> {
        if !probe_tool(&self.cli).await {
            return Err(JobError::ToolchainMissing(self.cli.clone()));
        }
        validate_wasm(wasm)?;

        let upload_dir = self.work_dir.join("upload");
        tokio::fs::create_dir_all(&upload_dir)
            .await
            .map_err(|e| JobError::SpawnError(format!("upload dir: {e}")))?;
        let path = upload_dir.join("upload.wasm");
        tokio::fs::write(&path, wasm)
            .await
            .map_err(|e| JobError::SpawnError(format!("writing wasm: {e}")))?;

        let identity = self.settings.identity_name.clone();
        let output = self
            .run_cli(
                &[
                    "contract",
                    "upload",
                    "--wasm",
                    &path.to_string_lossy(),
                    "--source-account",
                    &identity,
                    "--network",
                    &network.to_string(),
                ],
                None,
            )
            .await?;
        let _ = tokio::fs::remove_file(&path).await;

        extract_wasm_hash(&output)
            .ok_or_else(|| JobError::CompilerFailed("upload output had no wasm hash".into()))
    }

    /// Instantiate a previously uploaded module by hash.
    pub async fn deploy_by_hash(
        &self,
        hash: &str,
        alias: &str,
        network: Network,
    ) -> Result<String, JobError> {
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(JobError::BadInput(
                "wasm hash must be 64 lowercase hex chars".into(),
            ));
        }
        if !probe_tool(&self.cli).await {
            return Err(JobError::ToolchainMissing(self.cli.clone()));
        }
        let identity = self.settings.identity_name.clone();
        let output = self
            .run_cli(
                &[
                    "contract",
                    "deploy",
                    "--wasm-hash",
                    hash,
                    "--source-account",
                    &identity,
                    "--network",
                    &network.to_string(),
                    "--alias",
                    alias,
                ],
                None,
            )
            .await?;
        extract_contract_id(&output).ok_or(JobError::ContractIdNotFound)
    }

    /// Make sure the default signing identity exists and return its
    /// address. "already exists" is success.
    async fn ensure_identity(
        &self,
        name: &str,
        network: Network,
        log: &LogTx,
    ) -> Result<String, JobError> {
        if let Ok(address) = self.run_cli(&["keys", "address", name], None).await {
            let address = address.trim().to_string();
            if !address.is_empty() {
                return Ok(address);
            }
        }

        emit(log, LogRecord::info(format!("Creating signing identity {name}")));
        let mut args = vec!["keys", "generate", name, "--network"];
        let network_name = network.to_string();
        args.push(&network_name);
        if network == Network::Testnet {
            args.push("--fund");
        }
        match self.run_cli(&args, Some(log)).await {
            Ok(_) => {}
            Err(JobError::CompilerFailed(out)) if out.contains("already exists") => {
                // Lost a race with a concurrent deploy; the identity is usable.
            }
            Err(e) => return Err(e),
        }

        let address = self.run_cli(&["keys", "address", name], None).await?;
        Ok(address.trim().to_string())
    }

    /// Explicit testnet funding. The account may already be funded, so a
    /// failure is a warning, never fatal.
    async fn fund_identity(&self, name: &str, log: &LogTx) {
        match self
            .run_cli(&["keys", "fund", name, "--network", "testnet"], None)
            .await
        {
            Ok(_) => emit(log, LogRecord::info(format!("Funded {name} on testnet"))),
            Err(e) => emit(
                log,
                LogRecord::warning(format!("Funding {name} failed (may already be funded): {e}")),
            ),
        }
    }

    /// Run the deploy CLI, streaming classified lines into the log when
    /// one is provided. Returns combined stdout+stderr text.
    async fn run_cli(&self, args: &[&str], log: Option<&LogTx>) -> Result<String, JobError> {
        let output = Command::new(&self.cli)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| JobError::SpawnError(format!("{}: {e}", self.cli)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if let Some(log) = log {
            for line in stdout.lines().chain(stderr.lines()) {
                if !line.trim().is_empty() {
                    emit(log, LogRecord::new(classify_line(line), line.to_string()));
                }
            }
        }

        let combined = if stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}\n{stderr}")
        };
        if output.status.success() {
            Ok(combined)
        } else {
            Err(JobError::CompilerFailed(combined.trim().to_string()))
        }
    }
}

fn emit(log: &LogTx, record: LogRecord) {
    let _ = log.send(record);
}

struct DirCleanup(PathBuf);

impl Drop for DirCleanup {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.0) {
                tracing::warn!(dir = %self.0.display(), error = %e, "job dir cleanup failed");
            }
        }
    }
}

// ── Validation and parsing ────────────────────────────────────────────────────

/// Reject anything that is not plausibly a WASM module: length, magic,
/// version, and at least one section id byte (0..=11) early on.
pub fn validate_wasm(bytes: &[u8]) -> Result<WasmSummary, JobError> {
    if bytes.len() < 8 {
        return Err(JobError::InvalidWasm(format!(
            "module too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0..4] != WASM_MAGIC {
        return Err(JobError::InvalidWasm("bad magic, expected \\0asm".into()));
    }
    if bytes[4..8] != WASM_VERSION {
        return Err(JobError::InvalidWasm(format!(
            "unsupported version {:02x}{:02x}{:02x}{:02x}",
            bytes[4], bytes[5], bytes[6], bytes[7]
        )));
    }
    let window = &bytes[8..bytes.len().min(100)];
    if !window.is_empty() && !window.iter().any(|b| *b <= 11) {
        return Err(JobError::InvalidWasm("no section marker in module head".into()));
    }
    Ok(WasmSummary {
        size: bytes.len(),
        version: 1,
    })
}

/// Pull the contract id out of CLI output. Heuristics tried in order,
/// first match wins:
///   1. a whole line that is a `C…` token longer than 50 chars
///   2. a `Contract ID:` line followed by a `C…` token
///   3. `id: C…`
///   4. `"id": "C…"`
pub fn extract_contract_id(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.len() > 50
            && trimmed.starts_with('C')
            && trimmed
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Some(trimmed.to_string());
        }
    }
    for line in output.lines() {
        if let Some(rest) = line.split("Contract ID:").nth(1) {
            let token: String = rest
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
                .collect();
            if token.starts_with('C') && token.len() > 1 {
                return Some(token);
            }
        }
    }
    if let Some(caps) = ID_FIELD.captures(output) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = ID_JSON.captures(output) {
        return Some(caps[1].to_string());
    }
    None
}

/// First 64-char lowercase hex token in upload output.
pub fn extract_wasm_hash(output: &str) -> Option<String> {
    WASM_HASH.find(output).map(|m| m.as_str().to_string())
}
