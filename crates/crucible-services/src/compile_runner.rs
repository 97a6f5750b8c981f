//! Compile runner — turns a submitted source tree into WASM bytes.
//!
//! Backend selection is a capability probe, not a hierarchy: native
//! toolchain if `cargo` is on PATH, a build container if `docker` is,
//! otherwise a stub that produces a marker artifact so the rest of the
//! pipeline stays exercisable on machines with no toolchain at all.
//!
//! Every job builds inside its own ephemeral directory under the
//! configured work dir; the directory is removed on every exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crucible_core::JobError;
use crucible_core::job::{CompileBackend, LogKind, LogRecord, SourceFile};

/// Log channel handed to runners. Senders never block; a worker-side
/// pump persists and publishes each record in FIFO order.
pub type LogTx = mpsc::UnboundedSender<LogRecord>;

/// Build target used when the project does not pin one itself.
const DEFAULT_WASM_TARGET: &str = "wasm32v1-none";

/// Marker artifact returned by the stub backend: a minimal module with
/// a valid header and one custom section, so deploy-side validation
/// still passes.
pub const STUB_WASM: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // magic + version
    0x00, 0x05, 0x04, b's', b't', b'u', b'b', // custom section "stub"
];

const BUILDER_IMAGE: &str = "crucible-builder:latest";

/// Dockerfile used to build the builder image when it is missing.
const BUILDER_DOCKERFILE: &str = "\
FROM rust:1.84-slim
RUN rustup target add wasm32v1-none wasm32-unknown-unknown
WORKDIR /workspace
CMD [\"sh\", \"-c\", \"cargo build --release --target wasm32v1-none && cp target/wasm32v1-none/release/*.wasm /out/\"]
";

pub struct CompileRequest {
    pub project_id: String,
    pub job_id: String,
    pub files: Vec<SourceFile>,
}

pub struct CompileOutput {
    pub wasm: Bytes,
    pub wasm_filename: String,
    pub backend: CompileBackend,
}

/// Removes the per-job directory on every exit path, panics included.
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

#[derive(Clone)]
pub struct CompileRunner {
    work_dir: PathBuf,
    backend_override: Option<CompileBackend>,
    container_image: String,
}

impl CompileRunner {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            backend_override: None,
            container_image: BUILDER_IMAGE.to_string(),
        }
    }

    /// Pin the backend instead of probing. Used by tests and operators
    /// that want deterministic stub builds.
    pub fn with_backend(mut self, backend: CompileBackend) -> Self {
        self.backend_override = Some(backend);
        self
    }

    pub async fn compile(
        &self,
        req: &CompileRequest,
        log: &LogTx,
    ) -> Result<CompileOutput, JobError> {
        let job_dir = self
            .work_dir
            .join(format!("compile-{}", &req.job_id[..16.min(req.job_id.len())]));
        let _cleanup = DirCleanup(job_dir.clone());

        materialize_tree(&job_dir, &req.files).await?;
        emit(log, LogRecord::info(format!("Materialized {} source files", req.files.len())));

        let backend = match self.backend_override {
            Some(b) => b,
            None => probe_backend().await,
        };

        match backend {
            CompileBackend::Native => self.compile_native(req, &job_dir, log).await,
            CompileBackend::Container => self.compile_container(req, &job_dir, log).await,
            CompileBackend::Stub => compile_stub(req, log),
        }
    }

    // ── Native backend ────────────────────────────────────────────────────────

    async fn compile_native(
        &self,
        req: &CompileRequest,
        job_dir: &Path,
        log: &LogTx,
    ) -> Result<CompileOutput, JobError> {
        let build_root = find_build_root(job_dir)?;
        normalize_package_layout(&build_root).await?;

        let target_dir = build_root.join("target");
        tokio::fs::create_dir_all(target_dir.join(DEFAULT_WASM_TARGET).join("release"))
            .await
            .map_err(|e| JobError::SpawnError(format!("target dir: {e}")))?;

        // A project-supplied .cargo/config.toml selects its own target;
        // passing --target would override it.
        let pins_target = build_root.join(".cargo").join("config.toml").exists()
            || job_dir.join(".cargo").join("config.toml").exists();

        let mut cmd = Command::new("cargo");
        cmd.arg("build").arg("--release");
        if !pins_target {
            cmd.args(["--target", DEFAULT_WASM_TARGET]);
        }
        cmd.current_dir(&build_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        emit(log, LogRecord::info("Starting native build"));
        let (status, stderr_lines) = stream_process(cmd, log).await?;

        if !status.success() {
            return Err(JobError::CompilerFailed(summarize_stderr(&stderr_lines)));
        }

        let artifact = find_wasm_artifact(&target_dir).ok_or(JobError::CompilerDidNotProduceArtifact)?;
        let wasm_filename = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.wasm", req.project_id));
        let wasm = tokio::fs::read(&artifact)
            .await
            .map_err(|e| JobError::CompilerFailed(format!("reading artifact: {e}")))?;

        emit(
            log,
            LogRecord::success(format!("Build completed: {} ({} bytes)", wasm_filename, wasm.len())),
        );
        Ok(CompileOutput {
            wasm: Bytes::from(wasm),
            wasm_filename,
            backend: CompileBackend::Native,
        })
    }

    // ── Container backend ─────────────────────────────────────────────────────

    async fn compile_container(
        &self,
        req: &CompileRequest,
        job_dir: &Path,
        log: &LogTx,
    ) -> Result<CompileOutput, JobError> {
        self.ensure_builder_image(job_dir, log).await?;

        let out_dir = job_dir.join("out");
        let shared_out = self.work_dir.join("out");
        for dir in [&out_dir, &shared_out] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| JobError::SpawnError(format!("output dir: {e}")))?;
        }

        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("-v")
            .arg(format!("{}:/workspace", job_dir.display()))
            .arg("-v")
            .arg(format!("{}:/out", out_dir.display()))
            .arg(&self.container_image)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        emit(log, LogRecord::info("Starting containerized build"));
        let (status, stderr_lines) = stream_container(cmd, log).await?;

        if !status.success() {
            return Err(JobError::CompilerFailed(summarize_stderr(&stderr_lines)));
        }

        // Per-job output first, shared fallback second.
        let artifact = find_wasm_artifact(&out_dir)
            .or_else(|| find_wasm_artifact(&shared_out))
            .ok_or(JobError::CompilerDidNotProduceArtifact)?;
        let wasm_filename = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.wasm", req.project_id));
        let wasm = tokio::fs::read(&artifact)
            .await
            .map_err(|e| JobError::CompilerFailed(format!("reading artifact: {e}")))?;

        emit(
            log,
            LogRecord::success(format!("Build completed: {} ({} bytes)", wasm_filename, wasm.len())),
        );
        Ok(CompileOutput {
            wasm: Bytes::from(wasm),
            wasm_filename,
            backend: CompileBackend::Container,
        })
    }

    async fn ensure_builder_image(&self, job_dir: &Path, log: &LogTx) -> Result<(), JobError> {
        let inspect = Command::new("docker")
            .args(["image", "inspect", &self.container_image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| JobError::SpawnError(format!("docker: {e}")))?;
        if inspect.success() {
            return Ok(());
        }

        emit(log, LogRecord::info(format!("Building builder image {}", self.container_image)));
        let dockerfile = job_dir.join("Dockerfile.builder");
        tokio::fs::write(&dockerfile, BUILDER_DOCKERFILE)
            .await
            .map_err(|e| JobError::SpawnError(format!("dockerfile: {e}")))?;

        let mut cmd = Command::new("docker");
        cmd.arg("build")
            .arg("-t")
            .arg(&self.container_image)
            .arg("-f")
            .arg(&dockerfile)
            .arg(job_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let (status, stderr_lines) = stream_process(cmd, log).await?;
        if !status.success() {
            return Err(JobError::CompilerFailed(format!(
                "builder image build failed: {}",
                summarize_stderr(&stderr_lines)
            )));
        }
        Ok(())
    }
}

// ── Stub backend ──────────────────────────────────────────────────────────────

fn compile_stub(req: &CompileRequest, log: &LogTx) -> Result<CompileOutput, JobError> {
    let has_manifest = req
        .files
        .iter()
        .any(|f| f.name == "Cargo.toml" || f.name.ends_with("/Cargo.toml"));
    if !has_manifest {
        return Err(JobError::CompilerFailed(
            "missing package manifest (Cargo.toml)".into(),
        ));
    }
    let has_source = req.files.iter().any(|f| f.name.ends_with(".rs"));
    if !has_source {
        return Err(JobError::CompilerFailed("missing library source file".into()));
    }

    emit(log, LogRecord::info("Build toolchain unavailable, using stub backend"));
    emit(log, LogRecord::info(format!("Compiling {} v0.1.0", req.project_id)));
    emit(log, LogRecord::info("Finished release [optimized] target(s)"));
    emit(log, LogRecord::success("Build completed (stub artifact)"));

    Ok(CompileOutput {
        wasm: Bytes::from_static(STUB_WASM),
        wasm_filename: format!("{}.wasm", req.project_id),
        backend: CompileBackend::Stub,
    })
}

// ── Shared pieces ─────────────────────────────────────────────────────────────

fn emit(log: &LogTx, record: LogRecord) {
    let _ = log.send(record);
}

async fn probe_backend() -> CompileBackend {
    if probe_tool("cargo").await {
        CompileBackend::Native
    } else if probe_tool("docker").await {
        CompileBackend::Container
    } else {
        CompileBackend::Stub
    }
}

pub(crate) async fn probe_tool(bin: &str) -> bool {
    Command::new(bin)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Write the submitted files under the job directory. Rejects absolute
/// paths and parent traversal.
pub(crate) async fn materialize_tree(dir: &Path, files: &[SourceFile]) -> Result<(), JobError> {
    for file in files {
        let rel = Path::new(&file.name);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(JobError::BadInput(format!("invalid file path '{}'", file.name)));
        }
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JobError::SpawnError(format!("materialize: {e}")))?;
        }
        tokio::fs::write(&path, &file.content)
            .await
            .map_err(|e| JobError::SpawnError(format!("materialize: {e}")))?;
    }
    Ok(())
}

/// Keyword classification of a toolchain output line.
pub fn classify_line(line: &str) -> LogKind {
    let lower = line.to_lowercase();
    if lower.contains("error") || lower.contains("failed") {
        LogKind::Error
    } else if lower.contains("warning") {
        LogKind::Warning
    } else if lower.contains("success") || lower.contains("deployed") {
        LogKind::Success
    } else if lower.contains("compiling")
        || lower.contains("building")
        || lower.contains("finished")
        || lower.contains("downloading")
        || lower.contains("updating")
    {
        LogKind::Info
    } else {
        LogKind::Info
    }
}

/// Locate the package to build: a single package at the top level, or
/// the first package under `contracts/` when the top level declares a
/// workspace.
pub(crate) fn find_build_root(dir: &Path) -> Result<PathBuf, JobError> {
    let manifest = dir.join("Cargo.toml");
    if !manifest.exists() {
        return Err(JobError::CompilerFailed("no Cargo.toml in project root".into()));
    }
    let text = std::fs::read_to_string(&manifest)
        .map_err(|e| JobError::CompilerFailed(format!("reading Cargo.toml: {e}")))?;

    if text.contains("[workspace]") && !text.contains("[package]") {
        let contracts = dir.join("contracts");
        let mut members: Vec<PathBuf> = std::fs::read_dir(&contracts)
            .map_err(|_| JobError::CompilerFailed("workspace has no contracts/ directory".into()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.join("Cargo.toml").exists())
            .collect();
        members.sort();
        return members
            .into_iter()
            .next()
            .ok_or_else(|| JobError::CompilerFailed("no package under contracts/".into()));
    }
    Ok(dir.to_path_buf())
}

/// Make a submitted tree buildable as a library: stray root sources move
/// under `src/`, a lone `main.rs` becomes `lib.rs`, and the manifest
/// gains a `[lib]` path stanza when it has none.
pub(crate) async fn normalize_package_layout(root: &Path) -> Result<(), JobError> {
    let src = root.join("src");
    tokio::fs::create_dir_all(&src)
        .await
        .map_err(|e| JobError::SpawnError(format!("normalize: {e}")))?;

    for name in ["lib.rs", "main.rs"] {
        let stray = root.join(name);
        let target = src.join(name);
        if stray.exists() && !target.exists() {
            tokio::fs::rename(&stray, &target)
                .await
                .map_err(|e| JobError::SpawnError(format!("normalize: {e}")))?;
        }
    }

    let main = src.join("main.rs");
    let lib = src.join("lib.rs");
    if main.exists() && !lib.exists() {
        tokio::fs::rename(&main, &lib)
            .await
            .map_err(|e| JobError::SpawnError(format!("normalize: {e}")))?;
    }

    let manifest = root.join("Cargo.toml");
    if manifest.exists() {
        let text = tokio::fs::read_to_string(&manifest)
            .await
            .map_err(|e| JobError::SpawnError(format!("normalize: {e}")))?;
        if !text.contains("[lib]") {
            let amended = format!("{text}\n[lib]\npath = \"src/lib.rs\"\ncrate-type = [\"cdylib\"]\n");
            tokio::fs::write(&manifest, amended)
                .await
                .map_err(|e| JobError::SpawnError(format!("normalize: {e}")))?;
        }
    }
    Ok(())
}

/// Find the single `.wasm` artifact under a directory, skipping
/// anything inside a `deps/` path.
pub(crate) fn find_wasm_artifact(dir: &Path) -> Option<PathBuf> {
    let mut stack = vec![dir.to_path_buf()];
    let mut found = Vec::new();
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if path.file_name().is_some_and(|n| n == "deps") {
                    continue;
                }
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "wasm") {
                found.push(path);
            }
        }
    }
    found.sort();
    found.into_iter().next()
}

/// Last few error-looking stderr lines, newline-joined, for the
/// terminal error record.
fn summarize_stderr(lines: &[String]) -> String {
    let interesting: Vec<&str> = lines
        .iter()
        .filter(|l| {
            let lower = l.to_lowercase();
            lower.contains("error") || lower.contains("failed")
        })
        .map(|l| l.as_str())
        .collect();
    let picked: Vec<&str> = if interesting.is_empty() {
        lines.iter().rev().take(5).rev().map(|l| l.as_str()).collect()
    } else {
        interesting.into_iter().take(8).collect()
    };
    if picked.is_empty() {
        "toolchain exited nonzero with no output".to_string()
    } else {
        picked.join("\n")
    }
}

/// Spawn the command and stream both stdio pipes line by line into the
/// log channel. Returns the exit status and the captured stderr lines.
async fn stream_process(
    mut cmd: Command,
    log: &LogTx,
) -> Result<(std::process::ExitStatus, Vec<String>), JobError> {
    let mut child = cmd
        .spawn()
        .map_err(|e| JobError::SpawnError(format!("{e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_task = {
        let log = log.clone();
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        let _ = log.send(LogRecord::new(classify_line(&line), line));
                    }
                }
            }
        })
    };
    let err_task = {
        let log = log.clone();
        tokio::spawn(async move {
            let mut captured = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        let _ = log.send(LogRecord::new(classify_line(&line), line.clone()));
                        captured.push(line);
                    }
                }
            }
            captured
        })
    };

    let status = child
        .wait()
        .await
        .map_err(|e| JobError::SpawnError(format!("{e}")))?;
    let _ = out_task.await;
    let stderr_lines = err_task.await.unwrap_or_default();
    Ok((status, stderr_lines))
}

/// Container log line: structured JSON when the builder emits it,
/// keyword classification otherwise.
#[derive(serde::Deserialize)]
struct ContainerLog {
    kind: String,
    message: String,
}

fn parse_container_line(line: &str) -> LogRecord {
    if let Ok(structured) = serde_json::from_str::<ContainerLog>(line) {
        let kind = match structured.kind.as_str() {
            "warning" => LogKind::Warning,
            "error" => LogKind::Error,
            "success" => LogKind::Success,
            "debug" => LogKind::Debug,
            _ => LogKind::Info,
        };
        LogRecord::new(kind, structured.message)
    } else {
        LogRecord::new(classify_line(line), line.to_string())
    }
}

/// Like `stream_process` but stdout lines may be structured JSON
/// records from the builder image.
async fn stream_container(
    mut cmd: Command,
    log: &LogTx,
) -> Result<(std::process::ExitStatus, Vec<String>), JobError> {
    let mut child = cmd
        .spawn()
        .map_err(|e| JobError::SpawnError(format!("{e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_task = {
        let log = log.clone();
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        let _ = log.send(parse_container_line(&line));
                    }
                }
            }
        })
    };
    let err_task = {
        let log = log.clone();
        tokio::spawn(async move {
            let mut captured = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        let _ = log.send(LogRecord::new(classify_line(&line), line.clone()));
                        captured.push(line);
                    }
                }
            }
            captured
        })
    };

    let status = child
        .wait()
        .await
        .map_err(|e| JobError::SpawnError(format!("{e}")))?;
    let _ = out_task.await;
    let stderr_lines = err_task.await.unwrap_or_default();
    Ok((status, stderr_lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(rx: &mut mpsc::UnboundedReceiver<LogRecord>) -> Vec<LogRecord> {
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(record);
        }
        out
    }

    #[test]
    fn classification_follows_keywords() {
        assert_eq!(classify_line("error[E0308]: mismatched types"), LogKind::Error);
        assert_eq!(classify_line("build FAILED"), LogKind::Error);
        assert_eq!(classify_line("warning: unused variable"), LogKind::Warning);
        assert_eq!(classify_line("Compiling contract v0.1.0"), LogKind::Info);
        assert_eq!(classify_line("Finished release [optimized]"), LogKind::Info);
        assert_eq!(classify_line("Build finished successfully"), LogKind::Success);
        assert_eq!(classify_line("some unrelated line"), LogKind::Info);
    }

    #[test]
    fn container_lines_parse_structured_json_first() {
        let rec = parse_container_line(r#"{"kind":"warning","message":"unused import"}"#);
        assert_eq!(rec.kind, LogKind::Warning);
        assert_eq!(rec.message, "unused import");

        let rec = parse_container_line("Compiling foo v0.1.0");
        assert_eq!(rec.kind, LogKind::Info);
    }

    #[tokio::test]
    async fn materialize_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let bad = vec![SourceFile {
            name: "../escape.rs".into(),
            content: String::new(),
        }];
        assert!(matches!(
            materialize_tree(dir.path(), &bad).await,
            Err(JobError::BadInput(_))
        ));

        let abs = vec![SourceFile {
            name: "/etc/passwd".into(),
            content: String::new(),
        }];
        assert!(materialize_tree(dir.path(), &abs).await.is_err());
    }

    #[tokio::test]
    async fn materialize_writes_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            SourceFile {
                name: "Cargo.toml".into(),
                content: "[package]\nname = \"c\"".into(),
            },
            SourceFile {
                name: ".cargo/config.toml".into(),
                content: "[build]\ntarget = \"wasm32-unknown-unknown\"".into(),
            },
            SourceFile {
                name: "src/lib.rs".into(),
                content: "pub fn f() {}".into(),
            },
        ];
        materialize_tree(dir.path(), &files).await.unwrap();
        assert!(dir.path().join(".cargo/config.toml").exists());
        assert!(dir.path().join("src/lib.rs").exists());
    }

    #[test]
    fn build_root_single_package() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"c\"").unwrap();
        assert_eq!(find_build_root(dir.path()).unwrap(), dir.path());
    }

    #[test]
    fn build_root_workspace_picks_first_contract() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[workspace]\nmembers = [\"contracts/*\"]")
            .unwrap();
        for name in ["beta", "alpha"] {
            let pkg = dir.path().join("contracts").join(name);
            std::fs::create_dir_all(&pkg).unwrap();
            std::fs::write(pkg.join("Cargo.toml"), "[package]").unwrap();
        }
        let root = find_build_root(dir.path()).unwrap();
        assert!(root.ends_with("contracts/alpha"));
    }

    #[test]
    fn build_root_missing_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_build_root(dir.path()),
            Err(JobError::CompilerFailed(_))
        ));
    }

    #[tokio::test]
    async fn normalize_moves_and_renames_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"c\"\n").unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();

        normalize_package_layout(dir.path()).await.unwrap();

        assert!(dir.path().join("src/lib.rs").exists());
        assert!(!dir.path().join("src/main.rs").exists());
        assert!(!dir.path().join("main.rs").exists());

        let manifest = std::fs::read_to_string(dir.path().join("Cargo.toml")).unwrap();
        assert!(manifest.contains("[lib]"));
        assert!(manifest.contains("src/lib.rs"));
    }

    #[tokio::test]
    async fn normalize_leaves_explicit_lib_alone() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = "[package]\nname = \"c\"\n[lib]\npath = \"src/contract.rs\"\n";
        std::fs::write(dir.path().join("Cargo.toml"), manifest).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/contract.rs"), "").unwrap();

        normalize_package_layout(dir.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Cargo.toml")).unwrap(),
            manifest
        );
    }

    #[test]
    fn artifact_scan_skips_deps() {
        let dir = tempfile::tempdir().unwrap();
        let release = dir.path().join("wasm32v1-none/release");
        std::fs::create_dir_all(release.join("deps")).unwrap();
        std::fs::write(release.join("deps/noise.wasm"), b"x").unwrap();
        std::fs::write(release.join("contract.wasm"), b"y").unwrap();

        let found = find_wasm_artifact(dir.path()).unwrap();
        assert!(found.ends_with("release/contract.wasm"));
    }

    #[test]
    fn artifact_scan_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_wasm_artifact(dir.path()).is_none());
    }

    #[test]
    fn stub_wasm_has_valid_header() {
        assert_eq!(&STUB_WASM[0..4], &[0x00, 0x61, 0x73, 0x6d]);
        assert_eq!(&STUB_WASM[4..8], &[0x01, 0x00, 0x00, 0x00]);
        assert!(STUB_WASM.len() >= 8);
    }

    #[tokio::test]
    async fn stub_backend_compiles_minimal_project() {
        let work = tempfile::tempdir().unwrap();
        let runner =
            CompileRunner::new(work.path().to_path_buf()).with_backend(CompileBackend::Stub);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let req = CompileRequest {
            project_id: "hello".into(),
            job_id: "a".repeat(64),
            files: vec![
                SourceFile {
                    name: "Cargo.toml".into(),
                    content: "[package]\nname = \"hello\"".into(),
                },
                SourceFile {
                    name: "lib.rs".into(),
                    content: "pub fn hi() {}".into(),
                },
            ],
        };
        let out = runner.compile(&req, &tx).await.unwrap();
        assert_eq!(out.backend, CompileBackend::Stub);
        assert_eq!(out.wasm.as_ref(), STUB_WASM);
        assert_eq!(out.wasm_filename, "hello.wasm");

        let logs = collect(&mut rx);
        assert!(logs.iter().any(|l| l.kind == LogKind::Success));

        // Ephemeral dir is gone.
        assert!(!work.path().join(format!("compile-{}", "a".repeat(16))).exists());
    }

    #[tokio::test]
    async fn stub_backend_requires_manifest_and_source() {
        let work = tempfile::tempdir().unwrap();
        let runner =
            CompileRunner::new(work.path().to_path_buf()).with_backend(CompileBackend::Stub);
        let (tx, _rx) = mpsc::unbounded_channel();

        let req = CompileRequest {
            project_id: "empty".into(),
            job_id: "b".repeat(64),
            files: vec![SourceFile {
                name: "lib.rs".into(),
                content: String::new(),
            }],
        };
        assert!(matches!(
            runner.compile(&req, &tx).await,
            Err(JobError::CompilerFailed(_))
        ));
    }
}
