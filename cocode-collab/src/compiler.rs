//! Compile-and-run pipeline.
//!
//! ```text
//! scratch dir ──► code_<stem>.cpp ──► compiler (compile timeout) ──► exec_<stem>
//!                 input_<stem>.txt ────────────── stdin ──────────► run (run timeout)
//! ```
//!
//! Each invocation gets its own artifact names (nanosecond timestamp plus
//! a process-wide sequence number), so concurrent runs never collide.
//! Artifacts are removed on every exit path by [`ScratchArtifacts`]'s
//! `Drop`. Failures are folded into a [`CompileResult`] with
//! `success: false`; nothing here can fail a connection.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Notify;

use crate::config::CompilerConfig;

/// How long to wait for pipes to hit EOF after a process was killed.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

static ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Outcome of one compile-and-run request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub success: bool,
    pub message: String,
    /// Program stdout (partial if the run failed or timed out)
    pub output: String,
    /// Failure mode, `None` on success
    pub failure: Option<FailureKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Scratch directory, artifact I/O, or process spawn failed
    Environment,
    /// Compiler exited non-zero
    Compile,
    CompileTimeout,
    /// Program exited non-zero
    Runtime,
    RuntimeTimeout,
    /// Program output passed `max_output_bytes` and it was stopped
    OutputLimit,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot create scratch dir {}: {source}", path.display())]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write {what} file: {source}")]
    Artifact {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("compile failed:\n{0}")]
    CompileFailure(String),
    #[error("compile failed:\ncompile timed out after {}s\n{output}", limit.as_secs())]
    CompileTimeout { limit: Duration, output: String },
    #[error("{compile_message}\nruntime error ({exit}):\n{stderr}")]
    RuntimeFailure {
        compile_message: String,
        exit: String,
        stderr: String,
        stdout: String,
    },
    #[error("{compile_message}\nrun timed out after {}s", limit.as_secs())]
    RuntimeTimeout {
        compile_message: String,
        limit: Duration,
        stdout: String,
    },
    #[error("{compile_message}\nrun stopped: output exceeded {cap} bytes (truncated)")]
    OutputLimit {
        compile_message: String,
        cap: usize,
        stdout: String,
    },
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ScratchDir { .. } | Self::Artifact { .. } | Self::Spawn { .. } => {
                FailureKind::Environment
            }
            Self::CompileFailure(_) => FailureKind::Compile,
            Self::CompileTimeout { .. } => FailureKind::CompileTimeout,
            Self::RuntimeFailure { .. } => FailureKind::Runtime,
            Self::RuntimeTimeout { .. } => FailureKind::RuntimeTimeout,
            Self::OutputLimit { .. } => FailureKind::OutputLimit,
        }
    }
}

impl From<PipelineError> for CompileResult {
    fn from(err: PipelineError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        let output = match err {
            PipelineError::RuntimeFailure { stdout, .. }
            | PipelineError::RuntimeTimeout { stdout, .. }
            | PipelineError::OutputLimit { stdout, .. } => stdout,
            _ => String::new(),
        };
        Self {
            success: false,
            message,
            output,
            failure: Some(kind),
        }
    }
}

/// Files owned by one invocation. Dropping this removes them.
#[derive(Debug)]
struct ScratchArtifacts {
    source: PathBuf,
    input: PathBuf,
    executable: PathBuf,
}

impl ScratchArtifacts {
    fn new(dir: &Path) -> Self {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let stem = format!("{nanos}_{seq}");
        Self {
            source: dir.join(format!("code_{stem}.cpp")),
            input: dir.join(format!("input_{stem}.txt")),
            executable: dir.join(format!("exec_{stem}")),
        }
    }
}

impl Drop for ScratchArtifacts {
    fn drop(&mut self) {
        for path in [&self.source, &self.input, &self.executable] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {}: {e}", path.display()),
            }
        }
    }
}

/// Why a bounded subprocess stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Exited(ExitStatus),
    /// Killed at the deadline
    TimedOut,
    /// Killed after stdout or stderr passed the byte cap
    OutputLimit,
}

/// One captured pipe, at most `cap` bytes of it.
#[derive(Debug, Default)]
struct Captured {
    text: String,
    truncated: bool,
}

/// Captured output of a bounded subprocess.
struct BoundedOutput {
    termination: Termination,
    stdout: String,
    stderr: String,
}

/// Compiles and runs submitted programs. Stateless and reentrant.
#[derive(Debug, Clone)]
pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile `code`, run it with `stdin`, and report the outcome.
    pub async fn compile_and_run(&self, code: &str, stdin: &str) -> CompileResult {
        match self.pipeline(code, stdin).await {
            Ok(result) => result,
            Err(err) => {
                log::debug!("Pipeline failed ({:?}): {err}", err.kind());
                err.into()
            }
        }
    }

    async fn pipeline(&self, code: &str, stdin: &str) -> Result<CompileResult, PipelineError> {
        let dir = &self.config.scratch_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| PipelineError::ScratchDir {
                path: dir.clone(),
                source,
            })?;

        let artifacts = ScratchArtifacts::new(dir);
        tokio::fs::write(&artifacts.source, code)
            .await
            .map_err(|source| PipelineError::Artifact {
                what: "source",
                source,
            })?;
        tokio::fs::write(&artifacts.input, stdin)
            .await
            .map_err(|source| PipelineError::Artifact {
                what: "input",
                source,
            })?;

        let compile_message = self.compile(&artifacts).await?;
        self.run(&artifacts, compile_message).await
    }

    async fn compile(&self, artifacts: &ScratchArtifacts) -> Result<String, PipelineError> {
        let mut command = Command::new(&self.config.compiler);
        command
            .args(&self.config.compile_flags)
            .arg(&artifacts.source)
            .arg("-o")
            .arg(&artifacts.executable)
            .stdin(Stdio::null());

        let limit = self.config.compile_timeout();
        let cap = self.config.max_output_bytes;
        let out = run_bounded(command, limit, cap)
            .await
            .map_err(|source| PipelineError::Spawn {
                program: self.config.compiler.clone(),
                source,
            })?;
        let diagnostics = format!("{}{}", out.stdout, out.stderr);

        match out.termination {
            Termination::TimedOut => Err(PipelineError::CompileTimeout {
                limit,
                output: diagnostics,
            }),
            Termination::OutputLimit => Err(PipelineError::CompileFailure(format!(
                "{diagnostics}\n[diagnostics truncated at {cap} bytes]"
            ))),
            Termination::Exited(status) if !status.success() => {
                Err(PipelineError::CompileFailure(diagnostics))
            }
            Termination::Exited(_) => Ok(format!("compile succeeded\n{diagnostics}")),
        }
    }

    async fn run(
        &self,
        artifacts: &ScratchArtifacts,
        compile_message: String,
    ) -> Result<CompileResult, PipelineError> {
        let input = tokio::fs::File::open(&artifacts.input)
            .await
            .map_err(|source| PipelineError::Artifact {
                what: "input",
                source,
            })?
            .into_std()
            .await;

        let mut command = Command::new(&artifacts.executable);
        command.stdin(Stdio::from(input));

        let limit = self.config.run_timeout();
        let cap = self.config.max_output_bytes;
        let out = run_bounded(command, limit, cap)
            .await
            .map_err(|source| PipelineError::Spawn {
                program: artifacts.executable.display().to_string(),
                source,
            })?;

        match out.termination {
            Termination::TimedOut => Err(PipelineError::RuntimeTimeout {
                compile_message,
                limit,
                stdout: out.stdout,
            }),
            Termination::OutputLimit => Err(PipelineError::OutputLimit {
                compile_message,
                cap,
                stdout: out.stdout,
            }),
            Termination::Exited(status) if !status.success() => Err(PipelineError::RuntimeFailure {
                compile_message,
                exit: describe_exit(status),
                stderr: out.stderr,
                stdout: out.stdout,
            }),
            Termination::Exited(_) => Ok(CompileResult {
                success: true,
                message: format!("{compile_message}\nrun succeeded"),
                output: out.stdout,
                failure: None,
            }),
        }
    }
}

/// Spawn `command`, capture at most `cap` bytes of stdout and of stderr,
/// and kill it if it outlives `limit` or writes past the cap.
async fn run_bounded(
    mut command: Command,
    limit: Duration,
    cap: usize,
) -> io::Result<BoundedOutput> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn()?;

    let overflow = Arc::new(Notify::new());
    let stdout_task = tokio::spawn(read_capped(child.stdout.take(), cap, overflow.clone()));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take(), cap, overflow.clone()));

    let mut termination = tokio::select! {
        waited = tokio::time::timeout(limit, child.wait()) => match waited {
            Ok(status) => Termination::Exited(status?),
            Err(_) => Termination::TimedOut,
        },
        _ = overflow.notified() => Termination::OutputLimit,
    };
    if !matches!(termination, Termination::Exited(_)) {
        if let Err(e) = child.kill().await {
            log::warn!("Failed to kill process ({termination:?}): {e}");
        }
    }

    let stdout = collect(stdout_task).await;
    let stderr = collect(stderr_task).await;
    // The process may exit on its own before the overflow is noticed.
    if (stdout.truncated || stderr.truncated) && matches!(termination, Termination::Exited(_)) {
        termination = Termination::OutputLimit;
    }
    Ok(BoundedOutput {
        termination,
        stdout: stdout.text,
        stderr: stderr.text,
    })
}

/// Read until EOF or `cap` bytes. Going past the cap wakes `overflow`.
async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    cap: usize,
    overflow: Arc<Notify>,
) -> Captured {
    let Some(reader) = reader else {
        return Captured::default();
    };
    let mut buf = Vec::new();
    let mut limited = reader.take(cap as u64 + 1);
    // A read error keeps whatever arrived before it.
    let _ = limited.read_to_end(&mut buf).await;

    let truncated = buf.len() > cap;
    if truncated {
        buf.truncate(cap);
        overflow.notify_one();
    }
    Captured {
        text: lossy_within(&buf, cap),
        truncated,
    }
}

/// Lossy UTF-8 decode that never exceeds `cap` bytes.
fn lossy_within(bytes: &[u8], cap: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    while text.len() > cap {
        text.pop();
    }
    text
}

async fn collect(task: tokio::task::JoinHandle<Captured>) -> Captured {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            log::warn!("Output reader task failed: {e}");
            Captured::default()
        }
        Err(_) => {
            log::warn!("Output pipe still open after process exit; discarding");
            Captured::default()
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Stand-in compiler: `sh -c <script> stub <source> -o <exec>`.
    fn stub_config(scratch: &Path, script: &str) -> CompilerConfig {
        CompilerConfig {
            compiler: "sh".to_string(),
            compile_flags: vec!["-c".to_string(), script.to_string(), "stub".to_string()],
            compile_timeout_secs: 5,
            run_timeout_secs: 5,
            scratch_dir: scratch.to_path_buf(),
            max_output_bytes: 64 * 1024,
        }
    }

    /// "Compiles" a shell script by copying it into place.
    const COPY_STUB: &str = r#"cp "$1" "$3" && chmod +x "$3""#;

    fn scratch_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn test_success_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = Compiler::new(stub_config(dir.path(), COPY_STUB));

        let result = compiler.compile_and_run("#!/bin/sh\necho 42\n", "").await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.output, "42\n");
        assert!(result.message.starts_with("compile succeeded"));
        assert!(result.message.ends_with("run succeeded"));
        assert!(result.failure.is_none());
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_stdin_is_fed_from_input() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = Compiler::new(stub_config(dir.path(), COPY_STUB));

        let code = "#!/bin/sh\nread n\necho $((n * n))\n";
        let result = compiler.compile_and_run(code, "7\n").await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.output.trim(), "49");
    }

    #[tokio::test]
    async fn test_compile_failure_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = Compiler::new(stub_config(
            dir.path(),
            "echo 'error: expected ;' >&2; exit 1",
        ));

        let result = compiler.compile_and_run("int main( {", "").await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Compile));
        assert!(result.message.starts_with("compile failed:"));
        assert!(result.message.contains("expected ;"));
        assert!(result.output.is_empty());
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_compile_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stub_config(dir.path(), "exec sleep 30");
        config.compile_timeout_secs = 1;
        let compiler = Compiler::new(config);

        let started = Instant::now();
        let result = compiler.compile_and_run("int main(){}", "").await;
        let elapsed = started.elapsed();

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::CompileTimeout));
        assert!(result.message.contains("timed out"));
        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_runtime_failure_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = Compiler::new(stub_config(dir.path(), COPY_STUB));

        let code = "#!/bin/sh\necho partial\necho boom >&2\nexit 3\n";
        let result = compiler.compile_and_run(code, "").await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Runtime));
        assert_eq!(result.output, "partial\n");
        assert!(result.message.starts_with("compile succeeded"));
        assert!(result.message.contains("exit code 3"));
        assert!(result.message.contains("boom"));
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_run_timeout_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stub_config(dir.path(), COPY_STUB);
        config.run_timeout_secs = 1;
        let compiler = Compiler::new(config);

        let started = Instant::now();
        let code = "#!/bin/sh\necho partial\nexec sleep 30\n";
        let result = compiler.compile_and_run(code, "").await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::RuntimeTimeout));
        assert!(result.message.contains("run timed out"));
        assert_eq!(result.output, "partial\n");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_missing_compiler_is_environment_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stub_config(dir.path(), COPY_STUB);
        config.compiler = "/nonexistent/cc-binary".to_string();
        let compiler = Compiler::new(config);

        let result = compiler.compile_and_run("int main(){}", "").await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Environment));
        assert!(result.message.contains("cannot start"));
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_unusable_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let compiler = Compiler::new(stub_config(&blocker.join("scratch"), COPY_STUB));
        let result = compiler.compile_and_run("int main(){}", "").await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Environment));
        assert!(result.message.starts_with("cannot create scratch dir"));
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = Compiler::new(stub_config(dir.path(), COPY_STUB));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let compiler = compiler.clone();
            tasks.push(tokio::spawn(async move {
                let code = format!("#!/bin/sh\necho {i}\n");
                (i, compiler.compile_and_run(&code, "").await)
            }));
        }
        for task in tasks {
            let (i, result) = task.await.unwrap();
            assert!(result.success, "{}", result.message);
            assert_eq!(result.output.trim(), i.to_string());
        }
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_runaway_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stub_config(dir.path(), COPY_STUB);
        config.max_output_bytes = 4096;
        let compiler = Compiler::new(config);

        let started = Instant::now();
        let result = compiler
            .compile_and_run("#!/bin/sh\nexec yes xxxxxxxxxxxxxxxx\n", "")
            .await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::OutputLimit));
        assert!(result.output.len() <= 4096, "{} bytes", result.output.len());
        assert!(result.output.starts_with("xxxxxxxxxxxxxxxx\n"));
        assert!(result.message.contains("truncated"));
        // Stopped by the cap, well before the 5s run timeout.
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_compiler_diagnostics_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stub_config(dir.path(), "exec yes 'error: nope' >&2");
        config.max_output_bytes = 1024;
        let compiler = Compiler::new(config);

        let result = compiler.compile_and_run("int main(){}", "").await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Compile));
        assert!(result.message.len() < 2048, "{} bytes", result.message.len());
        assert!(result.message.contains("truncated"));
    }

    #[test]
    fn test_lossy_within_respects_cap() {
        // A multi-byte char split by the cap must not push past it.
        let bytes = "aé".as_bytes();
        let text = lossy_within(&bytes[..2], 2);
        assert!(text.len() <= 2);
        assert!(text.starts_with('a'));
    }

    #[test]
    fn test_artifact_names_unique() {
        let dir = Path::new("/tmp/unused");
        let a = ScratchArtifacts::new(dir);
        let b = ScratchArtifacts::new(dir);
        assert_ne!(a.source, b.source);
        assert_ne!(a.executable, b.executable);
        assert!(a.source.to_string_lossy().ends_with(".cpp"));
    }
}
