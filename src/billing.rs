/// Billing tool invocation: validate the tool path, run it over a time window,
/// capture stdout, stderr and the exit code.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Inclusive query window in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn span_secs(&self) -> i64 {
        self.end - self.start
    }
}

/// Captured result of one billing tool run.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

/// Which part of the error taxonomy a [`BillingError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The tool is not usable; nothing was run.
    Configuration,
    /// The tool ran and failed, or overran its deadline.
    Query,
    /// Anything else (spawn or pipe errors).
    Unexpected,
}

/// Errors from locating or running the billing tool.
#[derive(Debug)]
pub enum BillingError {
    /// No file at the configured path.
    ToolMissing { path: PathBuf },
    /// Path exists but is not an executable regular file.
    NotExecutable { path: PathBuf },
    /// Failed to spawn the tool.
    Spawn { source: std::io::Error },
    /// Failed to read the tool's output or wait for it.
    Io { source: std::io::Error },
    /// The tool did not finish before the deadline and was killed.
    TimedOut { after: Duration },
    /// The tool exited unsuccessfully.
    Failed { output: QueryOutput },
}

impl BillingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BillingError::ToolMissing { .. } | BillingError::NotExecutable { .. } => {
                FailureKind::Configuration
            }
            BillingError::TimedOut { .. } | BillingError::Failed { .. } => FailureKind::Query,
            BillingError::Spawn { .. } | BillingError::Io { .. } => FailureKind::Unexpected,
        }
    }
}

impl std::fmt::Display for BillingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BillingError::ToolMissing { path } => {
                write!(f, "billing tool not found: {}", path.display())
            }
            BillingError::NotExecutable { path } => {
                write!(f, "billing tool is not executable: {}", path.display())
            }
            BillingError::Spawn { source } => {
                write!(f, "failed to spawn billing tool: {}", source)
            }
            BillingError::Io { source } => {
                write!(f, "I/O error during billing query: {}", source)
            }
            BillingError::TimedOut { after } => {
                write!(f, "billing tool timed out after {}s", after.as_secs())
            }
            BillingError::Failed { output } => match output.exit_code {
                Some(code) => write!(f, "billing tool failed (exit code: {code})"),
                None => write!(f, "billing tool was terminated by a signal"),
            },
        }
    }
}

impl std::error::Error for BillingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BillingError::Spawn { source } => Some(source),
            BillingError::Io { source } => Some(source),
            _ => None,
        }
    }
}

/// A validated billing tool executable.
#[derive(Debug, Clone)]
pub struct BillingTool {
    path: PathBuf,
}

impl BillingTool {
    /// Check that `path` is an existing executable file.
    pub fn locate(path: &Path) -> Result<Self, BillingError> {
        let meta = std::fs::metadata(path).map_err(|_| BillingError::ToolMissing {
            path: path.to_path_buf(),
        })?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            return Err(BillingError::NotExecutable {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the tool over `window`, killing it if `deadline` elapses first.
    ///
    /// The tool is spawned in its own process group so a timeout takes down
    /// anything it started as well.
    pub async fn query(
        &self,
        window: TimeWindow,
        deadline: Option<Duration>,
    ) -> Result<QueryOutput, BillingError> {
        let args = build_args(window);
        tracing::info!(
            tool = %self.path.display(),
            args = ?args,
            "spawning billing query"
        );

        let start = Instant::now();
        let mut child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BillingError::Spawn { source: e })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = match deadline {
            Some(limit) => tokio::time::timeout(limit, collect(&mut child, stdout, stderr))
                .await
                .ok(),
            None => Some(collect(&mut child, stdout, stderr).await),
        };

        let Some((stdout, stderr, status)) = finished else {
            let after = start.elapsed();
            tracing::warn!(
                pid = ?pid,
                elapsed_secs = after.as_secs(),
                "billing query timed out, killing"
            );
            if let Some(pid) = pid {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    tracing::debug!(error = %e, "failed to kill billing tool process group");
                }
            }
            let _ = child.wait().await;
            return Err(BillingError::TimedOut { after });
        };

        let status = status.map_err(|e| BillingError::Io { source: e })?;
        let output = QueryOutput {
            stdout: stdout.map_err(|e| BillingError::Io { source: e })?,
            stderr: stderr.map_err(|e| BillingError::Io { source: e })?,
            exit_code: status.code(),
            duration: start.elapsed(),
        };

        tracing::debug!(
            exit_code = ?output.exit_code,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            duration_ms = output.duration.as_millis() as u64,
            "billing query completed"
        );

        if status.success() {
            Ok(output)
        } else {
            Err(BillingError::Failed { output })
        }
    }
}

/// Command-line flags for a query window.
fn build_args(window: TimeWindow) -> Vec<String> {
    vec![
        "--start-time".to_string(),
        window.start.to_string(),
        "--end-time".to_string(),
        window.end.to_string(),
    ]
}

/// Drain both pipes while waiting for exit so a chatty tool cannot block on a full pipe.
async fn collect(
    child: &mut Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> (
    std::io::Result<String>,
    std::io::Result<String>,
    std::io::Result<ExitStatus>,
) {
    tokio::join!(read_stream(stdout), read_stream(stderr), child.wait())
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
