//! Worker executor: one prompt in, one subprocess run, raw text out.
//!
//! Each call is a single attempt. Retry policy lives in the coordinator, so
//! errors are classified here ([`ExecutorError::is_retryable`]) but never
//! retried.

use crate::config::ExecutorConfig;
use crate::{clog_debug, clog_trace, clog_warn};
use regex::Regex;
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Why an executor call did not produce output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    /// The agent exited cleanly but reported an error in its envelope.
    #[error("agent reported an error: {0}")]
    Reported(String),

    #[error("failed to start: {0}")]
    Spawn(String),

    #[error("cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Whether the coordinator may try the same task again. Timeouts, rate
    /// limits and spawn failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::NonZeroExit { .. } | ExecutorError::Reported(_)
        )
    }
}

/// Runs prompts for workers.
pub trait WorkerExecutor: Send + Sync + 'static {
    /// Execute `prompt` once, giving up after `timeout` or when `cancel` fires.
    fn execute(
        &self,
        prompt: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<String, ExecutorError>> + Send;
}

fn rate_limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(rate[ _-]?limit|too many requests|usage limit|quota exceeded|\b429\b)")
            .unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Whether executor output carries a rate-limit signal.
pub fn is_rate_limited(text: &str) -> bool {
    rate_limit_pattern().is_match(text)
}

/// Envelope written by agents run with JSON output.
#[derive(Debug, Deserialize)]
struct AgentEnvelope {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    error: Option<String>,
}

/// Unwrap a JSON agent envelope to its text, or pass plain output through.
pub fn parse_agent_output(stdout: &str) -> Result<String, ExecutorError> {
    let trimmed = stdout.trim();
    let Ok(envelope) = serde_json::from_str::<AgentEnvelope>(trimmed) else {
        return Ok(trimmed.to_string());
    };
    let failed = envelope.is_error || envelope.subtype.as_deref().is_some_and(|s| s.starts_with("error"));
    if failed {
        let message = envelope
            .error
            .or(envelope.result)
            .or(envelope.subtype)
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(if is_rate_limited(&message) {
            ExecutorError::RateLimited(message)
        } else {
            ExecutorError::Reported(message)
        });
    }
    match envelope.result {
        Some(text) => Ok(text),
        None => Ok(trimmed.to_string()),
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        clog_warn!("Executor: reading child output failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs a configured command with the prompt appended as its last argument.
///
/// # Example
///
/// ```ignore
/// use concord::config::ExecutorConfig;
/// use concord::orchestration::{CommandExecutor, WorkerExecutor};
/// use tokio_util::sync::CancellationToken;
///
/// let executor = CommandExecutor::from_config(&ExecutorConfig::default())?;
/// let text = executor
///     .execute("Summarize src/", executor.timeout(), CancellationToken::new())
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    grace: Duration,
    cwd: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            program,
            args,
            timeout: defaults.timeout(),
            grace: defaults.grace(),
            cwd: None,
        }
    }

    /// Build from config, resolving the program on `PATH`.
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let mut words = config.command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| ExecutorError::Spawn("executor command is empty".to_string()))?;
        let resolved = which::which(program)
            .map_err(|e| ExecutorError::Spawn(format!("{} not found: {}", program, e)))?;
        Ok(Self::new(resolved, words.map(str::to_string).collect())
            .with_timeout(config.timeout())
            .with_grace(config.grace()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// SIGTERM, wait out the grace period, then kill.
    async fn terminate(&self, child: &mut Child) {
        let signalled = match child.id() {
            Some(pid) => match send_sigterm(pid) {
                Ok(()) => true,
                Err(e) => {
                    clog_warn!("Executor: SIGTERM to {} failed: {}, killing", pid, e);
                    false
                }
            },
            None => false,
        };
        if signalled {
            if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
                return;
            }
            clog_warn!(
                "Executor: child ignored SIGTERM for {:?}, killing",
                self.grace
            );
        }
        if let Err(e) = child.kill().await {
            clog_warn!("Executor: kill failed: {}", e);
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("pid {} out of range", pid))
    })?;
    // SAFETY: kill(2) takes no pointers; it only signals `pid`.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "SIGTERM is only available on unix",
    ))
}

impl WorkerExecutor for CommandExecutor {
    async fn execute(
        &self,
        prompt: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<String, ExecutorError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        let mut child = command
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{}: {}", self.program.display(), e)))?;
        clog_debug!(
            "Executor: spawned {} (pid {:?}, timeout {:?})",
            self.program.display(),
            child.id(),
            timeout
        );

        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let status = match outcome {
            Outcome::Exited(status) => status.map_err(|e| ExecutorError::Spawn(e.to_string()))?,
            Outcome::TimedOut => {
                self.terminate(&mut child).await;
                return Err(ExecutorError::Timeout(timeout));
            }
            Outcome::Cancelled => {
                self.terminate(&mut child).await;
                return Err(ExecutorError::Cancelled);
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();
        clog_trace!("Executor: stdout {} bytes, stderr {} bytes", stdout.len(), stderr.len());

        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            if is_rate_limited(&detail) {
                return Err(ExecutorError::RateLimited(detail));
            }
            return Err(ExecutorError::NonZeroExit {
                code: status.code(),
                stderr: detail,
            });
        }
        parse_agent_output(&stdout)
    }
}

type Responder = dyn Fn(&str) -> Result<String, ExecutorError> + Send + Sync;

/// In-process executor answering from a closure. Used for dry runs and tests.
#[derive(Clone)]
pub struct MockExecutor {
    responder: Arc<Responder>,
    delay: Duration,
    calls: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for MockExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockExecutor")
            .field("delay", &self.delay)
            .field("calls", &self.call_count())
            .finish()
    }
}

impl MockExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, ExecutorError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always succeed with the same text.
    pub fn replying(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Simulated run time before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Prompts received so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl WorkerExecutor for MockExecutor {
    async fn execute(
        &self,
        prompt: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<String, ExecutorError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        if timeout < self.delay {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => return Err(ExecutorError::Timeout(timeout)),
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
        }
        (self.responder)(prompt)
    }
}
