//! External command execution
//!
//! Every git invocation goes through a [`CommandRunner`]. The production
//! runner spawns a real process with `tokio::process`; tests swap in a fake
//! so the sync strategy can be exercised without a network or a git binary.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as AsyncCommand;
use tokio::task::JoinHandle;
use tracing::debug;

const REDACTED: &str = "***";

/// A program plus arguments, with the secrets that must never be rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    secrets: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secrets: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Register a value that is masked wherever this command is displayed.
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// First argument, e.g. `clone` for `git clone ...`
    pub fn verb(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Replace every registered secret in `text`
    pub fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                rendered.push('"');
                rendered.push_str(arg);
                rendered.push('"');
            } else {
                rendered.push_str(arg);
            }
        }
        f.write_str(&self.redact(&rendered))
    }
}

/// How an external process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitInfo {
    /// The process exited with a status code
    Code(i32),
    /// The process was terminated by a signal
    Terminated,
    /// The runner gave up waiting and killed the process
    TimedOut(Duration),
    /// The process could not be started at all
    SpawnFailed(String),
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        matches!(self, ExitInfo::Code(0))
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitInfo::Code(code) => write!(f, "exit status {}", code),
            ExitInfo::Terminated => write!(f, "terminated by signal"),
            ExitInfo::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
            ExitInfo::SpawnFailed(reason) => write!(f, "failed to start: {}", reason),
        }
    }
}

/// Record of one external command execution, kept for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Rendered command line with secrets masked
    pub command: String,
    pub working_dir: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitInfo,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit.success()
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ">> ({})\n   {}", self.working_dir.display(), self.command)?;
        let stdout = self.stdout.trim_end();
        if !stdout.is_empty() {
            write!(f, "\n   [stdout] {}", stdout)?;
        }
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            write!(f, "\n   [stderr] {}", stderr)?;
        }
        if !self.exit.success() {
            write!(f, "\n   [exit] {}", self.exit)?;
        }
        Ok(())
    }
}

/// An external command did not exit with status zero
#[derive(Debug, Clone, Error)]
#[error("`{command}` failed in {}: {exit}", .working_dir.display())]
pub struct CommandExecutionError {
    pub command: String,
    pub working_dir: PathBuf,
    pub exit: ExitInfo,
    pub stdout: String,
    pub stderr: String,
}

impl CommandExecutionError {
    /// The failed run as a reportable outcome, diagnostics included
    pub fn to_outcome(&self) -> CommandOutcome {
        CommandOutcome {
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            exit: self.exit.clone(),
        }
    }
}

impl From<CommandOutcome> for CommandExecutionError {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            command: outcome.command,
            working_dir: outcome.working_dir,
            exit: outcome.exit,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        }
    }
}

/// Executes a single command in a working directory
///
/// Implementations succeed only on exit status zero. Retrying is the
/// caller's business.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &CommandLine,
        working_dir: &Path,
    ) -> Result<CommandOutcome, CommandExecutionError>;
}

/// Runs commands as child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

/// How long stream readers may keep draining after a timed-out process is
/// killed. Grandchildren (e.g. `git-remote-https`) can hold the pipes open.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

type StreamBuffer = Arc<Mutex<Vec<u8>>>;

/// Copy `reader` into `sink` chunk by chunk so a partial read survives a kill
async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: StreamBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buffer) = sink.lock() {
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

fn spawn_drain<R>(reader: Option<R>) -> (StreamBuffer, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let sink = StreamBuffer::default();
    let handle = match reader {
        Some(reader) => tokio::spawn(drain(reader, sink.clone())),
        None => tokio::spawn(async {}),
    };
    (sink, handle)
}

fn collected(command: &CommandLine, sink: &StreamBuffer) -> String {
    let bytes = sink.lock().map(|b| b.clone()).unwrap_or_default();
    command.redact(&String::from_utf8_lossy(&bytes))
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &CommandLine,
        working_dir: &Path,
    ) -> Result<CommandOutcome, CommandExecutionError> {
        let rendered = command.to_string();
        debug!("Running `{}` in {}", rendered, working_dir.display());

        let mut process = AsyncCommand::new(command.program());
        process
            .args(command.arguments())
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        let mut child = process.spawn().map_err(|e| CommandExecutionError {
            command: rendered.clone(),
            working_dir: working_dir.to_path_buf(),
            exit: ExitInfo::SpawnFailed(e.to_string()),
            stdout: String::new(),
            stderr: String::new(),
        })?;

        let (stdout, mut stdout_reader) = spawn_drain(child.stdout.take());
        let (stderr, mut stderr_reader) = spawn_drain(child.stderr.take());

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Some(status),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        debug!("Failed to kill `{}`: {}", rendered, e);
                    }
                    None
                }
            },
            None => Some(child.wait().await),
        };

        let exit = match status {
            Some(Ok(status)) => {
                let _ = tokio::join!(&mut stdout_reader, &mut stderr_reader);
                match status.code() {
                    Some(code) => ExitInfo::Code(code),
                    None => ExitInfo::Terminated,
                }
            }
            Some(Err(e)) => ExitInfo::SpawnFailed(e.to_string()),
            None => {
                let _ = tokio::time::timeout(
                    DRAIN_GRACE,
                    async { tokio::join!(&mut stdout_reader, &mut stderr_reader) },
                )
                .await;
                ExitInfo::TimedOut(self.timeout.unwrap_or_default())
            }
        };
        stdout_reader.abort();
        stderr_reader.abort();

        let outcome = CommandOutcome {
            command: rendered,
            working_dir: working_dir.to_path_buf(),
            stdout: collected(command, &stdout),
            stderr: collected(command, &stderr),
            exit,
        };

        if outcome.succeeded() {
            Ok(outcome)
        } else {
            Err(outcome.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_display_masks_secrets() {
        let command = CommandLine::new("git")
            .args(["clone", "https://s3cr3t@github.com/octocat/hello.git"])
            .arg("/tmp/backup dir/hello")
            .secret("s3cr3t");

        let rendered = command.to_string();
        assert!(!rendered.contains("s3cr3t"));
        assert_eq!(
            rendered,
            "git clone https://***@github.com/octocat/hello.git \"/tmp/backup dir/hello\""
        );
    }

    #[test]
    fn test_empty_secret_is_ignored() {
        let command = CommandLine::new("git").arg("fetch").secret("");
        assert_eq!(command.redact("fetch origin"), "fetch origin");
        assert_eq!(command.verb(), Some("fetch"));
    }

    #[test]
    fn test_outcome_display_skips_empty_streams() {
        let outcome = CommandOutcome {
            command: "git fetch --all".to_string(),
            working_dir: PathBuf::from("/backups/octocat/hello"),
            stdout: String::new(),
            stderr: "Fetching origin\n".to_string(),
            exit: ExitInfo::Code(0),
        };

        let text = outcome.to_string();
        assert!(text.contains("(/backups/octocat/hello)"));
        assert!(text.contains("[stderr] Fetching origin"));
        assert!(!text.contains("[stdout]"));
        assert!(!text.contains("[exit]"));
    }

    #[test]
    fn test_exit_info_success() {
        assert!(ExitInfo::Code(0).success());
        assert!(!ExitInfo::Code(128).success());
        assert!(!ExitInfo::Terminated.success());
        assert!(!ExitInfo::TimedOut(Duration::from_secs(1)).success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let dir = TempDir::new().unwrap();
        let command = CommandLine::new("sh").args(["-c", "echo hello; echo oops >&2"]);

        let outcome = ProcessRunner::new().run(&command, dir.path()).await.unwrap();

        assert_eq!(outcome.stdout.trim(), "hello");
        assert_eq!(outcome.stderr.trim(), "oops");
        assert_eq!(outcome.working_dir, dir.path());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_reports_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let command = CommandLine::new("sh")
            .args(["-c", "echo token-abc; exit 3"])
            .secret("token-abc");

        let err = ProcessRunner::new().run(&command, dir.path()).await.unwrap_err();

        assert_eq!(err.exit, ExitInfo::Code(3));
        assert_eq!(err.stdout.trim(), "***");
        assert!(!err.command.contains("token-abc"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_times_out() {
        let dir = TempDir::new().unwrap();
        let command = CommandLine::new("sh").args(["-c", "sleep 5"]);
        let runner = ProcessRunner::with_timeout(Some(Duration::from_millis(100)));

        let err = runner.run(&command, dir.path()).await.unwrap_err();

        assert_matches!(err.exit, ExitInfo::TimedOut(_));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_command_keeps_partial_output() {
        let dir = TempDir::new().unwrap();
        let command = CommandLine::new("sh")
            .args(["-c", "echo started; echo s3cr3t-progress >&2; sleep 5"])
            .secret("s3cr3t");
        let runner = ProcessRunner::with_timeout(Some(Duration::from_millis(500)));

        let err = runner.run(&command, dir.path()).await.unwrap_err();

        assert_eq!(err.exit, ExitInfo::TimedOut(Duration::from_millis(500)));
        assert_eq!(err.stdout.trim(), "started");
        assert_eq!(err.stderr.trim(), "***-progress");
    }

    #[tokio::test]
    async fn test_process_runner_missing_program() {
        let dir = TempDir::new().unwrap();
        let command = CommandLine::new("definitely-not-a-real-program-42");

        let err = ProcessRunner::new().run(&command, dir.path()).await.unwrap_err();

        assert_matches!(err.exit, ExitInfo::SpawnFailed(_));
    }
}
