use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{CommandExecutionError, CommandLine, CommandOutcome, CommandRunner};
use crate::mirror::{MirrorKind, MirrorTarget};

/// Builds credential-bearing clone URLs for a git host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRemote {
    base_url: String,
}

impl GitRemote {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `https://<token>@host/<full_name>.git`
    ///
    /// The token is only embedded for http(s) remotes; other schemes (used
    /// for local fixtures) are returned as-is.
    pub fn clone_url(&self, full_name: &str, token: &str) -> String {
        let base = if token.is_empty() {
            self.base_url.clone()
        } else if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("https://{}@{}", token, rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("http://{}@{}", token, rest)
        } else {
            self.base_url.clone()
        };

        format!("{}/{}.git", base, full_name)
    }
}

impl Default for GitRemote {
    fn default() -> Self {
        Self::new("https://github.com")
    }
}

/// `git clone <url> <dest>`
pub fn clone_command(url: &str, dest: &Path, token: &str) -> CommandLine {
    CommandLine::new("git")
        .arg("clone")
        .arg(url)
        .arg(dest.to_string_lossy())
        .secret(token)
}

/// `git fetch --all`
pub fn fetch_all_command() -> CommandLine {
    CommandLine::new("git").args(["fetch", "--all"])
}

/// `git pull --all`
pub fn pull_all_command() -> CommandLine {
    CommandLine::new("git").args(["pull", "--all"])
}

/// Decides whether a failed update should be answered with a fresh clone
pub trait RecoveryPolicy: Send + Sync {
    fn should_recover_by_reclone(&self, failure: &CommandExecutionError) -> bool;
}

/// Default policy: any update failure means the mirror is discarded
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReclone;

impl RecoveryPolicy for AlwaysReclone {
    fn should_recover_by_reclone(&self, _failure: &CommandExecutionError) -> bool {
        true
    }
}

/// How a target ended up in a valid state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// No usable mirror existed; cloned from scratch
    Cloned,
    /// Existing mirror fetched and pulled
    Updated,
    /// Update failed; the mirror was deleted and cloned again
    Recloned,
}

/// Successful sync of one target
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub target: MirrorTarget,
    pub kind: SyncKind,
    /// Every command run for this target, failed update attempts included
    pub outcomes: Vec<CommandOutcome>,
}

/// Root cause of a failed sync
#[derive(Debug, Error)]
pub enum SyncFailure {
    #[error(transparent)]
    Command(#[from] CommandExecutionError),

    #[error("failed to {action} {}: {source}", .path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sync task ended before completing")]
    Aborted,
}

/// A target could not be brought to a valid state, even after recovery
#[derive(Debug, Error)]
#[error("failed to mirror {full_name} into {}: {cause}", .local_path.display())]
pub struct SyncError {
    pub full_name: String,
    pub local_path: PathBuf,
    pub kind: MirrorKind,
    /// Commands that ran before giving up
    pub outcomes: Vec<CommandOutcome>,
    #[source]
    pub cause: SyncFailure,
}

impl SyncError {
    fn new(target: &MirrorTarget, cause: SyncFailure, outcomes: Vec<CommandOutcome>) -> Self {
        Self {
            full_name: target.remote_full_name(),
            local_path: target.local_path.clone(),
            kind: target.kind,
            outcomes,
            cause,
        }
    }

    /// Failure for a unit that never reported back (panicked or cancelled)
    pub fn aborted(target: &MirrorTarget) -> Self {
        Self::new(target, SyncFailure::Aborted, Vec::new())
    }
}

/// Clone-or-update strategy with re-clone recovery
#[derive(Clone)]
pub struct MirrorSync {
    runner: Arc<dyn CommandRunner>,
    remote: GitRemote,
    policy: Arc<dyn RecoveryPolicy>,
}

impl MirrorSync {
    pub fn new(runner: Arc<dyn CommandRunner>, remote: GitRemote) -> Self {
        Self {
            runner,
            remote,
            policy: Arc::new(AlwaysReclone),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn RecoveryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Bring `target` up to date.
    ///
    /// A valid mirror is fetched and pulled; anything else is cloned. When the
    /// update fails the mirror is removed and cloned once more. A failed clone
    /// leaves nothing behind at `target.local_path`.
    pub async fn sync(&self, target: &MirrorTarget, token: &str) -> Result<SyncReport, SyncError> {
        let mut outcomes = Vec::new();

        let kind = if target.is_valid_mirror().await {
            info!("Updating {} at {}", target.remote_full_name(), target.local_path.display());

            match self.update(target, &mut outcomes).await {
                Ok(()) => SyncKind::Updated,
                Err(failure) => {
                    if !self.policy.should_recover_by_reclone(&failure) {
                        return Err(SyncError::new(target, failure.into(), outcomes));
                    }

                    warn!(
                        "Update of {} failed ({}), re-cloning",
                        target.remote_full_name(),
                        failure.exit
                    );

                    if let Err(e) = discard(&target.local_path).await {
                        warn!(
                            "Could not remove broken mirror {}: {}",
                            target.local_path.display(),
                            e
                        );
                        return Err(SyncError::new(target, failure.into(), outcomes));
                    }

                    if let Err(cause) = self.clone_fresh(target, token, &mut outcomes).await {
                        return Err(SyncError::new(target, cause, outcomes));
                    }
                    SyncKind::Recloned
                }
            }
        } else {
            if let Err(cause) = self.clone_fresh(target, token, &mut outcomes).await {
                return Err(SyncError::new(target, cause, outcomes));
            }
            SyncKind::Cloned
        };

        Ok(SyncReport {
            target: target.clone(),
            kind,
            outcomes,
        })
    }

    async fn update(
        &self,
        target: &MirrorTarget,
        outcomes: &mut Vec<CommandOutcome>,
    ) -> Result<(), CommandExecutionError> {
        self.run_step(&fetch_all_command(), &target.local_path, outcomes)
            .await?;
        self.run_step(&pull_all_command(), &target.local_path, outcomes)
            .await?;
        Ok(())
    }

    async fn clone_fresh(
        &self,
        target: &MirrorTarget,
        token: &str,
        outcomes: &mut Vec<CommandOutcome>,
    ) -> Result<(), SyncFailure> {
        let path = &target.local_path;

        // Leftovers from an interrupted run would make `git clone` refuse the path
        discard(path).await.map_err(|source| SyncFailure::Filesystem {
            action: "remove stale directory",
            path: path.clone(),
            source,
        })?;

        let result = self.clone_steps(target, token, outcomes).await;
        if result.is_err() {
            if let Err(e) = discard(path).await {
                warn!("Could not clean up partial clone {}: {}", path.display(), e);
            }
        }
        result
    }

    async fn clone_steps(
        &self,
        target: &MirrorTarget,
        token: &str,
        outcomes: &mut Vec<CommandOutcome>,
    ) -> Result<(), SyncFailure> {
        let path = &target.local_path;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| SyncFailure::Filesystem {
                action: "create parent directory",
                path: parent.to_path_buf(),
                source,
            })?;

        info!("Cloning {} into {}", target.remote_full_name(), path.display());

        let url = self.remote.clone_url(&target.remote_full_name(), token);
        self.run_step(&clone_command(&url, path, token), parent, outcomes)
            .await?;
        self.run_step(&fetch_all_command(), path, outcomes).await?;
        self.run_step(&pull_all_command(), path, outcomes).await?;
        Ok(())
    }

    async fn run_step(
        &self,
        command: &CommandLine,
        working_dir: &Path,
        outcomes: &mut Vec<CommandOutcome>,
    ) -> Result<(), CommandExecutionError> {
        match self.runner.run(command, working_dir).await {
            Ok(outcome) => {
                debug!("{}", outcome);
                outcomes.push(outcome);
                Ok(())
            }
            Err(e) => {
                debug!("{}", e.to_outcome());
                outcomes.push(e.to_outcome());
                Err(e)
            }
        }
    }
}

/// Remove whatever sits at `path`; a missing path is fine
async fn discard(path: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
