//! Common test utilities and fixtures for repovault tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use repovault::command::{CommandExecutionError, CommandLine, CommandOutcome, ExitInfo};
use repovault::discovery::InventoryError;
use repovault::{
    BackupEngine, BackupSettings, CommandRunner, GitRemote, InventoryFetcher, MirrorSync,
    RepositoryIdentity, RepositorySource,
};

pub const LOGIN: &str = "octocat";
pub const TOKEN: &str = "ghp_integration_secret";

/// A command the fake git recorded
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub command: String,
    pub working_dir: PathBuf,
}

impl RecordedCall {
    pub fn verb(&self) -> &str {
        self.command.split_whitespace().nth(1).unwrap_or("")
    }
}

#[derive(Debug, Clone)]
struct Rule {
    verb: String,
    needle: String,
    /// Remaining matches before the rule expires; `None` never expires
    remaining: Option<usize>,
}

impl Rule {
    fn matches(&self, command: &CommandLine, working_dir: &Path) -> bool {
        let haystack = format!("{} {}", command, working_dir.display());
        command.verb() == Some(self.verb.as_str()) && haystack.contains(&self.needle)
    }
}

/// Git stand-in that behaves like a cooperative remote.
///
/// A successful `clone` creates `<dest>/.git`. Rules make a verb fail (or
/// panic) whenever the rendered command or working directory contains a
/// needle, so single repositories can be broken in isolation.
#[derive(Default)]
pub struct ScriptedGit {
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<Vec<Rule>>,
    panics: Vec<Rule>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_when(self, verb: &str, needle: &str) -> Self {
        self.push_failure(verb, needle, None)
    }

    /// Fail only the first matching command
    pub fn fail_once_when(self, verb: &str, needle: &str) -> Self {
        self.push_failure(verb, needle, Some(1))
    }

    fn push_failure(self, verb: &str, needle: &str, remaining: Option<usize>) -> Self {
        self.failures.lock().unwrap().push(Rule {
            verb: verb.to_string(),
            needle: needle.to_string(),
            remaining,
        });
        self
    }

    pub fn panic_when(mut self, verb: &str, needle: &str) -> Self {
        self.panics.push(Rule {
            verb: verb.to_string(),
            needle: needle.to_string(),
            remaining: None,
        });
        self
    }

    /// Highest number of commands observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail(&self, command: &CommandLine, working_dir: &Path) -> bool {
        let mut failures = self.failures.lock().unwrap();
        let Some(position) = failures.iter().position(|r| r.matches(command, working_dir)) else {
            return false;
        };
        if let Some(remaining) = failures[position].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                failures.remove(position);
            }
        }
        true
    }

    /// Sleep before every command, to let concurrent units overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn verbs_in(&self, dir: &Path) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.working_dir == dir)
            .map(|c| c.verb().to_string())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedGit {
    async fn run(
        &self,
        command: &CommandLine,
        working_dir: &Path,
    ) -> Result<CommandOutcome, CommandExecutionError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.calls.lock().unwrap().push(RecordedCall {
            command: command.to_string(),
            working_dir: working_dir.to_path_buf(),
        });

        if self.panics.iter().any(|r| r.matches(command, working_dir)) {
            panic!("scripted git crashed on `{}`", command);
        }

        let mut outcome = CommandOutcome {
            command: command.to_string(),
            working_dir: working_dir.to_path_buf(),
            stdout: String::new(),
            stderr: String::new(),
            exit: ExitInfo::Code(0),
        };

        if self.should_fail(command, working_dir) {
            outcome.stderr = "fatal: repository not found".to_string();
            outcome.exit = ExitInfo::Code(128);
            return Err(outcome.into());
        }

        if command.verb() == Some("clone") {
            if let Some(dest) = command.arguments().last() {
                std::fs::create_dir_all(Path::new(dest).join(".git")).unwrap();
            }
            outcome.stderr = format!("Cloning into '{}'...", dest_name(command));
        }

        Ok(outcome)
    }
}

fn dest_name(command: &CommandLine) -> String {
    command
        .arguments()
        .last()
        .and_then(|dest| Path::new(dest).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Fixed repository list served in pages, counting requests
pub struct StaticInventory {
    repositories: Vec<RepositoryIdentity>,
    requests: AtomicUsize,
    fail_on_page: Option<u32>,
}

impl StaticInventory {
    pub fn new(repositories: Vec<RepositoryIdentity>) -> Self {
        Self {
            repositories,
            requests: AtomicUsize::new(0),
            fail_on_page: None,
        }
    }

    pub fn failing_on_page(mut self, page: u32) -> Self {
        self.fail_on_page = Some(page);
        self
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepositorySource for StaticInventory {
    async fn fetch_page(
        &self,
        _owner: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RepositoryIdentity>, InventoryError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if self.fail_on_page == Some(page) {
            return Err(InventoryError::Api {
                page,
                source: "HTTP 502 Bad Gateway".into(),
            });
        }

        let start = (page as usize - 1) * per_page as usize;
        Ok(self
            .repositories
            .iter()
            .skip(start)
            .take(per_page as usize)
            .cloned()
            .collect())
    }

    fn provider_name(&self) -> &'static str {
        "Static"
    }
}

pub fn identity(name: &str, has_wiki: bool) -> RepositoryIdentity {
    RepositoryIdentity::new(LOGIN, name, has_wiki)
}

pub fn settings(backup_root: &Path, max_parallel: usize) -> BackupSettings {
    BackupSettings {
        backup_root: backup_root.to_path_buf(),
        account_login: LOGIN.to_string(),
        token: TOKEN.to_string(),
        max_parallel,
    }
}

/// Engine wired to the fakes, talking to `https://github.com`
pub fn engine(
    backup_root: &Path,
    inventory: Arc<StaticInventory>,
    git: Arc<ScriptedGit>,
    max_parallel: usize,
) -> BackupEngine {
    let fetcher = InventoryFetcher::new(inventory);
    let mirror_sync = MirrorSync::new(git, GitRemote::default());
    BackupEngine::new(settings(backup_root, max_parallel), fetcher, mirror_sync)
}

/// Assertion helper for CLI output
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}

pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create `<remotes>/octocat/<name>.git` with one commit on `main`.
///
/// The commit holds `README.md` and an `ID` file containing `name`.
pub fn bare_remote(remotes: &Path, name: &str) {
    let bare = remotes.join(LOGIN).join(format!("{}.git", name));
    std::fs::create_dir_all(&bare).unwrap();
    git(&bare, &["init", "--bare"]);

    let work = remotes.join(format!("work-{}", name));
    std::fs::create_dir_all(&work).unwrap();
    git(&work, &["init"]);
    std::fs::write(work.join("README.md"), format!("# {}\n", name)).unwrap();
    std::fs::write(work.join("ID"), name).unwrap();
    git(&work, &["add", "README.md", "ID"]);
    git(&work, &["commit", "-m", "Initial commit"]);
    git(&work, &["push", bare.to_str().unwrap(), "HEAD:refs/heads/main"]);
    git(&bare, &["symbolic-ref", "HEAD", "refs/heads/main"]);
}
