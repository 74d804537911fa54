//! System health checks for repovault
//!
//! This module provides preflight checks to verify the system is properly
//! configured before running a backup.

use std::path::Path;

use crate::discovery::RepositorySource;
use crate::{Config, GitHubClient};

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Account login/token presence
    pub account: CheckResult,
    /// GitHub API reachability with the configured token
    pub github_api: CheckResult,
    /// Backup directory status
    pub backup_dir: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        Self {
            git: Self::check_git(),
            account: Self::check_account(config),
            github_api: Self::check_github_api(config).await,
            backup_dir: match config.backup_root() {
                Ok(root) => Self::check_backup_dir(&root),
                Err(e) => CheckResult::error_with_details("Cannot resolve backup directory", e.to_string()),
            },
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, result)| result.passed)
    }

    /// Get list of failed checks
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| !r.passed)
            .collect()
    }

    /// Check git installation
    fn check_git() -> CheckResult {
        match std::process::Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// Check the account section
    fn check_account(config: &Config) -> CheckResult {
        if config.account.login.trim().is_empty() {
            return CheckResult::error("account.login is not set");
        }
        if config.account.token.trim().is_empty() {
            return CheckResult::error("account.token is not set");
        }
        CheckResult::ok_with_details("Account configured", format!("Login: {}", config.account.login))
    }

    /// Request a single repository to prove the token works
    async fn check_github_api(config: &Config) -> CheckResult {
        let client = match GitHubClient::new(config) {
            Ok(client) => client,
            Err(e) => return CheckResult::error_with_details("GitHub client setup failed", format!("{:#}", e)),
        };

        match client.fetch_page(&config.account.login, 1, 1).await {
            Ok(_) => CheckResult::ok_with_details("GitHub API reachable", config.github.api_url.clone()),
            Err(e) => CheckResult::error_with_details(
                "GitHub API request failed",
                format!("{}\nCheck account.token and github.api_url", e),
            ),
        }
    }

    /// Check the backup directory exists (or can be created) and is writable
    fn check_backup_dir(root: &Path) -> CheckResult {
        if !root.exists() {
            let existing_parent = root.ancestors().find(|p| p.exists());
            return match existing_parent {
                Some(parent) if !is_read_only(parent) => CheckResult::warning_with_details(
                    "Backup directory will be created on first run",
                    root.display().to_string(),
                ),
                _ => CheckResult::error_with_details(
                    "Backup directory cannot be created",
                    root.display().to_string(),
                ),
            };
        }

        if !root.is_dir() {
            return CheckResult::error_with_details(
                "Backup path is not a directory",
                root.display().to_string(),
            );
        }

        if is_read_only(root) {
            CheckResult::error_with_details("Backup directory is read-only", root.display().to_string())
        } else {
            CheckResult::ok_with_details("Backup directory exists", root.display().to_string())
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Git Installation", &self.git),
            ("Account", &self.account),
            ("GitHub API", &self.github_api),
            ("Backup Directory", &self.backup_dir),
        ]
    }
}

fn is_read_only(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.permissions().readonly())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ok(message: &str) -> CheckResult {
        CheckResult::ok_with_details(message, "details")
    }

    #[test]
    fn test_check_result_constructors() {
        assert!(ok("fine").passed);
        assert!(!CheckResult::error("bad").passed);

        let warning = CheckResult::warning_with_details("meh", "details");
        assert!(warning.passed); // Warnings still "pass"
        assert!(warning.is_warning);
    }

    #[test]
    fn test_git_check() {
        let result = HealthCheck::check_git();
        // Git should be installed in dev environment
        assert!(result.passed);
        assert!(result.details.is_some());
    }

    #[test]
    fn test_check_account() {
        let mut config = Config::default();
        assert!(!HealthCheck::check_account(&config).passed);

        config.account.login = "octocat".to_string();
        assert!(!HealthCheck::check_account(&config).passed);

        config.account.token = "ghp_x".to_string();
        assert!(HealthCheck::check_account(&config).passed);
    }

    #[test]
    fn test_check_backup_dir_existing() {
        let dir = TempDir::new().unwrap();
        let result = HealthCheck::check_backup_dir(dir.path());
        assert!(result.passed);
        assert!(!result.is_warning);
    }

    #[test]
    fn test_check_backup_dir_missing_but_creatable() {
        let dir = TempDir::new().unwrap();
        let result = HealthCheck::check_backup_dir(&dir.path().join("a/b"));
        assert!(result.passed);
        assert!(result.is_warning);
    }

    #[test]
    fn test_check_backup_dir_is_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(!HealthCheck::check_backup_dir(&file).passed);
    }

    #[test]
    fn test_errors_exclude_warnings() {
        let health = HealthCheck {
            git: CheckResult::error("Git missing"),
            account: ok("Account OK"),
            github_api: CheckResult::error("API down"),
            backup_dir: CheckResult::warning_with_details("Will create", "/b"),
        };

        assert!(!health.all_passed());
        assert_eq!(health.errors().len(), 2);
    }

    #[test]
    fn test_warnings_do_not_fail_checks() {
        let health = HealthCheck {
            git: ok("Git OK"),
            account: ok("Account OK"),
            github_api: ok("API OK"),
            backup_dir: CheckResult::warning_with_details("Will create", "/b"),
        };
        assert!(health.all_passed());
    }

    #[test]
    fn test_all_checks_order() {
        let health = HealthCheck {
            git: ok("a"),
            account: ok("b"),
            github_api: ok("c"),
            backup_dir: ok("d"),
        };
        let names: Vec<_> = health.all_checks().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["Git Installation", "Account", "GitHub API", "Backup Directory"]);
    }
}
