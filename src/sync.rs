//! Backup Engine - Orchestrates concurrent repository mirroring
//!
//! This module drives one backup run: list every repository of the account,
//! then mirror each one (and its wiki, when advertised) with bounded
//! concurrency. Every repository is an isolated unit of work; a failure or
//! even a panic in one unit is recorded against that repository and never
//! stops the others.

use chrono::{DateTime, Utc};
use std::fmt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::command::CommandOutcome;
use crate::config::{mask, Config};
use crate::discovery::{InventoryError, InventoryFetcher};
use crate::git::{MirrorSync, SyncError, SyncKind, SyncReport};
use crate::mirror::{MirrorTarget, RepositoryIdentity};

/// Everything a run needs, passed explicitly rather than read from globals
#[derive(Clone)]
pub struct BackupSettings {
    pub backup_root: PathBuf,
    pub account_login: String,
    pub token: String,
    /// Maximum repositories in flight; 0 means no limit
    pub max_parallel: usize,
}

impl fmt::Debug for BackupSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupSettings")
            .field("backup_root", &self.backup_root)
            .field("account_login", &self.account_login)
            .field("token", &mask(&self.token))
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

impl BackupSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            backup_root: config.backup_root()?,
            account_login: config.account.login.clone(),
            token: config.account.token.clone(),
            max_parallel: config.sync.max_parallel,
        })
    }
}

/// Fatal errors that abort a run before any repository is synced
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("failed to create backup directory {}: {source}", .path.display())]
    BackupRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Result of mirroring a repository's wiki
#[derive(Debug)]
pub enum WikiOutcome {
    /// The remote does not advertise a wiki
    NotAdvertised,
    Synced(SyncReport),
    /// Advertised but could not be mirrored; treated as "no wiki"
    NotFound(SyncError),
    /// Skipped: a repository of the account already mirrors into this path
    Shadowed(PathBuf),
}

/// What happened to one repository during the run
#[derive(Debug)]
pub struct RepositoryReport {
    /// 1-based position in the inventory
    pub index: usize,
    pub identity: RepositoryIdentity,
    pub primary: Result<SyncReport, SyncError>,
    pub wiki: WikiOutcome,
}

impl RepositoryReport {
    pub fn succeeded(&self) -> bool {
        self.primary.is_ok()
    }
}

/// Results from a complete backup run
#[derive(Debug)]
pub struct BackupSummary {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub total_repositories: usize,
    /// Ordered by inventory index
    pub reports: Vec<RepositoryReport>,
}

impl BackupSummary {
    /// True when every primary mirror is valid; wikis never count
    pub fn is_success(&self) -> bool {
        self.reports.iter().all(RepositoryReport::succeeded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RepositoryReport> {
        self.reports.iter().filter(|r| !r.succeeded())
    }

    pub fn count(&self, kind: SyncKind) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(&r.primary, Ok(report) if report.kind == kind))
            .count()
    }

    pub fn wikis_synced(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.wiki, WikiOutcome::Synced(_)))
            .count()
    }
}

/// Planned action for one target in a dry run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMirror {
    pub target: MirrorTarget,
    /// `true` when a valid mirror exists and would be updated
    pub update: bool,
}

/// The engine that orchestrates a backup run
#[derive(Clone)]
pub struct BackupEngine {
    settings: Arc<BackupSettings>,
    fetcher: InventoryFetcher,
    mirror_sync: MirrorSync,
}

impl BackupEngine {
    pub fn new(settings: BackupSettings, fetcher: InventoryFetcher, mirror_sync: MirrorSync) -> Self {
        Self {
            settings: Arc::new(settings),
            fetcher,
            mirror_sync,
        }
    }

    /// Run a complete backup: list repositories and mirror them all
    pub async fn run_backup(&self) -> Result<BackupSummary, BackupError> {
        let started_at = Utc::now();
        let start_time = Instant::now();
        let root = &self.settings.backup_root;

        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| BackupError::BackupRoot {
                path: root.clone(),
                source,
            })?;

        let repositories = self
            .fetcher
            .list_all_repositories(&self.settings.account_login)
            .await?;
        let total = repositories.len();

        info!(
            "{} repositories from the account '{}' were found",
            total, self.settings.account_login
        );

        let reports = self.mirror_all(repositories).await;
        let summary = BackupSummary {
            started_at,
            duration: start_time.elapsed(),
            total_repositories: total,
            reports,
        };

        info!(
            "Backup finished in {:.2}s: {} cloned, {} updated, {} recovered, {} failed, {} wikis",
            summary.duration.as_secs_f64(),
            summary.count(SyncKind::Cloned),
            summary.count(SyncKind::Updated),
            summary.count(SyncKind::Recloned),
            summary.failures().count(),
            summary.wikis_synced()
        );

        Ok(summary)
    }

    /// List repositories and report which would be cloned or updated
    pub async fn plan(&self) -> Result<Vec<PlannedMirror>, BackupError> {
        let repositories = self
            .fetcher
            .list_all_repositories(&self.settings.account_login)
            .await?;
        let root = &self.settings.backup_root;
        let primary_paths = primary_paths(root, &repositories);

        let mut plan = Vec::new();
        for identity in &repositories {
            let mut targets = vec![MirrorTarget::primary(root, identity)];
            let wiki = MirrorTarget::wiki(root, identity);
            if identity.has_wiki && !primary_paths.contains(&wiki.local_path) {
                targets.push(wiki);
            }
            for target in targets {
                let update = target.is_valid_mirror().await;
                plan.push(PlannedMirror { target, update });
            }
        }

        Ok(plan)
    }

    async fn mirror_all(&self, repositories: Vec<RepositoryIdentity>) -> Vec<RepositoryReport> {
        let total = repositories.len();
        let permits = match self.settings.max_parallel {
            0 => Semaphore::MAX_PERMITS,
            n => n,
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let primary_paths = Arc::new(primary_paths(&self.settings.backup_root, &repositories));

        // Dropping the set aborts every unit, killing in-flight git processes
        let mut units = JoinSet::new();
        let mut identities = Vec::with_capacity(total);

        for (offset, identity) in repositories.into_iter().enumerate() {
            let index = offset + 1;
            let engine = self.clone();
            let semaphore = semaphore.clone();
            let primary_paths = primary_paths.clone();
            let unit_identity = identity.clone();
            identities.push(identity);

            units.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                engine
                    .mirror_repository(index, total, unit_identity, &primary_paths)
                    .await
            });
        }

        let mut reports = Vec::with_capacity(total);
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("A backup unit ended abnormally: {}", e),
            }
        }

        // Units that panicked still get a report, attributed by index
        if reports.len() < total {
            let finished: Vec<usize> = reports.iter().map(|r| r.index).collect();
            for (offset, identity) in identities.into_iter().enumerate() {
                let index = offset + 1;
                if !finished.contains(&index) {
                    reports.push(self.crashed_report(index, identity));
                }
            }
        }

        reports.sort_by_key(|r| r.index);
        reports
    }

    async fn mirror_repository(
        &self,
        index: usize,
        total: usize,
        identity: RepositoryIdentity,
        primary_paths: &HashSet<PathBuf>,
    ) -> RepositoryReport {
        let root = &self.settings.backup_root;
        let token = &self.settings.token;

        info!(repo = %identity.full_name, "({}/{}) Backup repo '{}'...", index, total, identity.full_name);

        let primary_target = MirrorTarget::primary(root, &identity);
        let primary = self.mirror_sync.sync(&primary_target, token).await;
        match &primary {
            Ok(report) => print_outcomes(index, &report.outcomes),
            Err(e) => {
                print_outcomes(index, &e.outcomes);
                error!(repo = %identity.full_name, "({}/{}) {}", index, total, e);
            }
        }

        let wiki_target = MirrorTarget::wiki(root, &identity);
        let wiki = if !identity.has_wiki {
            WikiOutcome::NotAdvertised
        } else if primary_paths.contains(&wiki_target.local_path) {
            warn!(
                repo = %identity.full_name,
                "Skipping wiki '{}': {} belongs to another repository",
                identity.wiki_full_name(),
                wiki_target.local_path.display()
            );
            WikiOutcome::Shadowed(wiki_target.local_path)
        } else {
            info!(repo = %identity.full_name, "Try to backup wiki repo '{}'...", identity.wiki_full_name());

            match self.mirror_sync.sync(&wiki_target, token).await {
                Ok(report) => {
                    print_outcomes(index, &report.outcomes);
                    WikiOutcome::Synced(report)
                }
                Err(e) => {
                    info!(repo = %identity.full_name, ">> No wiki found ('{}')", identity.wiki_full_name());
                    WikiOutcome::NotFound(e)
                }
            }
        };

        RepositoryReport {
            index,
            identity,
            primary,
            wiki,
        }
    }

    fn crashed_report(&self, index: usize, identity: RepositoryIdentity) -> RepositoryReport {
        warn!("Backup of {} did not complete", identity.full_name);
        let target = MirrorTarget::primary(&self.settings.backup_root, &identity);
        RepositoryReport {
            index,
            primary: Err(SyncError::aborted(&target)),
            identity,
            wiki: WikiOutcome::NotAdvertised,
        }
    }
}

/// Local paths of every primary mirror in the run; a wiki must never take one
fn primary_paths(root: &Path, repositories: &[RepositoryIdentity]) -> HashSet<PathBuf> {
    repositories
        .iter()
        .map(|identity| MirrorTarget::primary(root, identity).local_path)
        .collect()
}

fn print_outcomes(index: usize, outcomes: &[CommandOutcome]) {
    for outcome in outcomes {
        info!(index, "{}", outcome);
    }
}
