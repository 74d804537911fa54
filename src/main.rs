use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repovault::config::LoggingConfig;
use repovault::git::SyncFailure;
use repovault::sync::WikiOutcome;
use repovault::{
    BackupEngine, BackupSettings, BackupSummary, Config, GitHubClient, GitRemote, HealthCheck,
    InventoryFetcher, MirrorSync, ProcessRunner, SyncKind,
};

#[derive(Parser)]
#[command(name = "repovault")]
#[command(about = "Mirror every repository of a GitHub account onto local disk")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone or update every repository (default)
    Backup {
        /// Maximum repositories synced at once (0 = unbounded)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Show what would be cloned or updated without touching anything
        #[arg(long)]
        dry_run: bool,
    },

    /// List the repositories that would be backed up
    List {
        /// Print the inventory as JSON
        #[arg(long)]
        json: bool,
    },

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref());
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_logging(cli.verbose, &logging);

    let config = config?;
    info!("Starting repovault v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Backup {
        max_parallel: None,
        dry_run: false,
    }) {
        Commands::Backup {
            max_parallel,
            dry_run,
        } => cmd_backup(&config, max_parallel, dry_run).await,
        Commands::List { json } => cmd_list(&config, json).await,
        Commands::Doctor => cmd_doctor(&config).await,
    }
}

/// Initialize logging; RUST_LOG wins, then --verbose, then the config level
fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(logging.color)
        .with_target(false);

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "full" {
        registry.with(layer).init();
    } else {
        registry.with(layer.compact()).init();
    }
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
}

fn build_engine(config: &Config, settings: BackupSettings) -> Result<BackupEngine> {
    let source = Arc::new(GitHubClient::new(config)?);
    let fetcher = InventoryFetcher::new(source).with_per_page(config.github.per_page);
    let runner = Arc::new(ProcessRunner::with_timeout(config.command_timeout()));
    let mirror_sync = MirrorSync::new(runner, GitRemote::new(&config.github.git_url));

    Ok(BackupEngine::new(settings, fetcher, mirror_sync))
}

/// Mirror all repositories of the configured account
async fn cmd_backup(config: &Config, max_parallel: Option<usize>, dry_run: bool) -> Result<()> {
    let mut settings = BackupSettings::from_config(config)?;
    if let Some(max_parallel) = max_parallel {
        settings.max_parallel = max_parallel;
    }

    info!("Backup directory: {}", settings.backup_root.display());
    let engine = build_engine(config, settings)?;

    if dry_run {
        let plan = engine.plan().await?;
        println!("🔍 Dry run - {} mirror targets", plan.len());
        for planned in &plan {
            let action = if planned.update { "🔄 update" } else { "📥 clone " };
            println!(
                "   {} {} -> {}",
                action,
                planned.target.remote_full_name(),
                planned.target.local_path.display()
            );
        }
        return Ok(());
    }

    let summary = tokio::select! {
        result = engine.run_backup() => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping in-flight git commands");
            bail!("Backup interrupted");
        }
    };

    print_summary(&summary);

    let failed = summary.failures().count();
    if failed > 0 {
        bail!(
            "{} of {} repositories could not be backed up",
            failed,
            summary.total_repositories
        );
    }

    Ok(())
}

/// List repositories that would be backed up
async fn cmd_list(config: &Config, json: bool) -> Result<()> {
    let source = Arc::new(GitHubClient::new(config)?);
    let fetcher = InventoryFetcher::new(source).with_per_page(config.github.per_page);
    let repositories = fetcher.list_all_repositories(&config.account.login).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&repositories)?);
        return Ok(());
    }

    println!("Repositories ({}):", repositories.len());
    for repo in &repositories {
        if repo.has_wiki {
            println!("  📁 {} (wiki)", repo.full_name);
        } else {
            println!("  📁 {}", repo.full_name);
        }
    }

    Ok(())
}

/// System health check and diagnostics
async fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);

    if !health.all_passed() {
        bail!("{} health checks failed", health.errors().len());
    }
    Ok(())
}

fn print_summary(summary: &BackupSummary) {
    println!();
    println!("🎉 Backup complete ({})", summary.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("   📊 Total repositories: {}", summary.total_repositories);
    println!("   📥 Cloned: {}", summary.count(SyncKind::Cloned));
    println!("   🔄 Updated: {}", summary.count(SyncKind::Updated));
    println!("   🩹 Re-cloned after failed update: {}", summary.count(SyncKind::Recloned));
    println!("   📚 Wikis: {}", summary.wikis_synced());
    println!("   ❌ Failed: {}", summary.failures().count());
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    let missing_wikis = summary
        .reports
        .iter()
        .filter(|r| matches!(r.wiki, WikiOutcome::NotFound(_)))
        .count();
    if missing_wikis > 0 {
        println!("   ℹ️  Advertised wikis not found: {}", missing_wikis);
    }

    for report in &summary.reports {
        if let WikiOutcome::Shadowed(path) = &report.wiki {
            println!(
                "   ⚠️  Wiki of {} skipped: {} holds another repository",
                report.identity.full_name,
                path.display()
            );
        }
    }

    if summary.failures().next().is_some() {
        println!("\n🔍 Failed repositories:");
        for report in summary.failures() {
            if let Err(e) = &report.primary {
                println!("   ❌ ({}) {}", report.index, e);
                if let SyncFailure::Command(cause) = &e.cause {
                    let stderr = cause.stderr.trim();
                    if !stderr.is_empty() {
                        println!("      {}", stderr);
                    }
                }
            }
        }
    }
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    use repovault::health::CheckResult;

    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 repovault System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
