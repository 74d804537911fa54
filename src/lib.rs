//! repovault - mirror every repository of a GitHub account onto local disk
//!
//! Each run lists the account's repositories page by page, then clones the
//! missing ones and updates the existing mirrors. A mirror that can no longer
//! be updated is deleted and cloned again. Wikis are mirrored next to their
//! repository when the remote advertises one.
//!
//! ## Modules
//!
//! - [`command`]: running external commands and recording their output
//! - [`mirror`]: repository identities, mirror targets and local probing
//! - [`git`]: clone/update strategy with re-clone recovery
//! - [`discovery`]: paginated repository inventory
//! - [`github`]: GitHub-backed inventory source
//! - [`sync`]: concurrent backup orchestration
//! - [`config`]: configuration management and parsing
//! - [`health`]: preflight diagnostics for `doctor`

pub mod command;
pub mod config;
pub mod discovery;
pub mod git;
pub mod github;
pub mod health;
pub mod mirror;
pub mod sync;

pub use command::{CommandOutcome, CommandRunner, ProcessRunner};
pub use config::Config;
pub use discovery::{InventoryFetcher, RepositorySource};
pub use git::{GitRemote, MirrorSync, SyncError, SyncKind, SyncReport};
pub use github::GitHubClient;
pub use health::HealthCheck;
pub use mirror::{MirrorTarget, RepositoryIdentity};
pub use sync::{BackupEngine, BackupSettings, BackupSummary};
