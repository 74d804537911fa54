//! Mirror data model and local state probing
//!
//! A [`RepositoryIdentity`] comes from the remote inventory. Each identity
//! maps to one primary [`MirrorTarget`] and, when the remote advertises a
//! wiki, one wiki target. Targets are rebuilt on every run from the backup
//! root, so the filesystem path is their only identity.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory whose presence marks a usable git working copy
pub const MIRROR_METADATA_DIR: &str = ".git";

/// One remote repository owned by (or visible to) the account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryIdentity {
    /// Owner login (user or organization)
    pub owner_login: String,

    /// Repository name
    pub name: String,

    /// Canonical "owner/name", used to build remote URLs
    pub full_name: String,

    /// Whether the remote reports a wiki for this repository
    pub has_wiki: bool,
}

impl RepositoryIdentity {
    pub fn new(owner_login: impl Into<String>, name: impl Into<String>, has_wiki: bool) -> Self {
        let owner_login = owner_login.into();
        let name = name.into();
        let full_name = format!("{}/{}", owner_login, name);
        Self {
            owner_login,
            name,
            full_name,
            has_wiki,
        }
    }

    /// Full name of the companion wiki repository
    pub fn wiki_full_name(&self) -> String {
        format!("{}.wiki", self.full_name)
    }
}

/// Whether a target mirrors the repository itself or its wiki
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    Primary,
    Wiki,
}

/// Where and what to mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub local_path: PathBuf,
    pub identity: RepositoryIdentity,
    pub kind: MirrorKind,
}

impl MirrorTarget {
    /// `backup_root/owner/name`
    pub fn primary(backup_root: &Path, identity: &RepositoryIdentity) -> Self {
        Self {
            local_path: backup_root.join(&identity.owner_login).join(&identity.name),
            identity: identity.clone(),
            kind: MirrorKind::Primary,
        }
    }

    /// `backup_root/owner/name_wiki`
    pub fn wiki(backup_root: &Path, identity: &RepositoryIdentity) -> Self {
        Self {
            local_path: backup_root
                .join(&identity.owner_login)
                .join(format!("{}_wiki", identity.name)),
            identity: identity.clone(),
            kind: MirrorKind::Wiki,
        }
    }

    pub fn is_wiki(&self) -> bool {
        self.kind == MirrorKind::Wiki
    }

    /// Remote full name this target is cloned from
    pub fn remote_full_name(&self) -> String {
        match self.kind {
            MirrorKind::Primary => self.identity.full_name.clone(),
            MirrorKind::Wiki => self.identity.wiki_full_name(),
        }
    }

    pub async fn is_valid_mirror(&self) -> bool {
        is_valid_mirror(&self.local_path).await
    }
}

/// True only when `path` is a directory holding a git metadata directory.
///
/// Any filesystem error (missing path, permissions, broken symlink) means
/// "no mirror here".
pub async fn is_valid_mirror(path: &Path) -> bool {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return false,
    }

    tokio::fs::symlink_metadata(path.join(MIRROR_METADATA_DIR))
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}
