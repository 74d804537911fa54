use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::discovery::{InventoryError, RepositorySource};
use crate::mirror::RepositoryIdentity;

/// GitHub client wrapper listing repositories for the configured account
pub struct GitHubClient {
    client: Octocrab,
}

/// Query string for `GET /user/repos`
#[derive(Debug, Serialize)]
struct ListReposParams<'a> {
    owner: &'a str,
    page: u32,
    per_page: u32,
}

/// The fields of a repository record we care about
#[derive(Debug, Deserialize)]
struct RepoRecord {
    owner: OwnerRecord,
    name: String,
    full_name: String,
    #[serde(default)]
    has_wiki: bool,
}

#[derive(Debug, Deserialize)]
struct OwnerRecord {
    login: String,
}

impl From<RepoRecord> for RepositoryIdentity {
    fn from(record: RepoRecord) -> Self {
        Self {
            owner_login: record.owner.login,
            name: record.name,
            full_name: record.full_name,
            has_wiki: record.has_wiki,
        }
    }
}

impl GitHubClient {
    /// Create a client authenticated with the configured bearer token
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_base_url(&config.github.api_url, config.account.token.clone())
    }

    /// Create a client against an explicit API root
    pub fn with_base_url(api_url: &str, token: String) -> Result<Self> {
        let client = Octocrab::builder()
            .personal_token(token)
            .base_uri(api_url)
            .with_context(|| format!("Invalid GitHub API url: {}", api_url))?
            .build()
            .context("Failed to create GitHub client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RepositorySource for GitHubClient {
    async fn fetch_page(
        &self,
        owner: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RepositoryIdentity>, InventoryError> {
        debug!("Fetching repositories page {} for {}", page, owner);

        let params = ListReposParams {
            owner,
            page,
            per_page,
        };

        let records: Vec<RepoRecord> = self
            .client
            .get("/user/repos", Some(&params))
            .await
            .map_err(|e| InventoryError::Api {
                page,
                source: Box::new(e),
            })?;

        Ok(records.into_iter().map(RepositoryIdentity::from).collect())
    }

    fn provider_name(&self) -> &'static str {
        "GitHub"
    }
}
