//! Remote repository inventory
//!
//! A [`RepositorySource`] hands out one page of repositories at a time. The
//! [`InventoryFetcher`] walks pages from 1 upwards until a page comes back
//! shorter than the page size, which is the only end-of-list signal the
//! listing API gives. A list that is an exact multiple of the page size
//! therefore costs one extra, empty request.

use async_trait::async_trait;
use futures::stream::{self, Stream, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::mirror::RepositoryIdentity;

/// Largest page the listing API accepts
pub const MAX_PER_PAGE: u32 = 100;

/// Upper bound on pages requested in one listing
pub const MAX_PAGES: u32 = 1000;

/// The remote listing could not be completed
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to fetch repositories page {page}: {source}")]
    Api {
        page: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("repository listing did not end after {0} pages")]
    TooManyPages(u32),
}

/// Paginated source of repositories for an account
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Fetch page `page` (1-based) holding at most `per_page` repositories
    async fn fetch_page(
        &self,
        owner: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RepositoryIdentity>, InventoryError>;

    /// Provider name for display/logging
    fn provider_name(&self) -> &'static str;
}

/// Walks a [`RepositorySource`] to exhaustion
#[derive(Clone)]
pub struct InventoryFetcher {
    source: Arc<dyn RepositorySource>,
    per_page: u32,
}

struct PageCursor {
    next_page: u32,
    done: bool,
}

impl InventoryFetcher {
    pub fn new(source: Arc<dyn RepositorySource>) -> Self {
        Self {
            source,
            per_page: MAX_PER_PAGE,
        }
    }

    /// Page size, clamped to 1..=100
    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, MAX_PER_PAGE);
        self
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    /// Lazily yield one page at a time until a short page ends the listing.
    pub fn pages<'a>(
        &'a self,
        owner: &'a str,
    ) -> impl Stream<Item = Result<Vec<RepositoryIdentity>, InventoryError>> + 'a {
        let cursor = PageCursor {
            next_page: 1,
            done: false,
        };

        stream::try_unfold(cursor, move |cursor| async move {
            if cursor.done {
                return Ok(None);
            }
            if cursor.next_page > MAX_PAGES {
                return Err(InventoryError::TooManyPages(MAX_PAGES));
            }

            let page = cursor.next_page;
            let items = self.source.fetch_page(owner, page, self.per_page).await?;
            debug!(
                "{} page {} returned {} repositories",
                self.source.provider_name(),
                page,
                items.len()
            );

            let done = items.len() < self.per_page as usize;
            Ok(Some((
                items,
                PageCursor {
                    next_page: page + 1,
                    done,
                },
            )))
        })
    }

    /// Every repository of `owner`, deduplicated by full name, in API order.
    pub async fn list_all_repositories(
        &self,
        owner: &str,
    ) -> Result<Vec<RepositoryIdentity>, InventoryError> {
        let mut seen = HashSet::new();
        let mut repositories = Vec::new();

        let mut pages = Box::pin(self.pages(owner));
        while let Some(page) = pages.try_next().await? {
            for repo in page {
                if seen.insert(repo.full_name.to_lowercase()) {
                    repositories.push(repo);
                } else {
                    debug!("Skipping duplicate repository {}", repo.full_name);
                }
            }
        }

        info!(
            "Found {} repositories for '{}' on {}",
            repositories.len(),
            owner,
            self.source.provider_name()
        );
        Ok(repositories)
    }
}
