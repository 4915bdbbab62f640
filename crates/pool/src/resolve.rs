//! Target resolution: mapping "tab at index N", "tab with id X", or "the
//! active page" to a concrete page handle.
//!
//! "First" always means lowest context-creation order, then lowest
//! page-creation order within a context, so repeated calls without
//! intervening mutation return the same page.

use std::sync::Arc;

use {
    futures::future::join_all,
    tokio::time,
    tracing::debug,
};

use crate::{
    cdp::{BrowserConnection, PageHandle},
    error::{PoolError, Result},
    tabs::TabPool,
    types::PoolConfig,
};

/// URL prefixes of pages that never count as "the active page".
const INTERNAL_URL_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "chrome-untrusted://",
    "devtools://",
    "edge://",
];

/// Logical selection of which tab an action should run against.
///
/// At most one of `index` and `unique_id` may be set; neither means "the
/// current active, non-internal page".
#[derive(Debug, Clone, Default)]
pub struct TargetSpec {
    pub index: Option<usize>,
    pub unique_id: Option<String>,
}

impl TargetSpec {
    /// The active page.
    #[must_use]
    pub fn active() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn at_index(index: usize) -> Self {
        Self {
            index: Some(index),
            unique_id: None,
        }
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            index: None,
            unique_id: Some(id.into()),
        }
    }

    /// Reject contract violations before any browser round-trip.
    pub fn validate(&self) -> Result<()> {
        if self.index.is_some() && self.unique_id.is_some() {
            return Err(PoolError::ArgumentConflict);
        }
        if let Some(id) = self.unique_id.as_deref()
            && !is_valid_tab_id(id)
        {
            return Err(PoolError::InvalidTabId(id.to_string()));
        }
        Ok(())
    }
}

/// Resolves target specifications against a live connection.
pub struct TargetResolver {
    config: PoolConfig,
    tabs: Arc<TabPool>,
}

impl TargetResolver {
    pub fn new(config: PoolConfig, tabs: Arc<TabPool>) -> Self {
        Self { config, tabs }
    }

    /// Dispatch on the spec. Validation failures surface before any
    /// round-trip.
    pub async fn resolve(
        &self,
        conn: &Arc<dyn BrowserConnection>,
        spec: &TargetSpec,
    ) -> Result<Arc<dyn PageHandle>> {
        spec.validate()?;
        match (spec.index, spec.unique_id.as_deref()) {
            (Some(index), None) => self.by_index(conn, index).await,
            (None, Some(id)) => self.by_unique_id(conn, id).await,
            (None, None) => self.active(conn).await,
            (Some(_), Some(_)) => Err(PoolError::ArgumentConflict),
        }
    }

    /// The page at `index` in the ordered list of all pages.
    pub async fn by_index(
        &self,
        conn: &Arc<dyn BrowserConnection>,
        index: usize,
    ) -> Result<Arc<dyn PageHandle>> {
        let pages = all_pages(conn).await?;
        match pages.len() {
            0 => Err(PoolError::NotFound(format!(
                "tab index {index} out of range; no tabs are open"
            ))),
            n if index >= n => Err(PoolError::NotFound(format!(
                "tab index {index} out of range; valid indexes are 0-{}",
                n - 1
            ))),
            _ => Ok(Arc::clone(&pages[index])),
        }
    }

    /// The page whose unique id is `id`.
    ///
    /// Fast path: the pool's own registry. On a miss, probe only the most
    /// recently created pages, in parallel, each under a short budget; a
    /// hit is adopted into the registry so the next lookup skips the scan.
    pub async fn by_unique_id(
        &self,
        conn: &Arc<dyn BrowserConnection>,
        id: &str,
    ) -> Result<Arc<dyn PageHandle>> {
        if !is_valid_tab_id(id) {
            return Err(PoolError::InvalidTabId(id.to_string()));
        }

        if let Some(page) = self.tabs.lookup(id).await {
            debug!(tab_id = id, "resolved tab via registry");
            return Ok(page);
        }

        let pages = all_pages(conn).await?;
        let window: Vec<Arc<dyn PageHandle>> = pages
            .iter()
            .rev()
            .take(self.config.scan_window)
            .cloned()
            .collect();

        let probes = window.iter().map(|page| async {
            match time::timeout(self.config.id_probe_timeout, page.unique_id()).await {
                Ok(Ok(page_id)) => Some((page_id, Arc::clone(page))),
                _ => None,
            }
        });
        for (page_id, page) in join_all(probes).await.into_iter().flatten() {
            if page_id.eq_ignore_ascii_case(id) {
                debug!(tab_id = id, "resolved tab via fallback scan");
                self.tabs.adopt(&page_id, &page).await;
                return Ok(page);
            }
        }

        Err(PoolError::NotFound(format!("tab {id} not found")))
    }

    /// The first page, in creation order, whose URL is not browser-internal.
    /// Creates a page (and a context, when the browser has none) if nothing
    /// qualifies.
    pub async fn active(
        &self,
        conn: &Arc<dyn BrowserConnection>,
    ) -> Result<Arc<dyn PageHandle>> {
        for page in all_pages(conn).await? {
            let url = page.url().await.unwrap_or(None);
            match url {
                Some(url) if is_internal_url(&url) => continue,
                _ => return Ok(page),
            }
        }

        let context = match conn.contexts().await?.into_iter().next() {
            Some(context) => context,
            None => conn.create_context().await?,
        };
        debug!("no active page; creating one");
        context.create_page(None).await
    }
}

/// All pages across all contexts, in context order then page order.
async fn all_pages(conn: &Arc<dyn BrowserConnection>) -> Result<Vec<Arc<dyn PageHandle>>> {
    let mut pages = Vec::new();
    for context in conn.contexts().await? {
        pages.extend(context.pages().await?);
    }
    Ok(pages)
}

/// CDP target ids are 32 hex characters; anything else is rejected without
/// a round-trip.
fn is_valid_tab_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_internal_url(url: &str) -> bool {
    INTERNAL_URL_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
}
