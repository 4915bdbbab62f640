//! Reusable managed tabs with idle eviction and a browser-wide ceiling.
//!
//! The ceiling is checked against the browser's true page count rather than
//! pool bookkeeping: tabs opened outside the pool (a user hitting ctrl-t)
//! still occupy capacity and must not let the limit be silently exceeded.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    sha2::{Digest, Sha256},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    cdp::{BrowserConnection, PageHandle},
    error::{PoolError, Result},
    types::{LeasedTab, PoolConfig, PoolStats, TabOptions, TabSummary},
};

/// One pooled tab. The record and its page are always removed together.
struct ManagedTab {
    page: Arc<dyn PageHandle>,
    url: Option<String>,
    in_use: bool,
    last_accessed: Instant,
    created: Instant,
    owner: Option<String>,
    persistent: bool,
}

/// Pool of reusable browser tabs keyed by stable tab id.
pub struct TabPool {
    config: PoolConfig,
    /// Guards every structural change; held across browser round-trips so
    /// a get-or-create is atomic from the caller's view.
    tabs: Mutex<HashMap<String, ManagedTab>>,
    fallback_seq: AtomicU64,
}

impl TabPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            tabs: Mutex::new(HashMap::new()),
            fallback_seq: AtomicU64::new(0),
        }
    }

    /// Check out a tab, reusing an idle non-persistent one when possible.
    ///
    /// Reuse navigates the tab to the requested URL, or to a blank page to
    /// reset state when none was given. Creation only happens when no idle
    /// tab qualifies and the browser has spare capacity after eviction.
    pub async fn get_or_create(
        &self,
        conn: &Arc<dyn BrowserConnection>,
        options: TabOptions,
    ) -> Result<LeasedTab> {
        if let Some(url) = options.url.as_deref() {
            validate_url(url)?;
        }

        let mut tabs = self.tabs.lock().await;
        self.enforce_ceiling(conn, &mut tabs).await?;

        // Reuse the most recently parked idle tab before creating.
        let reusable = tabs
            .iter()
            .filter(|(_, tab)| !tab.in_use && !tab.persistent)
            .max_by_key(|(_, tab)| tab.last_accessed)
            .map(|(id, _)| id.clone());

        if let Some(tab_id) = reusable {
            let target = options.url.as_deref().unwrap_or("about:blank");
            let page = {
                let Some(tab) = tabs.get(&tab_id) else {
                    return Err(PoolError::NotFound(format!("tab {tab_id} vanished")));
                };
                Arc::clone(&tab.page)
            };

            if let Err(e) = page.navigate(target).await {
                // A tab that cannot even navigate is dead weight; drop the
                // record and the page together and report the failure.
                warn!(tab_id, error = %e, "reused tab failed to navigate, closing");
                tabs.remove(&tab_id);
                let _ = page.close().await;
                return Err(e);
            }

            if let Some(tab) = tabs.get_mut(&tab_id) {
                tab.in_use = true;
                tab.owner = options.owner.clone();
                tab.last_accessed = Instant::now();
                tab.url = Some(target.to_string());
            }
            debug!(tab_id, owner = options.owner.as_deref().unwrap_or(""), "reusing idle tab");
            return Ok(LeasedTab { tab_id, page });
        }

        // No idle tab qualifies: create a new page in an existing context,
        // or in a fresh one when the browser has none.
        let context = match conn.contexts().await?.into_iter().next() {
            Some(context) => context,
            None => conn.create_context().await?,
        };
        let page = context.create_page(options.url.as_deref()).await?;

        let tab_id = match page.stable_id() {
            Some(id) => id,
            None => self.fallback_tab_id(),
        };
        tabs.insert(tab_id.clone(), ManagedTab {
            page: Arc::clone(&page),
            url: options.url.clone(),
            in_use: true,
            last_accessed: Instant::now(),
            created: Instant::now(),
            owner: options.owner.clone(),
            persistent: options.persistent,
        });
        info!(
            tab_id,
            owner = options.owner.as_deref().unwrap_or(""),
            persistent = options.persistent,
            "created managed tab"
        );
        Ok(LeasedTab { tab_id, page })
    }

    /// Park a tab for reuse. Calling this twice, or with an unknown id, is
    /// a no-op.
    pub async fn release(&self, tab_id: &str) {
        let mut tabs = self.tabs.lock().await;
        match tabs.get_mut(tab_id) {
            Some(tab) if tab.in_use => {
                tab.in_use = false;
                tab.owner = None;
                tab.last_accessed = Instant::now();
                debug!(tab_id, "released tab");
            },
            _ => debug!(tab_id, "release of unknown or already idle tab ignored"),
        }
    }

    /// Close and remove every idle non-persistent tab past the idle
    /// threshold.
    pub async fn sweep_idle(&self) {
        let mut tabs = self.tabs.lock().await;
        let stale: Vec<String> = tabs
            .iter()
            .filter(|(_, tab)| {
                !tab.in_use
                    && !tab.persistent
                    && tab.last_accessed.elapsed() > self.config.tab_idle_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        for tab_id in stale {
            if let Some(tab) = tabs.remove(&tab_id) {
                if let Err(e) = tab.page.close().await {
                    warn!(tab_id, error = %e, "failed to close idle tab");
                }
                info!(tab_id, "closed idle tab");
            }
        }
    }

    /// Close and remove every managed tab unconditionally.
    pub async fn close_all(&self) {
        let drained: Vec<(String, ManagedTab)> = {
            let mut tabs = self.tabs.lock().await;
            tabs.drain().collect()
        };
        for (tab_id, tab) in drained {
            if let Err(e) = tab.page.close().await {
                warn!(tab_id, error = %e, "failed to close tab during shutdown");
            }
        }
    }

    /// Forget every record without touching the pages. Used by forced
    /// shutdown, where closing tabs is not worth waiting for.
    pub async fn clear(&self) {
        self.tabs.lock().await.clear();
    }

    /// Fast id lookup against the pool's own registry.
    pub(crate) async fn lookup(&self, tab_id: &str) -> Option<Arc<dyn PageHandle>> {
        let tabs = self.tabs.lock().await;
        if let Some(tab) = tabs.get(tab_id) {
            return Some(Arc::clone(&tab.page));
        }
        // CDP reports target ids in uppercase; accept either casing.
        tabs.iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(tab_id))
            .map(|(_, tab)| Arc::clone(&tab.page))
    }

    /// Register a tab the pool did not create, on first touch. Adopted tabs
    /// are persistent: they belong to whoever opened them, so the pool must
    /// neither reuse nor evict them.
    pub(crate) async fn adopt(&self, tab_id: &str, page: &Arc<dyn PageHandle>) {
        let mut tabs = self.tabs.lock().await;
        if tabs.contains_key(tab_id) {
            return;
        }
        let url = page.url().await.ok().flatten();
        tabs.insert(tab_id.to_string(), ManagedTab {
            page: Arc::clone(page),
            url,
            in_use: false,
            last_accessed: Instant::now(),
            created: Instant::now(),
            owner: None,
            persistent: true,
        });
        debug!(tab_id, "adopted externally created tab");
    }

    pub async fn stats(&self) -> PoolStats {
        let tabs = self.tabs.lock().await;
        let in_use = tabs.values().filter(|tab| tab.in_use).count();
        PoolStats {
            total_tabs: tabs.len(),
            in_use,
            idle: tabs.len() - in_use,
            max_tabs: self.config.max_tabs,
            idle_timeout_ms: self.config.tab_idle_timeout.as_millis() as u64,
        }
    }

    pub async fn list(&self) -> Vec<TabSummary> {
        let tabs = self.tabs.lock().await;
        let mut summaries: Vec<TabSummary> = tabs
            .iter()
            .map(|(id, tab)| TabSummary {
                tab_id: id.clone(),
                url: tab.url.clone(),
                owner: tab.owner.clone(),
                in_use: tab.in_use,
                persistent: tab.persistent,
                age_secs: tab.created.elapsed().as_secs(),
            })
            .collect();
        summaries.sort_by(|a, b| b.age_secs.cmp(&a.age_secs));
        summaries
    }

    /// Make room for one more tab when the browser sits at its ceiling.
    ///
    /// The count includes pages the pool never created. Eviction closes the
    /// oldest quarter of idle non-persistent tabs first, then falls back to
    /// force-closing the single oldest non-persistent tab, idle or not.
    async fn enforce_ceiling(
        &self,
        conn: &Arc<dyn BrowserConnection>,
        tabs: &mut HashMap<String, ManagedTab>,
    ) -> Result<()> {
        let mut open = count_open_pages(conn).await?;
        if open < self.config.max_tabs {
            return Ok(());
        }

        let mut idle: Vec<(String, Instant)> = tabs
            .iter()
            .filter(|(_, tab)| !tab.in_use && !tab.persistent)
            .map(|(id, tab)| (id.clone(), tab.last_accessed))
            .collect();
        idle.sort_by_key(|(_, last_accessed)| *last_accessed);

        let quarter = idle.len().div_ceil(4);
        for (tab_id, _) in idle.into_iter().take(quarter) {
            if let Some(tab) = tabs.remove(&tab_id) {
                if let Err(e) = tab.page.close().await {
                    warn!(tab_id, error = %e, "failed to close evicted tab");
                }
                info!(tab_id, "evicted idle tab under capacity pressure");
                open = open.saturating_sub(1);
            }
        }
        if open < self.config.max_tabs {
            return Ok(());
        }

        let oldest = tabs
            .iter()
            .filter(|(_, tab)| !tab.persistent)
            .min_by_key(|(_, tab)| tab.created)
            .map(|(id, _)| id.clone());
        match oldest {
            Some(tab_id) => {
                if let Some(tab) = tabs.remove(&tab_id) {
                    if let Err(e) = tab.page.close().await {
                        warn!(tab_id, error = %e, "failed to close force-evicted tab");
                    }
                    warn!(tab_id, "force-closed oldest tab at capacity");
                }
                Ok(())
            },
            None => Err(PoolError::PoolExhausted(format!(
                "browser is at its {}-tab ceiling and every pooled tab is persistent",
                self.config.max_tabs
            ))),
        }
    }

    /// Deterministic id for pages whose client cannot provide a target id,
    /// shaped like one (32 hex chars) so downstream id validation holds.
    fn fallback_tab_id(&self) -> String {
        let seq = self.fallback_seq.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(b"tabctl-tab");
        hasher.update(seq.to_be_bytes());
        let digest = hasher.finalize();
        digest
            .iter()
            .take(16)
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

async fn count_open_pages(conn: &Arc<dyn BrowserConnection>) -> Result<usize> {
    let mut count = 0;
    for context in conn.contexts().await? {
        count += context.pages().await?.len();
    }
    Ok(count)
}

fn validate_url(url: &str) -> Result<()> {
    let parsed =
        url::Url::parse(url).map_err(|e| PoolError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" | "about" => Ok(()),
        other => Err(PoolError::InvalidUrl(format!(
            "unsupported scheme {other}: in {url}"
        ))),
    }
}
