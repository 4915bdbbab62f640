#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Pool behavior driven end-to-end through an in-memory browser backend.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tabctl_pool::{
        PoolConfig, PoolError, PoolManager, TabOptions, TargetSpec,
        cache::ConnectionCache,
        cdp::{BrowserConnection, BrowsingContext, Connector, PageHandle},
        error::Result,
        tabs::TabPool,
    },
    tokio::time,
};

// ── in-memory backend ───────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    page_seq: AtomicUsize,
    id_probes: AtomicUsize,
}

struct FakePage {
    id: String,
    url: Mutex<String>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

#[async_trait]
impl PageHandle for FakePage {
    async fn navigate(&self, url: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Cdp("page is closed".into()));
        }
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn url(&self) -> Result<Option<String>> {
        Ok(Some(self.url.lock().unwrap().clone()))
    }

    fn stable_id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    async fn unique_id(&self) -> Result<String> {
        self.counters.id_probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.id.clone())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeContext {
    counters: Arc<Counters>,
    pages: Mutex<Vec<Arc<FakePage>>>,
}

impl FakeContext {
    fn open_page(&self, url: &str) -> Arc<FakePage> {
        let seq = self.counters.page_seq.fetch_add(1, Ordering::SeqCst);
        let page = Arc::new(FakePage {
            id: format!("{seq:032X}"),
            url: Mutex::new(url.to_string()),
            closed: AtomicBool::new(false),
            counters: Arc::clone(&self.counters),
        });
        self.pages.lock().unwrap().push(Arc::clone(&page));
        page
    }

    fn live_pages(&self) -> Vec<Arc<FakePage>> {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .filter(|page| !page.closed.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BrowsingContext for FakeContext {
    async fn pages(&self) -> Result<Vec<Arc<dyn PageHandle>>> {
        Ok(self
            .live_pages()
            .into_iter()
            .map(|page| page as Arc<dyn PageHandle>)
            .collect())
    }

    async fn create_page(&self, url: Option<&str>) -> Result<Arc<dyn PageHandle>> {
        Ok(self.open_page(url.unwrap_or("about:blank")))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeBrowser {
    counters: Arc<Counters>,
    contexts: Mutex<Vec<Arc<FakeContext>>>,
    healthy: AtomicBool,
    /// Artificial latency for listing contexts; drives timeout tests.
    contexts_delay: Mutex<Duration>,
}

impl FakeBrowser {
    fn new(counters: Arc<Counters>) -> Arc<Self> {
        let browser = Arc::new(Self {
            counters: Arc::clone(&counters),
            contexts: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            contexts_delay: Mutex::new(Duration::ZERO),
        });
        browser.contexts.lock().unwrap().push(Arc::new(FakeContext {
            counters,
            pages: Mutex::new(Vec::new()),
        }));
        browser
    }

    fn first_context(&self) -> Arc<FakeContext> {
        Arc::clone(&self.contexts.lock().unwrap()[0])
    }

    fn open_page(&self, url: &str) -> Arc<FakePage> {
        self.first_context().open_page(url)
    }

    fn set_contexts_delay(&self, delay: Duration) {
        *self.contexts_delay.lock().unwrap() = delay;
    }

    fn find_page(&self, id: &str) -> Option<Arc<FakePage>> {
        self.contexts
            .lock()
            .unwrap()
            .iter()
            .flat_map(|context| context.pages.lock().unwrap().clone())
            .find(|page| page.id == id)
    }
}

struct FakeConnection {
    browser: Arc<FakeBrowser>,
}

#[async_trait]
impl BrowserConnection for FakeConnection {
    async fn probe(&self) -> Result<()> {
        if self.browser.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PoolError::Cdp("browser went away".into()))
        }
    }

    async fn contexts(&self) -> Result<Vec<Arc<dyn BrowsingContext>>> {
        let delay = *self.browser.contexts_delay.lock().unwrap();
        if delay > Duration::ZERO {
            time::sleep(delay).await;
        }
        if !self.browser.healthy.load(Ordering::SeqCst) {
            return Err(PoolError::Cdp("browser went away".into()));
        }
        Ok(self
            .browser
            .contexts
            .lock()
            .unwrap()
            .iter()
            .map(|context| Arc::clone(context) as Arc<dyn BrowsingContext>)
            .collect())
    }

    async fn create_context(&self) -> Result<Arc<dyn BrowsingContext>> {
        let context = Arc::new(FakeContext {
            counters: Arc::clone(&self.browser.counters),
            pages: Mutex::new(Vec::new()),
        });
        self.browser.contexts.lock().unwrap().push(Arc::clone(&context));
        Ok(context)
    }

    async fn disconnect(&self) {}
}

struct FakeConnector {
    counters: Arc<Counters>,
    browsers: Mutex<HashMap<u16, Arc<FakeBrowser>>>,
}

impl FakeConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::new(Counters::default()),
            browsers: Mutex::new(HashMap::new()),
        })
    }

    /// The per-port browser, created on first use. Shared across reconnects
    /// so pages survive a dropped connection, like a real browser's do.
    fn browser(&self, port: u16) -> Arc<FakeBrowser> {
        let mut browsers = self.browsers.lock().unwrap();
        Arc::clone(
            browsers
                .entry(port)
                .or_insert_with(|| FakeBrowser::new(Arc::clone(&self.counters))),
        )
    }

    fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    fn id_probes(&self) -> usize {
        self.counters.id_probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, port: u16) -> Result<Arc<dyn BrowserConnection>> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let browser = self.browser(port);
        // A fresh connection to a running browser is always healthy.
        browser.healthy.store(true, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection { browser }))
    }
}

/// `unwrap_err` needs `T: Debug`, which page handles are not.
fn expect_err<T>(result: Result<T>) -> PoolError {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    }
}

fn manager_with(config: PoolConfig) -> (PoolManager, Arc<FakeConnector>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let connector = FakeConnector::new();
    let manager = PoolManager::with_connector(config, Arc::clone(&connector) as Arc<dyn Connector>);
    (manager, connector)
}

// ── connection cache ────────────────────────────────────────────────────────

#[tokio::test]
async fn acquire_release_acquire_reuses_connection() {
    let (manager, connector) = manager_with(PoolConfig::default());

    manager.acquire_connection(9222).await.unwrap();
    manager.release_connection(9222).await;
    manager.acquire_connection(9222).await.unwrap();

    assert_eq!(connector.connects(), 1);
    assert_eq!(manager.connection_count().await, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn acquire_twice_same_port_keeps_single_entry() {
    let (manager, connector) = manager_with(PoolConfig::default());

    manager.acquire_connection(9222).await.unwrap();
    manager.acquire_connection(9222).await.unwrap();

    assert_eq!(connector.connects(), 1);
    assert_eq!(manager.connection_count().await, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn capacity_two_exhausts_then_recovers_after_release() {
    let mut config = PoolConfig::default();
    config.max_connections = 2;
    let (manager, connector) = manager_with(config);

    manager.acquire_connection(9001).await.unwrap();
    manager.acquire_connection(9002).await.unwrap();

    let err = expect_err(manager.acquire_connection(9003).await);
    assert!(matches!(err, PoolError::PoolExhausted(_)));

    manager.release_connection(9001).await;
    manager.acquire_connection(9003).await.unwrap();

    assert_eq!(connector.connects(), 3);
    assert_eq!(manager.connection_count().await, 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn dead_connection_self_heals_on_next_acquire() {
    let (manager, connector) = manager_with(PoolConfig::default());

    manager.acquire_connection(9222).await.unwrap();
    manager.release_connection(9222).await;

    // Kill the browser connection behind the pool's back.
    connector.browser(9222).healthy.store(false, Ordering::SeqCst);

    manager.acquire_connection(9222).await.unwrap();
    assert_eq!(connector.connects(), 2);
    assert_eq!(manager.connection_count().await, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn unhealthy_connection_is_removed_on_release() {
    let (manager, connector) = manager_with(PoolConfig::default());

    manager.acquire_connection(9222).await.unwrap();
    connector.browser(9222).healthy.store(false, Ordering::SeqCst);
    manager.release_connection(9222).await;

    assert_eq!(manager.connection_count().await, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn idle_sweep_drops_only_idle_entries() {
    let mut config = PoolConfig::default();
    config.connection_idle_timeout = Duration::ZERO;
    let connector = FakeConnector::new();
    let cache = ConnectionCache::new(config, Arc::clone(&connector) as Arc<dyn Connector>);

    cache.acquire(9001).await.unwrap();
    cache.acquire(9002).await.unwrap();
    cache.release(9001).await;
    time::sleep(Duration::from_millis(5)).await;

    cache.sweep_idle().await;

    // 9001 was idle and past the threshold; 9002 is still checked out.
    assert_eq!(cache.len().await, 1);
    assert_eq!(cache.in_use(9002).await, Some(true));
    cache.shutdown().await;
}

// ── managed tabs ────────────────────────────────────────────────────────────

#[tokio::test]
async fn tab_ceiling_evicts_least_recently_parked_idle_tab() {
    let mut config = PoolConfig::default();
    config.max_tabs = 3;
    let (manager, connector) = manager_with(config);

    let first = manager.tab(TabOptions::default()).await.unwrap();
    let second = manager.tab(TabOptions::default()).await.unwrap();
    let third = manager.tab(TabOptions::default()).await.unwrap();

    manager.release_tab(&first.tab_id).await;
    time::sleep(Duration::from_millis(5)).await;
    manager.release_tab(&second.tab_id).await;
    time::sleep(Duration::from_millis(5)).await;
    manager.release_tab(&third.tab_id).await;

    let fourth = manager.tab(TabOptions::default()).await.unwrap();

    // The least recently parked tab was closed, and the request was served
    // by reuse rather than failing.
    let browser = connector.browser(9222);
    let evicted = browser.find_page(&first.tab_id).unwrap();
    assert!(evicted.closed.load(Ordering::SeqCst));
    assert_ne!(fourth.tab_id, first.tab_id);

    let stats = manager.stats().await;
    assert_eq!(stats.total_tabs, 2);
    assert_eq!(stats.in_use, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn reuse_resets_tab_to_blank_when_no_url_given() {
    let (manager, connector) = manager_with(PoolConfig::default());

    let lease = manager
        .tab(TabOptions {
            url: Some("https://example.com".into()),
            ..TabOptions::default()
        })
        .await
        .unwrap();
    manager.release_tab(&lease.tab_id).await;

    let reused = manager.tab(TabOptions::default()).await.unwrap();
    assert_eq!(reused.tab_id, lease.tab_id);

    let page = connector.browser(9222).find_page(&lease.tab_id).unwrap();
    assert_eq!(page.url.lock().unwrap().as_str(), "about:blank");
    manager.shutdown().await;
}

#[tokio::test]
async fn persistent_tab_is_never_reused_or_evicted() {
    let mut config = PoolConfig::default();
    config.max_tabs = 1;
    config.tab_idle_timeout = Duration::ZERO;
    let connector = FakeConnector::new();
    let pool = TabPool::new(config);
    let conn = connector.connect(9222).await.unwrap();

    let pinned = pool
        .get_or_create(&conn, TabOptions {
            persistent: true,
            ..TabOptions::default()
        })
        .await
        .unwrap();
    pool.release(&pinned.tab_id).await;
    time::sleep(Duration::from_millis(5)).await;

    // Idle past the threshold, but exempt from the sweep.
    pool.sweep_idle().await;
    assert_eq!(pool.stats().await.total_tabs, 1);

    // At the ceiling with only a persistent tab, nothing may be reused or
    // closed to make room.
    let err = pool
        .get_or_create(&conn, TabOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::PoolExhausted(_)));
    assert!(
        !connector
            .browser(9222)
            .find_page(&pinned.tab_id)
            .unwrap()
            .closed
            .load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn idle_sweep_closes_stale_tabs() {
    let mut config = PoolConfig::default();
    config.tab_idle_timeout = Duration::ZERO;
    let connector = FakeConnector::new();
    let pool = TabPool::new(config);
    let conn = connector.connect(9222).await.unwrap();

    let lease = pool.get_or_create(&conn, TabOptions::default()).await.unwrap();
    pool.release(&lease.tab_id).await;
    time::sleep(Duration::from_millis(5)).await;

    pool.sweep_idle().await;

    assert_eq!(pool.stats().await.total_tabs, 0);
    let page = connector.browser(9222).find_page(&lease.tab_id).unwrap();
    assert!(page.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn background_sweep_runs_without_manual_calls() {
    let mut config = PoolConfig::default();
    config.tab_idle_timeout = Duration::ZERO;
    config.tab_sweep_interval = Duration::from_millis(20);
    let (manager, _connector) = manager_with(config);

    let lease = manager.tab(TabOptions::default()).await.unwrap();
    manager.release_tab(&lease.tab_id).await;

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.stats().await.total_tabs, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn release_twice_is_a_noop() {
    let (manager, _connector) = manager_with(PoolConfig::default());

    let lease = manager.tab(TabOptions::default()).await.unwrap();
    manager.release_tab(&lease.tab_id).await;
    manager.release_tab(&lease.tab_id).await;

    let stats = manager.stats().await;
    assert_eq!(stats.total_tabs, 1);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn owner_is_recorded_and_cleared_on_release() {
    let (manager, _connector) = manager_with(PoolConfig::default());

    let lease = manager
        .tab(TabOptions {
            owner: Some("checkout-flow".into()),
            ..TabOptions::default()
        })
        .await
        .unwrap();

    let listed = manager.list_tabs().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].owner.as_deref(), Some("checkout-flow"));
    assert!(listed[0].in_use);

    manager.release_tab(&lease.tab_id).await;
    let listed = manager.list_tabs().await;
    assert_eq!(listed[0].owner, None);
    assert!(!listed[0].in_use);
    manager.shutdown().await;
}

#[tokio::test]
async fn rejected_url_scheme_fails_before_touching_the_browser() {
    let (manager, connector) = manager_with(PoolConfig::default());

    let err = manager
        .tab(TabOptions {
            url: Some("file:///etc/passwd".into()),
            ..TabOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidUrl(_)));
    assert_eq!(manager.stats().await.total_tabs, 0);
    // Validation happens before the tab pool goes anywhere near a page.
    assert!(connector.browser(9222).first_context().live_pages().is_empty());
    manager.shutdown().await;
}

// ── target resolution ───────────────────────────────────────────────────────

#[tokio::test]
async fn resolve_by_index_in_page_order() {
    let (manager, connector) = manager_with(PoolConfig::default());
    let browser = connector.browser(9222);
    browser.open_page("https://one.example");
    let second = browser.open_page("https://two.example");

    let page = manager
        .resolve_target(9222, &TargetSpec::at_index(1))
        .await
        .unwrap();
    assert_eq!(page.unique_id().await.unwrap(), second.id);
    manager.shutdown().await;
}

#[tokio::test]
async fn resolve_by_index_out_of_range_names_valid_range() {
    let (manager, connector) = manager_with(PoolConfig::default());
    let browser = connector.browser(9222);
    browser.open_page("https://one.example");
    browser.open_page("https://two.example");

    let err = expect_err(manager.resolve_target(9222, &TargetSpec::at_index(5)).await);
    match err {
        PoolError::NotFound(message) => assert!(message.contains("0-1"), "got: {message}"),
        other => panic!("expected NotFound, got {other:?}"),
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn resolve_conflicting_spec_fails_even_with_resolvable_values() {
    let (manager, connector) = manager_with(PoolConfig::default());
    let browser = connector.browser(9222);
    let page = browser.open_page("https://one.example");

    let spec = TargetSpec {
        index: Some(0),
        unique_id: Some(page.id.clone()),
    };
    let err = expect_err(manager.resolve_target(9222, &spec).await);
    assert!(matches!(err, PoolError::ArgumentConflict));
    manager.shutdown().await;
}

#[tokio::test]
async fn resolve_by_id_scans_then_hits_registry_on_repeat() {
    let (manager, connector) = manager_with(PoolConfig::default());
    let browser = connector.browser(9222);
    // A tab the pool did not create.
    let external = browser.open_page("https://docs.example");

    let found = manager
        .resolve_target(9222, &TargetSpec::with_id(external.id.clone()))
        .await
        .unwrap();
    assert_eq!(found.unique_id().await.unwrap(), external.id);
    let probes_after_scan = connector.id_probes();
    assert!(probes_after_scan > 1, "first lookup goes through the scan");

    // Second lookup is served by the registry: no new probes beyond the
    // assertion's own unique_id call above.
    manager
        .resolve_target(9222, &TargetSpec::with_id(external.id.clone()))
        .await
        .unwrap();
    assert_eq!(connector.id_probes(), probes_after_scan);
    manager.shutdown().await;
}

#[tokio::test]
async fn resolve_by_unknown_id_reports_not_found() {
    let (manager, connector) = manager_with(PoolConfig::default());
    connector.browser(9222).open_page("https://one.example");

    let err = expect_err(
        manager
            .resolve_target(9222, &TargetSpec::with_id("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"))
            .await,
    );
    assert!(matches!(err, PoolError::NotFound(_)));
    manager.shutdown().await;
}

#[tokio::test]
async fn active_page_skips_browser_internal_pages() {
    let (manager, connector) = manager_with(PoolConfig::default());
    let browser = connector.browser(9222);
    browser.open_page("chrome://newtab/");
    let real = browser.open_page("https://example.com");

    let page = manager.resolve_target(9222, &TargetSpec::active()).await.unwrap();
    assert_eq!(page.unique_id().await.unwrap(), real.id);
    manager.shutdown().await;
}

#[tokio::test]
async fn active_page_is_created_when_none_qualifies() {
    let (manager, connector) = manager_with(PoolConfig::default());

    let page = manager.resolve_target(9222, &TargetSpec::active()).await.unwrap();
    assert_eq!(page.url().await.unwrap().as_deref(), Some("about:blank"));
    assert_eq!(connector.browser(9222).first_context().live_pages().len(), 1);
    manager.shutdown().await;
}

// ── the composed operation ──────────────────────────────────────────────────

#[tokio::test]
async fn with_target_page_runs_action_against_resolved_page() {
    let (manager, connector) = manager_with(PoolConfig::default());
    let browser = connector.browser(9222);
    let page = browser.open_page("https://example.com");

    let url = manager
        .with_target_page(9222, None, Some(page.id.clone()), |page| async move {
            page.navigate("https://example.com/next").await?;
            page.url().await
        })
        .await
        .unwrap();

    assert_eq!(url.as_deref(), Some("https://example.com/next"));
    manager.shutdown().await;
}

#[tokio::test]
async fn with_target_page_action_error_propagates_after_release() {
    let mut config = PoolConfig::default();
    config.max_connections = 1;
    let (manager, connector) = manager_with(config);
    connector.browser(9001).open_page("https://example.com");

    let err = manager
        .with_target_page(9001, None, None, |_page| async {
            Err::<(), _>(PoolError::Cdp("boom".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Cdp(message) if message == "boom"));

    // The connection came back: with capacity 1, another port can only be
    // served if 9001's entry was released (and thus evictable).
    manager.acquire_connection(9002).await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn with_target_page_rewrites_resolution_timeouts() {
    let mut config = PoolConfig::default();
    config.resolve_id_budget = Duration::from_millis(50);
    let (manager, connector) = manager_with(config);
    let browser = connector.browser(9222);
    let page = browser.open_page("https://example.com");
    browser.set_contexts_delay(Duration::from_millis(500));

    let err = manager
        .with_target_page(9222, None, Some(page.id.clone()), |_page| async { Ok(()) })
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    let message = err.to_string();
    assert!(message.contains("finding tab with ID"), "got: {message}");

    browser.set_contexts_delay(Duration::ZERO);
    manager.shutdown().await;
}
