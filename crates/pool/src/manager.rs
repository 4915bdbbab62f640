//! The pool facade: the one object command implementations talk to.
//!
//! `PoolManager` is construct-once state with an explicit lifecycle: build
//! it when the host process starts, pass it by reference to every consumer,
//! and call [`PoolManager::shutdown`] when the process ends. It owns the
//! background sweeps, so dropping it also stops them.

use std::{future::Future, sync::Arc, time::Duration};

use {
    tokio::{sync::Mutex, task},
    tracing::{info, warn},
};

use crate::{
    cache::ConnectionCache,
    cdp::{BrowserConnection, CdpConnector, Connector, PageHandle},
    deadline::{Sweeper, deadline},
    error::{PoolError, Result},
    resolve::{TargetResolver, TargetSpec},
    tabs::TabPool,
    types::{LeasedTab, PoolConfig, PoolStats, TabOptions, TabSummary},
};

const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);
const FORCE_SHUTDOWN_BUDGET: Duration = Duration::from_secs(1);

/// Facade over the connection cache, tab pool, and target resolver.
pub struct PoolManager {
    config: PoolConfig,
    connections: Arc<ConnectionCache>,
    tabs: Arc<TabPool>,
    resolver: TargetResolver,
    sweepers: Mutex<Vec<Sweeper>>,
}

impl PoolManager {
    /// Build a pool backed by the real CDP client.
    ///
    /// Must be called from within a tokio runtime: the idle sweeps are
    /// spawned here.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let connector = Arc::new(CdpConnector::new(config.default_op_timeout));
        Self::with_connector(config, connector)
    }

    /// Build a pool with a custom connection backend. This is the seam the
    /// integration tests drive an in-memory browser through.
    #[must_use]
    pub fn with_connector(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let connections = Arc::new(ConnectionCache::new(config.clone(), connector));
        let tabs = Arc::new(TabPool::new(config.clone()));
        let resolver = TargetResolver::new(config.clone(), Arc::clone(&tabs));

        let connection_sweep = {
            let connections = Arc::clone(&connections);
            Sweeper::spawn(
                "connections",
                config.connection_sweep_interval,
                move || {
                    let connections = Arc::clone(&connections);
                    async move {
                        connections.sweep_idle().await;
                    }
                },
            )
        };
        let tab_sweep = {
            let tabs = Arc::clone(&tabs);
            Sweeper::spawn("tabs", config.tab_sweep_interval, move || {
                let tabs = Arc::clone(&tabs);
                async move {
                    tabs.sweep_idle().await;
                }
            })
        };

        Self {
            config,
            connections,
            tabs,
            resolver,
            sweepers: Mutex::new(vec![connection_sweep, tab_sweep]),
        }
    }

    // ── connections ─────────────────────────────────────────────────────

    pub async fn acquire_connection(&self, port: u16) -> Result<Arc<dyn BrowserConnection>> {
        self.connections.acquire(port).await
    }

    pub async fn release_connection(&self, port: u16) {
        self.connections.release(port).await;
    }

    /// Number of cached connections, for diagnostics.
    pub async fn connection_count(&self) -> usize {
        self.connections.len().await
    }

    /// Borrow the connection for `port` around `action`; the release runs
    /// whether or not `action` fails.
    pub async fn with_connection<T, F, Fut>(&self, port: u16, action: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn BrowserConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.connections.with_connection(port, action).await
    }

    // ── managed tabs ────────────────────────────────────────────────────

    /// Check out a managed tab on the default port's browser.
    pub async fn tab(&self, options: TabOptions) -> Result<LeasedTab> {
        let port = self.config.default_port;
        let conn = self.connections.acquire(port).await?;
        let result = self.tabs.get_or_create(&conn, options).await;
        self.connections.release(port).await;
        result
    }

    /// Park a tab for reuse. Safe to call more than once.
    pub async fn release_tab(&self, tab_id: &str) {
        self.tabs.release(tab_id).await;
    }

    pub async fn stats(&self) -> PoolStats {
        self.tabs.stats().await
    }

    pub async fn list_tabs(&self) -> Vec<TabSummary> {
        self.tabs.list().await
    }

    // ── target resolution ───────────────────────────────────────────────

    /// Resolve a target spec to a page handle.
    ///
    /// Conflicting or malformed specs fail before any browser round-trip.
    pub async fn resolve_target(
        &self,
        port: u16,
        spec: &TargetSpec,
    ) -> Result<Arc<dyn PageHandle>> {
        spec.validate()?;
        let conn = self.connections.acquire(port).await?;
        let result = self.resolver.resolve(&conn, spec).await;
        self.connections.release(port).await;
        result
    }

    /// Resolve a target and run `action` against it, with a deadline on
    /// every layer and the connection released on every path.
    pub async fn with_target_page<T, F, Fut>(
        &self,
        port: u16,
        index: Option<usize>,
        unique_id: Option<String>,
        action: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn PageHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let spec = TargetSpec { index, unique_id };
        spec.validate()?;

        deadline(
            self.run_target_action(port, spec, action),
            self.config.overall_budget,
            "the browser operation",
        )
        .await
    }

    async fn run_target_action<T, F, Fut>(
        &self,
        port: u16,
        spec: TargetSpec,
        action: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn PageHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = deadline(
            self.connections.acquire(port),
            self.config.connection_budget,
            "acquiring a browser connection",
        )
        .await
        .map_err(|e| {
            rewrite_timeout(
                e,
                format!("connecting to the browser on port {port}; it may be unresponsive"),
            )
        })?;

        let result = self.resolve_and_act(&conn, spec, action).await;
        self.connections.release(port).await;
        result
    }

    async fn resolve_and_act<T, F, Fut>(
        &self,
        conn: &Arc<dyn BrowserConnection>,
        spec: TargetSpec,
        action: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn PageHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let page = match (spec.index, spec.unique_id.as_deref()) {
            (None, Some(id)) => deadline(
                self.resolver.by_unique_id(conn, id),
                self.config.resolve_id_budget,
                "finding tab by id",
            )
            .await
            .map_err(|e| {
                rewrite_timeout(
                    e,
                    format!(
                        "finding tab with ID {id}; it may not exist or the browser is unresponsive"
                    ),
                )
            })?,
            (Some(index), None) => deadline(
                self.resolver.by_index(conn, index),
                self.config.list_pages_budget,
                "listing tabs",
            )
            .await
            .map_err(|e| rewrite_timeout(e, "listing tabs; the browser may be unresponsive"))?,
            _ => deadline(
                self.resolver.active(conn),
                self.config.list_pages_budget,
                "finding the active tab",
            )
            .await
            .map_err(|e| {
                rewrite_timeout(e, "finding the active tab; the browser may be unresponsive")
            })?,
        };

        // Give the browser's event loop one tick to flush pending work
        // before the action runs; trims "element not interactable yet"
        // flakes.
        task::yield_now().await;

        deadline(action(page), self.config.action_budget, "running the action").await
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Stop the sweeps and close every managed tab and cached connection.
    /// Bounded: a wedged browser cannot hang shutdown.
    pub async fn shutdown(&self) {
        self.stop_sweepers().await;
        let result = deadline(
            async {
                self.tabs.close_all().await;
                self.connections.shutdown().await;
                Ok(())
            },
            SHUTDOWN_BUDGET,
            "shutting down the pool",
        )
        .await;
        if let Err(e) = result {
            warn!(error = %e, "shutdown exceeded its budget, abandoning remaining cleanup");
        }
        info!("pool shut down");
    }

    /// Like [`PoolManager::shutdown`], but drops tab bookkeeping without
    /// closing pages and allows far less time.
    pub async fn force_shutdown(&self) {
        self.stop_sweepers().await;
        let result = deadline(
            async {
                self.tabs.clear().await;
                self.connections.shutdown().await;
                Ok(())
            },
            FORCE_SHUTDOWN_BUDGET,
            "force-shutting down the pool",
        )
        .await;
        if let Err(e) = result {
            warn!(error = %e, "forced shutdown exceeded its budget");
        }
    }

    async fn stop_sweepers(&self) {
        for sweeper in self.sweepers.lock().await.drain(..) {
            sweeper.stop();
        }
    }
}

/// Rewrite a deadline expiry with a human-readable label; every other error
/// passes through verbatim.
fn rewrite_timeout(err: PoolError, label: impl Into<String>) -> PoolError {
    match err {
        PoolError::Timeout { ms, .. } => PoolError::Timeout {
            label: label.into(),
            ms,
        },
        other => other,
    }
}
