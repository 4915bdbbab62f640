//! Pool option, lease, and diagnostics types.

use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::cdp::PageHandle;

/// Options for [`crate::tabs::TabPool::get_or_create`].
#[derive(Debug, Clone, Default)]
pub struct TabOptions {
    /// Logical requester tag (e.g. a test name), kept for diagnostics and
    /// cleared on release.
    pub owner: Option<String>,
    /// URL to navigate to. A reused tab without one is reset to a blank
    /// page instead.
    pub url: Option<String>,
    /// Persistent tabs are exempt from reuse and from every eviction path.
    pub persistent: bool,
}

/// A checked-out managed tab. Hand `tab_id` back via release when done.
pub struct LeasedTab {
    pub tab_id: String,
    pub page: Arc<dyn PageHandle>,
}

impl std::fmt::Debug for LeasedTab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedTab")
            .field("tab_id", &self.tab_id)
            .finish_non_exhaustive()
    }
}

/// Pool diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_tabs: usize,
    pub in_use: usize,
    pub idle: usize,
    pub max_tabs: usize,
    pub idle_timeout_ms: u64,
}

/// One managed tab, as reported by `list_tabs`.
#[derive(Debug, Clone, Serialize)]
pub struct TabSummary {
    pub tab_id: String,
    pub url: Option<String>,
    pub owner: Option<String>,
    pub in_use: bool,
    pub persistent: bool,
    pub age_secs: u64,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Debug port used when a caller does not name one.
    pub default_port: u16,
    /// Maximum cached connections across all ports.
    pub max_connections: usize,
    /// Budget for establishing a new connection.
    pub connect_timeout: Duration,
    /// Per-operation timeout applied to everything sent over a connection.
    pub default_op_timeout: Duration,
    /// Idle connections older than this are dropped by the sweep.
    pub connection_idle_timeout: Duration,
    pub connection_sweep_interval: Duration,
    /// Ceiling on tabs open in the browser, counting tabs the pool did not
    /// create itself.
    pub max_tabs: usize,
    /// Idle non-persistent tabs older than this are closed by the sweep.
    pub tab_idle_timeout: Duration,
    pub tab_sweep_interval: Duration,
    /// How many of the most recently created pages the fallback id scan
    /// probes.
    pub scan_window: usize,
    /// Per-page budget for fetching a unique id during the fallback scan.
    pub id_probe_timeout: Duration,
    /// Deadline for acquiring a connection inside the composed operation.
    pub connection_budget: Duration,
    /// Deadline for resolving a target by unique id.
    pub resolve_id_budget: Duration,
    /// Deadline for listing pages (index and active-page resolution).
    pub list_pages_budget: Duration,
    /// Deadline for the caller's action.
    pub action_budget: Duration,
    /// Outer deadline over the whole composed operation; larger than the
    /// sum of the inner steps so a hang anywhere still surfaces.
    pub overall_budget: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&tabctl_config::schema::PoolSection::default())
    }
}

impl From<&tabctl_config::schema::PoolSection> for PoolConfig {
    fn from(cfg: &tabctl_config::schema::PoolSection) -> Self {
        Self {
            default_port: cfg.default_port,
            max_connections: cfg.connections.max_connections,
            connect_timeout: Duration::from_millis(cfg.connections.connect_timeout_ms),
            default_op_timeout: Duration::from_millis(cfg.connections.default_op_timeout_ms),
            connection_idle_timeout: Duration::from_secs(cfg.connections.idle_timeout_secs),
            connection_sweep_interval: Duration::from_secs(cfg.connections.sweep_interval_secs),
            max_tabs: cfg.tabs.max_tabs,
            tab_idle_timeout: Duration::from_secs(cfg.tabs.idle_timeout_secs),
            tab_sweep_interval: Duration::from_secs(cfg.tabs.sweep_interval_secs),
            scan_window: cfg.targets.scan_window,
            id_probe_timeout: Duration::from_millis(cfg.targets.id_probe_timeout_ms),
            connection_budget: Duration::from_millis(cfg.budgets.connection_ms),
            resolve_id_budget: Duration::from_millis(cfg.budgets.resolve_id_ms),
            list_pages_budget: Duration::from_millis(cfg.budgets.list_pages_ms),
            action_budget: Duration::from_millis(cfg.budgets.action_ms),
            overall_budget: Duration::from_millis(cfg.budgets.overall_ms),
        }
    }
}
