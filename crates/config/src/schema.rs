//! Config schema types for the connection and tab pool.
use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TabctlConfig {
    pub pool: PoolSection,
}

/// Connection and tab pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Debug port used when a command does not name one.
    pub default_port: u16,
    pub connections: ConnectionSection,
    pub tabs: TabSection,
    pub targets: TargetSection,
    pub budgets: BudgetSection,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            default_port: 9222,
            connections: ConnectionSection::default(),
            tabs: TabSection::default(),
            targets: TargetSection::default(),
            budgets: BudgetSection::default(),
        }
    }
}

/// Cached-connection behavior (one connection per debug port).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Maximum number of cached connections across all ports.
    pub max_connections: usize,
    /// Budget for establishing a new connection.
    pub connect_timeout_ms: u64,
    /// Per-operation timeout applied to everything sent over a connection.
    pub default_op_timeout_ms: u64,
    /// Idle connections older than this are dropped by the sweep.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_ms: 5000,
            default_op_timeout_ms: 5000,
            idle_timeout_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

/// Managed-tab pool behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabSection {
    /// Ceiling on tabs open in the browser, counting tabs the pool did not
    /// create itself.
    pub max_tabs: usize,
    /// Idle non-persistent tabs older than this are closed by the sweep.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for TabSection {
    fn default() -> Self {
        Self {
            max_tabs: 20,
            idle_timeout_secs: 120,
            sweep_interval_secs: 30,
        }
    }
}

/// Target-resolution behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSection {
    /// How many of the most recently created pages the fallback id scan
    /// probes.
    pub scan_window: usize,
    /// Per-page budget for fetching a unique id during the fallback scan.
    pub id_probe_timeout_ms: u64,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            scan_window: 10,
            id_probe_timeout_ms: 100,
        }
    }
}

/// Deadlines for the composed target-page operation. The overall budget is
/// deliberately larger than the sum of the inner steps so a hang in any
/// layer still surfaces as a timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub connection_ms: u64,
    pub resolve_id_ms: u64,
    pub list_pages_ms: u64,
    pub action_ms: u64,
    pub overall_ms: u64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            connection_ms: 10_000,
            resolve_id_ms: 5_000,
            list_pages_ms: 3_000,
            action_ms: 30_000,
            overall_ms: 35_000,
        }
    }
}
