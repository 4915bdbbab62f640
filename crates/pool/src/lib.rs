//! Pooled CDP connections and reusable tabs for driving a running Chromium.
//!
//! A CLI that issues one browser action per invocation cannot afford a full
//! CDP handshake per command, nor tabs leaking between commands. This crate
//! keeps one cached connection per debug port (probed before reuse, LRU
//! evicted at capacity) and a bounded pool of reusable tabs (idle-swept,
//! ownership-tagged), and resolves "tab at index N" / "tab with id X" /
//! "the active page" to a concrete page handle under layered deadlines.
//!
//! # Example
//!
//! ```ignore
//! use tabctl_pool::{PoolConfig, PoolManager};
//!
//! let pool = PoolManager::new(PoolConfig::default());
//! let title = pool
//!     .with_target_page(9222, None, None, |page| async move {
//!         page.navigate("https://example.com").await?;
//!         page.url().await
//!     })
//!     .await?;
//! pool.shutdown().await;
//! ```

pub mod cache;
pub mod cdp;
pub mod deadline;
pub mod error;
pub mod manager;
pub mod resolve;
pub mod tabs;
pub mod types;

pub use {
    error::{PoolError, Result},
    manager::PoolManager,
    resolve::TargetSpec,
    types::{LeasedTab, PoolConfig, PoolStats, TabOptions, TabSummary},
};
