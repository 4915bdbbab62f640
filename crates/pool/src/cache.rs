//! Cached CDP connections keyed by debug port.
//!
//! One live connection per port. Entries are probed before reuse, so a
//! connection killed outside the pool's knowledge self-heals on the next
//! acquire instead of producing silent failures.

use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::Instant,
};

use {
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    cdp::{BrowserConnection, Connector},
    deadline::deadline,
    error::{PoolError, Result},
    types::PoolConfig,
};

struct Entry {
    conn: Arc<dyn BrowserConnection>,
    last_used: Instant,
    in_use: bool,
}

/// Bounded cache of live browser connections.
pub struct ConnectionCache {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    /// Guards every structural change; held across the probe/connect
    /// suspension points so acquire is atomic from the caller's view.
    entries: Mutex<HashMap<u16, Entry>>,
}

impl ConnectionCache {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Borrow the connection for `port`, creating one if needed.
    ///
    /// A cached entry is only handed out after a liveness probe; a dead
    /// entry is discarded and replaced. At capacity, the least-recently-used
    /// idle entry is evicted; with nothing evictable the call fails with
    /// [`PoolError::PoolExhausted`].
    pub async fn acquire(&self, port: u16) -> Result<Arc<dyn BrowserConnection>> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&port) {
            if entry.conn.probe().await.is_ok() {
                entry.in_use = true;
                entry.last_used = Instant::now();
                debug!(port, "reusing cached connection");
                return Ok(Arc::clone(&entry.conn));
            }
            warn!(port, "cached connection failed probe, discarding");
            if let Some(dead) = entries.remove(&port) {
                dead.conn.disconnect().await;
            }
        }

        if entries.len() >= self.config.max_connections {
            let victim = entries
                .iter()
                .filter(|(_, entry)| !entry.in_use)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(port, _)| *port);
            match victim {
                Some(victim) => {
                    if let Some(evicted) = entries.remove(&victim) {
                        evicted.conn.disconnect().await;
                        info!(port = victim, "evicted least-recently-used idle connection");
                    }
                },
                None => {
                    return Err(PoolError::PoolExhausted(format!(
                        "all {} cached connections are in use",
                        self.config.max_connections
                    )));
                },
            }
        }

        let conn = deadline(
            self.connector.connect(port),
            self.config.connect_timeout,
            "connecting to browser",
        )
        .await
        .map_err(|e| {
            warn!(port, error = %e, "connection attempt failed");
            PoolError::Unreachable { port }
        })?;

        entries.insert(port, Entry {
            conn: Arc::clone(&conn),
            last_used: Instant::now(),
            in_use: true,
        });
        info!(port, "connected to browser");
        Ok(conn)
    }

    /// Return the connection for `port` to the cache.
    ///
    /// Best-effort: browsing contexts left empty during the borrow are
    /// closed, and a connection that can no longer even list its contexts
    /// is removed instead of marked free.
    pub async fn release(&self, port: u16) {
        let conn = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&port) else {
                return;
            };
            entry.in_use = false;
            entry.last_used = Instant::now();
            Arc::clone(&entry.conn)
        };

        match conn.contexts().await {
            Ok(contexts) => {
                for context in contexts {
                    if let Ok(pages) = context.pages().await
                        && pages.is_empty()
                        && let Err(e) = context.close().await
                    {
                        debug!(port, error = %e, "failed to close empty context");
                    }
                }
                debug!(port, "released connection");
            },
            Err(e) => {
                warn!(port, error = %e, "connection unhealthy on release, removing");
                let mut entries = self.entries.lock().await;
                if let Some(dead) = entries.remove(&port) {
                    dead.conn.disconnect().await;
                }
            },
        }
    }

    /// Acquire, run `action`, and release no matter how `action` fares.
    pub async fn with_connection<T, F, Fut>(&self, port: u16, action: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn BrowserConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.acquire(port).await?;
        let result = action(conn).await;
        self.release(port).await;
        result
    }

    /// Drop every idle entry older than the idle threshold. In-use entries
    /// are never touched.
    pub async fn sweep_idle(&self) {
        let mut entries = self.entries.lock().await;
        let stale: Vec<u16> = entries
            .iter()
            .filter(|(_, entry)| {
                !entry.in_use && entry.last_used.elapsed() > self.config.connection_idle_timeout
            })
            .map(|(port, _)| *port)
            .collect();

        for port in stale {
            if let Some(entry) = entries.remove(&port) {
                entry.conn.disconnect().await;
                info!(port, "dropped idle connection");
            }
        }
    }

    /// Disconnect and forget everything.
    pub async fn shutdown(&self) {
        let drained: Vec<(u16, Entry)> = {
            let mut entries = self.entries.lock().await;
            entries.drain().collect()
        };
        for (port, entry) in drained {
            entry.conn.disconnect().await;
            debug!(port, "disconnected during shutdown");
        }
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Whether the entry for `port` is currently checked out. `None` when
    /// no entry exists.
    pub async fn in_use(&self, port: u16) -> Option<bool> {
        self.entries.lock().await.get(&port).map(|entry| entry.in_use)
    }
}
