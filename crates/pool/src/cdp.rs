//! Collaborator seam over the CDP client.
//!
//! The pool never speaks the wire protocol itself. It drives the traits
//! below, implemented in production by [`CdpConnector`] on top of
//! chromiumoxide, and by in-memory fakes in the integration tests.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    chromiumoxide::{Browser, Page, handler::HandlerConfig},
    futures::StreamExt,
    serde::Deserialize,
    tokio::{sync::Mutex, task::JoinHandle},
    tracing::debug,
};

use crate::error::{PoolError, Result};

/// Establishes connections to a debug-enabled browser.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, port: u16) -> Result<Arc<dyn BrowserConnection>>;
}

/// A live connection to one browser process.
#[async_trait]
pub trait BrowserConnection: Send + Sync {
    /// Cheap liveness probe. Failure means the entry must be discarded,
    /// not repaired.
    async fn probe(&self) -> Result<()>;

    /// Browsing contexts in creation order.
    async fn contexts(&self) -> Result<Vec<Arc<dyn BrowsingContext>>>;

    /// Create a fresh browsing context.
    async fn create_context(&self) -> Result<Arc<dyn BrowsingContext>>;

    /// Drop the connection. Never terminates the browser process, whose
    /// lifetime belongs to whoever launched it.
    async fn disconnect(&self);
}

/// An isolated browsing session holding zero or more pages.
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    /// Pages in creation order.
    async fn pages(&self) -> Result<Vec<Arc<dyn PageHandle>>>;

    async fn create_page(&self, url: Option<&str>) -> Result<Arc<dyn PageHandle>>;

    /// Close the context. Best-effort; the browser's default context
    /// refuses silently.
    async fn close(&self) -> Result<()>;
}

/// A single tab.
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Last known URL, when the browser can report one.
    async fn url(&self) -> Result<Option<String>>;

    /// Stable target id when the client can provide one without a
    /// round-trip. Callers fall back to a derived id when absent.
    fn stable_id(&self) -> Option<String>;

    /// Authoritative unique id; may round-trip to the browser.
    async fn unique_id(&self) -> Result<String>;

    async fn close(&self) -> Result<()>;
}

// ── chromiumoxide-backed implementation ─────────────────────────────────────

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Production connector: discovers the WebSocket endpoint advertised on the
/// debug port and attaches a chromiumoxide client to it.
pub struct CdpConnector {
    default_op_timeout: Duration,
}

impl CdpConnector {
    pub fn new(default_op_timeout: Duration) -> Self {
        Self { default_op_timeout }
    }

    /// Resolve the WebSocket endpoint via `/json/version`.
    async fn discover_ws(port: u16) -> Result<String> {
        let url = format!("http://127.0.0.1:{port}/json/version");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| PoolError::Cdp(format!("http client: {e}")))?;

        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|_| PoolError::Unreachable { port })?;
        if !resp.status().is_success() {
            return Err(PoolError::Unreachable { port });
        }

        let info: VersionInfo = resp
            .json()
            .await
            .map_err(|e| PoolError::Cdp(format!("bad /json/version payload: {e}")))?;
        Ok(info.web_socket_debugger_url)
    }
}

#[async_trait]
impl Connector for CdpConnector {
    async fn connect(&self, port: u16) -> Result<Arc<dyn BrowserConnection>> {
        let ws_url = Self::discover_ws(port).await?;
        debug!(port, ws_url, "attaching to browser");

        let handler_config = HandlerConfig {
            request_timeout: self.default_op_timeout,
            ..Default::default()
        };
        let (browser, mut handler) = Browser::connect_with_config(&ws_url, handler_config)
            .await
            .map_err(|_| PoolError::Unreachable { port })?;

        // Drain browser events so the connection makes progress.
        let drain = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                debug!(port, ?event, "browser event");
            }
            debug!(port, "browser event stream closed");
        });

        Ok(Arc::new(CdpConnection {
            port,
            browser: Arc::new(browser),
            drain: Mutex::new(Some(drain)),
        }))
    }
}

struct CdpConnection {
    port: u16,
    browser: Arc<Browser>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrowserConnection for CdpConnection {
    async fn probe(&self) -> Result<()> {
        self.browser.version().await?;
        Ok(())
    }

    async fn contexts(&self) -> Result<Vec<Arc<dyn BrowsingContext>>> {
        // Chromium's flat target view surfaces the default browsing context
        // only; every page reachable over this connection lives there.
        Ok(vec![Arc::new(CdpContext {
            browser: Arc::clone(&self.browser),
        }) as Arc<dyn BrowsingContext>])
    }

    async fn create_context(&self) -> Result<Arc<dyn BrowsingContext>> {
        Ok(Arc::new(CdpContext {
            browser: Arc::clone(&self.browser),
        }))
    }

    async fn disconnect(&self) {
        if let Some(drain) = self.drain.lock().await.take() {
            drain.abort();
        }
        debug!(port = self.port, "disconnected from browser");
    }
}

struct CdpContext {
    browser: Arc<Browser>,
}

#[async_trait]
impl BrowsingContext for CdpContext {
    async fn pages(&self) -> Result<Vec<Arc<dyn PageHandle>>> {
        let pages = self.browser.pages().await?;
        Ok(pages
            .into_iter()
            .map(|page| Arc::new(CdpPage { page }) as Arc<dyn PageHandle>)
            .collect())
    }

    async fn create_page(&self, url: Option<&str>) -> Result<Arc<dyn PageHandle>> {
        let page = self.browser.new_page(url.unwrap_or("about:blank")).await?;
        Ok(Arc::new(CdpPage { page }))
    }

    async fn close(&self) -> Result<()> {
        // Closing the default context would mean closing the browser, which
        // the pool never does.
        Ok(())
    }
}

struct CdpPage {
    page: Page,
}

#[async_trait]
impl PageHandle for CdpPage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn url(&self) -> Result<Option<String>> {
        Ok(self.page.url().await?)
    }

    fn stable_id(&self) -> Option<String> {
        Some(self.page.target_id().as_ref().to_string())
    }

    async fn unique_id(&self) -> Result<String> {
        Ok(self.page.target_id().as_ref().to_string())
    }

    async fn close(&self) -> Result<()> {
        self.page.clone().close().await?;
        Ok(())
    }
}
