//! Exclusive rendering sessions for stateful collectors.
//!
//! A session is a real browser driven over the W3C WebDriver protocol.
//! Sessions are scoped: `SessionLease` releases on `release().await`
//! and, if the owning future is dropped first (timeout, interrupt),
//! abandons the session from `Drop`.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::task::TaskTracker;

use crate::config::WebDriverConfig;
use crate::error::CollectError;
use crate::metrics::{METRICS, RuntimeMetrics};

/// What a stateful collector asks the browser for.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub url: &'a str,
    /// CSS selector that must be present before the page is read
    pub ready_selector: &'a str,
    /// Extra wait after the selector appears (late client-side rendering)
    pub settle: Duration,
}

#[async_trait::async_trait]
pub trait RenderSession: Send {
    /// Load `req.url` and return the rendered page source.
    async fn render(&mut self, req: RenderRequest<'_>) -> Result<String, CollectError>;

    /// Orderly shutdown.
    async fn close(&mut self) -> Result<(), CollectError>;

    /// Best-effort synchronous teardown, used from `Drop`.
    fn abandon(&mut self);
}

#[async_trait::async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self) -> Result<Box<dyn RenderSession>, CollectError>;
}

/// Background teardowns started by `abandon`.
static TEARDOWNS: Lazy<TaskTracker> = Lazy::new(TaskTracker::new);

/// Waits up to `grace` for abandoned sessions to finish shutting down.
/// Returns false if some were still running.
pub async fn finish_teardowns(grace: Duration) -> bool {
    TEARDOWNS.close();
    if TEARDOWNS.is_empty() {
        return true;
    }
    info!("waiting for {} rendering session teardowns", TEARDOWNS.len());
    timeout(grace, TEARDOWNS.wait()).await.is_ok()
}

// ------------------------------------------------------------
// Lease
// ------------------------------------------------------------

/// Owns one session for the duration of one stateful invocation.
pub struct SessionLease {
    inner: Option<Box<dyn RenderSession>>,
    source_id: String,
}

impl SessionLease {
    pub async fn acquire(
        provider: &dyn SessionProvider,
        source_id: &str,
    ) -> Result<Self, CollectError> {
        let session = provider.open().await?;
        RuntimeMetrics::incr(&METRICS.sessions_opened);
        debug!("[{source_id}] rendering session opened");
        Ok(Self {
            inner: Some(session),
            source_id: source_id.to_string(),
        })
    }

    pub fn session(&mut self) -> Result<&mut dyn RenderSession, CollectError> {
        match self.inner.as_deref_mut() {
            Some(s) => Ok(s),
            None => Err(CollectError::SessionResource("session already released".into())),
        }
    }

    /// Closes the session. Errors are logged, not returned: the
    /// observation (if any) is already in hand.
    pub async fn release(mut self) {
        if let Some(mut session) = self.inner.take() {
            if let Err(e) = session.close().await {
                warn!("[{}] closing rendering session failed: {e}", self.source_id);
                session.abandon();
            }
            RuntimeMetrics::incr(&METRICS.sessions_released);
            debug!("[{}] rendering session released", self.source_id);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(mut session) = self.inner.take() {
            warn!("[{}] rendering session abandoned (cancelled)", self.source_id);
            session.abandon();
            RuntimeMetrics::incr(&METRICS.sessions_abandoned);
        }
    }
}

// ------------------------------------------------------------
// WebDriver
// ------------------------------------------------------------

/// Opens browser sessions against a WebDriver server.
///
/// With `command` configured, each session gets its own driver
/// process (spawned with `kill_on_drop`), so no browser outlives it.
pub struct WebDriverProvider {
    cfg: WebDriverConfig,
    http: reqwest::Client,
}

impl WebDriverProvider {
    pub fn new(cfg: WebDriverConfig) -> reqwest::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.page_load_timeout_secs + 10))
            .build()?;
        Ok(Arc::new(Self { cfg, http }))
    }

    fn base(&self) -> &str {
        self.cfg.url.trim_end_matches('/')
    }

    fn spawn_driver(&self, command: &str) -> Result<Child, CollectError> {
        let port = reqwest::Url::parse(&self.cfg.url)
            .ok()
            .and_then(|u| u.port_or_known_default())
            .unwrap_or(9515);

        Command::new(command)
            .arg(format!("--port={port}"))
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| CollectError::SessionResource(format!("spawning {command}: {e}")))
    }

    async fn wait_ready(&self) -> Result<(), CollectError> {
        let deadline = Instant::now() + Duration::from_secs(self.cfg.startup_timeout_secs);
        loop {
            let ready = match self.http.get(format!("{}/status", self.base())).send().await {
                Ok(resp) => resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v["value"]["ready"].as_bool())
                    .unwrap_or(false),
                Err(_) => false,
            };
            if ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CollectError::SessionResource(
                    "webdriver did not become ready".into(),
                ));
            }
            sleep(Duration::from_millis(250)).await;
        }
    }
}

#[async_trait::async_trait]
impl SessionProvider for WebDriverProvider {
    async fn open(&self) -> Result<Box<dyn RenderSession>, CollectError> {
        let driver = match &self.cfg.command {
            Some(cmd) => Some(self.spawn_driver(cmd)?),
            None => None,
        };
        // `driver` is killed on drop if anything below fails
        self.wait_ready().await?;

        let caps = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": self.cfg.args }
                }
            }
        });
        let url = format!("{}/session", self.base());
        let v = webdriver_call(self.http.post(url).json(&caps)).await?;
        let id = v["sessionId"]
            .as_str()
            .ok_or_else(|| CollectError::SessionResource("no sessionId in response".into()))?
            .to_string();

        let mut session = WebDriverSession {
            http: self.http.clone(),
            endpoint: format!("{}/session/{}", self.base(), id),
            element_wait: Duration::from_secs(self.cfg.element_wait_secs),
            driver,
            closed: false,
        };

        let timeouts = json!({ "pageLoad": self.cfg.page_load_timeout_secs * 1000 });
        let url = format!("{}/timeouts", session.endpoint);
        if let Err(e) = webdriver_call(session.http.post(url).json(&timeouts)).await {
            session.abandon();
            return Err(e);
        }

        info!("webdriver session {id} started");
        Ok(Box::new(session))
    }
}

pub struct WebDriverSession {
    http: reqwest::Client,
    /// `{base}/session/{id}`
    endpoint: String,
    element_wait: Duration,
    driver: Option<Child>,
    closed: bool,
}

impl WebDriverSession {
    async fn wait_for(&self, selector: &str) -> Result<(), CollectError> {
        let deadline = Instant::now() + self.element_wait;
        let body = json!({ "using": "css selector", "value": selector });
        loop {
            let url = format!("{}/element", self.endpoint);
            match webdriver_call(self.http.post(url).json(&body)).await {
                Ok(_) => return Ok(()),
                Err(CollectError::Unreachable(e)) => return Err(CollectError::Unreachable(e)),
                Err(_) if Instant::now() < deadline => sleep(Duration::from_millis(500)).await,
                Err(_) => {
                    return Err(CollectError::StructureNotRecognized(format!(
                        "'{selector}' did not appear within {:?}",
                        self.element_wait
                    )));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl RenderSession for WebDriverSession {
    async fn render(&mut self, req: RenderRequest<'_>) -> Result<String, CollectError> {
        let url = format!("{}/url", self.endpoint);
        webdriver_call(self.http.post(url).json(&json!({ "url": req.url }))).await?;
        self.wait_for(req.ready_selector).await?;
        if !req.settle.is_zero() {
            sleep(req.settle).await;
        }

        let v = webdriver_call(self.http.get(format!("{}/source", self.endpoint))).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| CollectError::SessionResource("page source was not a string".into()))
    }

    async fn close(&mut self) -> Result<(), CollectError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let res = webdriver_call(self.http.delete(self.endpoint.clone())).await.map(|_| ());
        if let Some(mut child) = self.driver.take() {
            let _ = child.kill().await;
        }
        res
    }

    fn abandon(&mut self) {
        let driver = self.driver.take();
        let handle = tokio::runtime::Handle::try_current();

        match (self.closed, handle) {
            (false, Ok(handle)) => {
                self.closed = true;
                let req = self.http.delete(self.endpoint.clone());
                // the driver must outlive the DELETE, or the browser is orphaned
                let teardown = async move {
                    let _ = req.send().await;
                    if let Some(mut child) = driver {
                        let _ = child.kill().await;
                    }
                };
                TEARDOWNS.spawn_on(teardown, &handle);
            }
            _ => {
                self.closed = true;
                if let Some(mut child) = driver {
                    let _ = child.start_kill();
                }
            }
        }
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Sends one WebDriver command and unwraps the `value` member.
///
/// WebDriver reports command failures as `{"value": {"error": ...}}`
/// with a non-2xx status; those become `SessionResource`.
async fn webdriver_call(req: reqwest::RequestBuilder) -> Result<Value, CollectError> {
    let resp = req.send().await?;
    let status = resp.status();
    let body: Value = resp.json().await?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);

    if !status.is_success() {
        let err = value["error"].as_str().unwrap_or("unknown error");
        let msg = value["message"].as_str().unwrap_or_default();
        return Err(CollectError::SessionResource(format!("{status}: {err} {msg}")));
    }
    Ok(value)
}
