//! Browser pool
//!
//! Owns one long-lived headless browser and vends isolated page sessions with
//! device emulation, user-agent, and extra-header overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cdp::{launch_browser, Connection, Session, Transport};
use crate::error::{Error, Result};
use crate::{DeviceType, SnifferConfig};

/// Default desktop user agent
pub const PC_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Default mobile user agent, paired with the iPhone-X-class emulation profile
pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

/// iPhone X viewport: width, height, device scale factor
const MOBILE_VIEWPORT: (u32, u32, f64) = (375, 812, 3.0);

/// Locate a Chrome/Chromium binary in the usual install locations
pub fn find_browser() -> Result<PathBuf> {
    let candidates = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ]
    } else if cfg!(target_os = "windows") {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        vec![]
    };

    for candidate in candidates {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    Err(Error::BrowserNotFound)
}

/// Launch arguments. These reduce noise and flakiness, not security: the
/// deployment model is a trusted container, so the sandbox is explicitly off.
fn launch_args(config: &SnifferConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        // Keep background pages and timers from throttling the sniff
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-renderer-backgrounding",
        "--disable-background-networking",
        "--disable-ipc-flooding-protection",
        // No extensions, sync, translation, or default apps
        "--disable-extensions",
        "--disable-component-extensions-with-background-pages",
        "--disable-default-apps",
        "--disable-sync",
        "--disable-features=TranslateUI,AutomationControlled",
        "--disable-blink-features=AutomationControlled",
        // Quiet first-run and reporting machinery
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-breakpad",
        "--disable-client-side-phishing-detection",
        "--disable-hang-monitor",
        "--disable-popup-blocking",
        "--disable-prompt-on-repost",
        "--metrics-recording-only",
        "--password-store=basic",
        "--use-mock-keychain",
        // Trusted-container deployment model
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-web-security",
        "--disable-dev-shm-usage",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    if config.headless {
        args.push("--headless=new".into());
    }

    args
}

/// What a session needs from its page before navigation
#[derive(Debug, Clone, Default)]
pub struct PageSpec {
    /// Desktop page; otherwise the mobile emulation profile is installed
    pub is_pc: bool,
    /// Extra headers sent with every request from the page
    pub headers: HashMap<String, String>,
}

/// An allocated page, scoped strictly to one session
pub struct PageHandle {
    pub session: Arc<Session>,
}

/// One long-lived browser shared by any number of sessions
pub struct BrowserPool {
    connection: Connection,
    config_user_agent: Option<String>,
    user_data_dir: PathBuf,
}

impl BrowserPool {
    /// Launch the browser process and connect to it
    pub async fn launch(config: &SnifferConfig) -> Result<Self> {
        let user_data_dir =
            std::env::temp_dir().join(format!("truffler-browser-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&user_data_dir);
        std::fs::create_dir_all(&user_data_dir)?;

        let browser_path = match &config.browser_path {
            Some(path) => PathBuf::from(path),
            None => find_browser()?,
        };

        let mut args = launch_args(config);
        args.push(format!("--user-data-dir={}", user_data_dir.display()));

        tracing::info!("Launching browser from {:?}", browser_path);
        let (child, ws_url) = launch_browser(&browser_path, &args)?;

        let transport = Transport::connect(child, &ws_url)?;
        let connection = Connection::new(transport);

        let version = connection.version().await?;
        tracing::info!("Connected to browser: {}", version.product);

        Ok(Self {
            connection,
            config_user_agent: config.user_agent.clone(),
            user_data_dir,
        })
    }

    /// Allocate a fresh page with the session's overrides applied.
    ///
    /// Emulation and header failures are logged, not fatal: a page without
    /// the override can still sniff.
    pub async fn page(&self, spec: &PageSpec) -> Result<PageHandle> {
        let target_id = self.connection.create_target("about:blank").await?;
        let session = Arc::new(self.connection.attach_to_target(&target_id).await?);
        session.page_enable().await?;

        if !spec.is_pc {
            let (width, height, scale) = MOBILE_VIEWPORT;
            if let Err(e) = session.emulate_mobile(width, height, scale).await {
                tracing::debug!("Device emulation failed: {}", e);
            }
        }

        let user_agent = match &self.config_user_agent {
            Some(ua) if !ua.is_empty() => ua.clone(),
            _ if spec.is_pc => PC_USER_AGENT.to_string(),
            _ => MOBILE_USER_AGENT.to_string(),
        };
        if let Err(e) = session.set_user_agent(&user_agent).await {
            tracing::debug!("User agent override failed: {}", e);
        }

        if !spec.headers.is_empty() {
            if let Err(e) = session.set_extra_headers(&spec.headers).await {
                tracing::debug!("Extra headers failed: {}", e);
            }
        }

        Ok(PageHandle { session })
    }

    /// Close a page. Runs on every exit path of a session.
    pub async fn close_page(&self, page: &PageHandle) {
        page.session.unsubscribe_events().await;
        if let Err(e) = self.connection.close_target(page.session.target_id()).await {
            tracing::debug!("Failed to close page: {}", e);
        }
    }

    /// Close the browser process. Only called on orderly shutdown.
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await?;
        let _ = std::fs::remove_dir_all(&self.user_data_dir);
        Ok(())
    }
}

/// Resolve the effective device for a session: a `is_pc` request forces
/// desktop, otherwise the configured default applies
pub fn effective_is_pc(config: &SnifferConfig, requested_pc: bool) -> bool {
    requested_pc || config.device_type == DeviceType::Pc
}
