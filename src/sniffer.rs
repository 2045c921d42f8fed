//! Sniff orchestration
//!
//! `Sniffer` owns the browser pool and the HEAD prober and exposes the two
//! operations: `sniff_media_url` (watch a page's network requests for media
//! URLs) and `fetch_rendered_source` (navigate, run scripts, dump the DOM).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::browser::{effective_is_pc, BrowserPool, PageHandle, PageSpec};
use crate::cdp::Session;
use crate::classify::{self, SessionPredicate};
use crate::error::Result;
use crate::intercept::{run_router, InterceptRouter};
use crate::probe::HeadProber;
use crate::result::{PageSourceResult, SniffResult};
use crate::session::{effective_timeout_ms, CancelScope, SessionState, SniffMode, HARD_TIMEOUT_MS};
use crate::SnifferConfig;

/// Per-request sniff options
#[derive(Debug, Clone)]
pub struct SnifferOptions {
    /// Termination mode: first hit or full budget
    pub mode: SniffMode,
    /// Extra media pattern, case-insensitive multi-line; empty disables
    pub custom_regex: String,
    /// Pattern whose matches are suppressed (but still forwarded); empty disables
    pub sniffer_exclude: String,
    /// Requested budget in milliseconds, clamped per mode
    pub timeout_ms: u64,
    /// CSS selector to await after load; empty skips
    pub css: String,
    /// Desktop page instead of the mobile profile
    pub is_pc: bool,
    /// Extra headers (names lowercased by the caller) sent with every request
    pub headers: HashMap<String, String>,
    /// Page script, injected after navigation behind a document-ready poller
    pub script: String,
    /// Init script, run on every new document before page scripts
    pub init_script: String,
}

impl Default for SnifferOptions {
    fn default() -> Self {
        Self {
            mode: SniffMode::FirstHit,
            custom_regex: String::new(),
            sniffer_exclude: String::new(),
            timeout_ms: 10_000,
            css: String::new(),
            is_pc: false,
            headers: HashMap::new(),
            script: String::new(),
            init_script: String::new(),
        }
    }
}

/// The sniffing engine. One browser process outlives any number of sessions.
pub struct Sniffer {
    config: SnifferConfig,
    prober: Arc<HeadProber>,
    browser: Mutex<Option<Arc<BrowserPool>>>,
}

impl Sniffer {
    pub fn new(config: SnifferConfig) -> Self {
        let prober = Arc::new(HeadProber::new(
            config.head_timeout_ms,
            config.head_probe_concurrency,
        ));
        Self {
            config,
            prober,
            browser: Mutex::new(None),
        }
    }

    /// Launch the browser now instead of on the first sniff
    pub async fn init(&self) -> Result<()> {
        self.ensure_browser().await.map(|_| ())
    }

    /// Has the browser been launched?
    pub async fn is_initialized(&self) -> bool {
        self.browser.lock().await.is_some()
    }

    /// Close the browser. Safe to call without a prior init.
    pub async fn close(&self) {
        if let Some(browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                tracing::warn!("Browser close failed: {}", e);
            } else {
                tracing::info!("Browser closed");
            }
        }
    }

    async fn ensure_browser(&self) -> Result<Arc<BrowserPool>> {
        let mut guard = self.browser.lock().await;
        if let Some(browser) = guard.as_ref() {
            return Ok(Arc::clone(browser));
        }
        let browser = Arc::new(BrowserPool::launch(&self.config).await?);
        *guard = Some(Arc::clone(&browser));
        Ok(browser)
    }

    // =========================================================================
    // Media sniff
    // =========================================================================

    /// Drive `play_url` in a fresh page and return the media URL(s) its
    /// network requests reveal.
    ///
    /// Operational failures come back as results with non-200 codes; only a
    /// browser launch/connect failure is an `Err`.
    pub async fn sniff_media_url(
        &self,
        play_url: &str,
        options: &SnifferOptions,
    ) -> Result<SniffResult> {
        let started = Instant::now();

        if !classify::is_valid_url(play_url) {
            return Ok(SniffResult::rejected(
                400,
                "invalid URL",
                play_url,
                started.elapsed().as_millis(),
                &options.script,
                &options.init_script,
            ));
        }

        let browser = self.ensure_browser().await?;

        let spec = PageSpec {
            is_pc: effective_is_pc(&self.config, options.is_pc),
            headers: options.headers.clone(),
        };
        let page = match browser.page(&spec).await {
            Ok(page) => page,
            Err(e) => {
                return Ok(SniffResult::rejected(
                    500,
                    format!("failed to create page: {e}"),
                    play_url,
                    started.elapsed().as_millis(),
                    &options.script,
                    &options.init_script,
                ))
            }
        };

        let result = self.run_sniff(&page, play_url, options, started).await;
        browser.close_page(&page).await;
        Ok(result)
    }

    async fn run_sniff(
        &self,
        page: &PageHandle,
        play_url: &str,
        options: &SnifferOptions,
        started: Instant,
    ) -> SniffResult {
        let budget = effective_timeout_ms(&self.config, options.mode, options.timeout_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(budget);

        let state = Arc::new(SessionState::new(options.mode));
        let router = Arc::new(InterceptRouter::new(
            Arc::clone(&state),
            Arc::clone(&self.prober),
            SessionPredicate::compile(&options.custom_regex, "custom_regex"),
            SessionPredicate::compile(&options.sniffer_exclude, "sniffer_exclude"),
            play_url.to_string(),
        ));

        // Subscribe before enabling interception so no paused request is lost
        let events = page.session.subscribe_events().await;
        if let Err(e) = page.session.fetch_enable().await {
            tracing::warn!("Request interception unavailable: {}", e);
        }
        tokio::spawn(run_router(router, Arc::clone(&page.session), events));

        if !options.init_script.is_empty() {
            tracing::debug!("Registering init script");
            if let Err(e) = page.session.add_init_script(&options.init_script).await {
                tracing::debug!("Init script registration failed: {}", e);
            }
        }

        // Navigation is optimistic: a sniff can still succeed from partial
        // loads, e.g. redirects that fire the media request before `load`.
        match tokio::time::timeout_at(deadline, page.session.navigate(play_url)).await {
            Ok(Ok(nav)) => {
                if let Some(reason) = nav.error_text {
                    tracing::debug!("Navigation failed: {}", reason);
                }
            }
            Ok(Err(e)) => tracing::debug!("Navigation failed: {}", e),
            Err(_) => tracing::debug!("Navigation did not settle within the budget"),
        }
        wait_for_load(&page.session, &state.scope, deadline).await;

        if !options.css.is_empty() {
            wait_for_selector(&page.session, &options.css, &state.scope, deadline).await;
        }

        if !options.script.is_empty() {
            tracing::debug!("Injecting page script");
            if let Err(e) = page.session.evaluate(&polled_script(&options.script)).await {
                tracing::debug!("Page script failed: {}", e);
            }
        }

        // Block until the deadline elapses or a first-hit cancels the scope
        state.scope.wait(deadline).await;

        let hits = state.hits().await;
        let cost_ms = started.elapsed().as_millis();
        tracing::debug!("Sniff of {} finished with {} hit(s) in {} ms", play_url, hits.len(), cost_ms);

        SniffResult::assemble(
            options.mode,
            hits,
            play_url,
            cost_ms,
            &options.script,
            &options.init_script,
        )
    }

    // =========================================================================
    // Rendered page source
    // =========================================================================

    /// Navigate to `page_url`, run the optional scripts, and return the
    /// serialized DOM. Unlike the sniff, navigation failure is fatal here.
    pub async fn fetch_rendered_source(
        &self,
        page_url: &str,
        options: &SnifferOptions,
    ) -> Result<PageSourceResult> {
        let started = Instant::now();

        if !classify::is_valid_url(page_url) {
            return Ok(PageSourceResult::failure(
                "invalid URL",
                page_url,
                started.elapsed().as_millis(),
                &options.script,
                &options.init_script,
            ));
        }

        let browser = self.ensure_browser().await?;

        let spec = PageSpec {
            is_pc: effective_is_pc(&self.config, options.is_pc),
            headers: options.headers.clone(),
        };
        let page = match browser.page(&spec).await {
            Ok(page) => page,
            Err(e) => {
                return Ok(PageSourceResult::failure(
                    format!("failed to create page: {e}"),
                    page_url,
                    started.elapsed().as_millis(),
                    &options.script,
                    &options.init_script,
                ))
            }
        };

        let result = self.run_page_source(&page, page_url, options, started).await;
        browser.close_page(&page).await;
        Ok(result)
    }

    async fn run_page_source(
        &self,
        page: &PageHandle,
        page_url: &str,
        options: &SnifferOptions,
        started: Instant,
    ) -> PageSourceResult {
        let budget = options.timeout_ms.min(HARD_TIMEOUT_MS);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(budget);
        let scope = CancelScope::new();

        if !options.init_script.is_empty() {
            if let Err(e) = page.session.add_init_script(&options.init_script).await {
                tracing::debug!("Init script registration failed: {}", e);
            }
        }

        let failed = match tokio::time::timeout_at(deadline, page.session.navigate(page_url)).await {
            Ok(Ok(nav)) => nav.error_text,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("did not settle within {budget} ms")),
        };
        if let Some(reason) = failed {
            let err = crate::error::Error::Navigation(reason);
            tracing::debug!("{}", err);
            return PageSourceResult::failure(
                err.to_string(),
                page_url,
                started.elapsed().as_millis(),
                &options.script,
                &options.init_script,
            );
        }

        // The load event is best-effort: a DOM populated without `load`
        // firing still serializes below.
        wait_for_load(&page.session, &scope, deadline).await;

        if !options.css.is_empty() {
            wait_for_selector(&page.session, &options.css, &scope, deadline).await;
        }

        if !options.script.is_empty() {
            if let Err(e) = page.session.evaluate(&options.script).await {
                tracing::debug!("Page script failed: {}", e);
            }
        }

        let html = match page
            .session
            .evaluate_string("document.documentElement.outerHTML")
            .await
        {
            Ok(Some(html)) => html,
            Ok(None) => String::new(),
            Err(e) => {
                return PageSourceResult::failure(
                    format!("failed to read page source: {e}"),
                    page_url,
                    started.elapsed().as_millis(),
                    &options.script,
                    &options.init_script,
                )
            }
        };

        let cost_ms = started.elapsed().as_millis();
        tracing::debug!("Fetched {} bytes of page source in {} ms", html.len(), cost_ms);

        PageSourceResult {
            code: html,
            from: page_url.to_string(),
            cost: crate::result::format_cost(cost_ms),
            script: options.script.clone(),
            init_script: options.init_script.clone(),
            msg: "page source fetched".to_string(),
        }
    }
}

/// Wrap a page script in a poller that waits for a real document: re-runs
/// every 200 ms until `location.href` is no longer about:blank, executes the
/// payload once, then cancels itself.
fn polled_script(script: &str) -> String {
    format!(
        "var __pollTimer = setInterval(function() {{\n\
         if (location.href !== 'about:blank') {{\n\
         {script}\n\
         clearInterval(__pollTimer);\n\
         }}\n\
         }}, 200);"
    )
}

/// Poll `document.readyState` until the page finishes loading, the scope is
/// cancelled, or the deadline passes. Never fails.
async fn wait_for_load(session: &Session, scope: &CancelScope, deadline: tokio::time::Instant) {
    loop {
        if scope.is_cancelled() || tokio::time::Instant::now() >= deadline {
            return;
        }
        if let Ok(Some(state)) = session.evaluate_string("document.readyState").await {
            if state == "complete" {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Poll for a CSS selector; best-effort, a miss is logged and ignored
async fn wait_for_selector(
    session: &Session,
    selector: &str,
    scope: &CancelScope,
    deadline: tokio::time::Instant,
) {
    loop {
        if scope.is_cancelled() || tokio::time::Instant::now() >= deadline {
            tracing::debug!("Selector {:?} did not appear in time", selector);
            return;
        }
        let found = async {
            let root = session.document_node().await?;
            session.query_selector(root, selector).await
        }
        .await;
        if let Ok(node_id) = found {
            if node_id != 0 {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_first_hit_mobile() {
        let options = SnifferOptions::default();
        assert_eq!(options.mode, SniffMode::FirstHit);
        assert_eq!(options.timeout_ms, 10_000);
        assert!(!options.is_pc);
        assert!(options.custom_regex.is_empty());
    }

    #[test]
    fn polled_script_wraps_payload() {
        let wrapped = polled_script("video.play();");
        assert!(wrapped.contains("setInterval"));
        assert!(wrapped.contains("video.play();"));
        assert!(wrapped.contains("about:blank"));
        assert!(wrapped.contains("clearInterval"));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_without_a_browser() {
        let sniffer = Sniffer::new(SnifferConfig::default());
        let result = sniffer
            .sniff_media_url("not-a-url", &SnifferOptions::default())
            .await
            .unwrap();
        assert_eq!(result.code, 400);
        assert!(!sniffer.is_initialized().await);
    }

    #[tokio::test]
    async fn invalid_url_page_source_is_rejected_without_a_browser() {
        let sniffer = Sniffer::new(SnifferConfig::default());
        let result = sniffer
            .fetch_rendered_source("ftp://example.com", &SnifferOptions::default())
            .await
            .unwrap();
        assert!(result.code.is_empty());
        assert_eq!(result.msg, "invalid URL");
        assert!(!sniffer.is_initialized().await);
    }
}
