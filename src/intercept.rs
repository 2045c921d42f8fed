//! Request interception router
//!
//! Installed over a page as a `Fetch.requestPaused` handler. Every network
//! request the page issues is held until the router answers with continue or
//! fail. Non-essential resource types are failed outright; everything else is
//! classified, possibly recorded as a hit or handed to the HEAD prober, and
//! forwarded unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cdp::types::FetchRequestPausedEvent;
use crate::cdp::{PageEvent, Session};
use crate::classify::{self, SessionPredicate};
use crate::probe::HeadProber;
use crate::session::{SessionState, UrlHit};

/// Resource types that never carry the manifest or segment URLs we look for.
/// Blocking them cuts page-load cost sharply.
const BLOCKED_RESOURCE_TYPES: &[&str] = &[
    "image",
    "stylesheet",
    "font",
    "texttrack",
    "object",
    "beacon",
    "csp_report",
    "cspviolationreport",
    "imageset",
    "media",
];

fn is_blocked_resource(resource_type: &str) -> bool {
    BLOCKED_RESOURCE_TYPES
        .iter()
        .any(|blocked| resource_type.eq_ignore_ascii_case(blocked))
}

/// What to answer the browser for one paused request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward the request unchanged
    Continue,
    /// Fail it with BlockedByClient
    Block,
}

/// A paused request, reduced to the fields the decision logic reads
#[derive(Debug, Clone, Default)]
pub struct PausedRequest {
    pub url: String,
    pub method: String,
    pub resource_type: String,
    pub headers: HashMap<String, String>,
}

impl PausedRequest {
    pub fn from_event(event: &FetchRequestPausedEvent) -> Self {
        Self {
            url: event.request.url.clone(),
            method: event.request.method.clone(),
            resource_type: event.resource_type.clone().unwrap_or_default(),
            headers: event.request.headers.clone(),
        }
    }
}

/// Case-insensitive single-header lookup; empty when absent
fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> &'a str {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
        .unwrap_or("")
}

/// The replay headers captured on a hit: exactly referer and user-agent of
/// the originating request, omitted when empty
fn capture_replay_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    let mut captured = HashMap::new();
    for name in ["referer", "user-agent"] {
        let value = header_value(headers, name);
        if !value.is_empty() {
            captured.insert(name.to_string(), value.to_string());
        }
    }
    captured
}

/// Is this request worth an out-of-band HEAD probe? (Dedup is separate.)
fn wants_probe(play_url: &str, req: &PausedRequest) -> bool {
    req.method.eq_ignore_ascii_case("get")
        && req.url.starts_with("http")
        && req.url != play_url
        && classify::head_probe_eligible(&req.url)
        && !classify::cannot_head_probe(&req.url)
}

/// Per-page request router
pub struct InterceptRouter {
    state: Arc<SessionState>,
    prober: Arc<HeadProber>,
    custom: SessionPredicate,
    exclude: SessionPredicate,
    play_url: String,
}

impl InterceptRouter {
    pub fn new(
        state: Arc<SessionState>,
        prober: Arc<HeadProber>,
        custom: SessionPredicate,
        exclude: SessionPredicate,
        play_url: String,
    ) -> Self {
        Self {
            state,
            prober,
            custom,
            exclude,
            play_url,
        }
    }

    /// Ordered decision logic for one paused request.
    ///
    /// Runs for requests that arrive after cancellation too; late hits are
    /// appended without displacing the first.
    pub async fn route(&self, req: &PausedRequest) -> RouteDecision {
        tracing::debug!(
            "on_request: {} method: {} type: {}",
            req.url,
            req.method,
            req.resource_type
        );

        if is_blocked_resource(&req.resource_type) {
            tracing::debug!("blocking {} resource: {}", req.resource_type, req.url);
            return RouteDecision::Block;
        }

        // Exclusion suppresses hits but still forwards the request
        if self.exclude.matches(&req.url) {
            return RouteDecision::Continue;
        }

        if self.custom.matches(&req.url) {
            tracing::debug!("custom pattern matched media URL: {}", req.url);
            self.record(req).await;
            return RouteDecision::Continue;
        }

        if classify::matches_default_media(&req.url) && classify::is_likely_real_media(&req.url) {
            if !classify::has_ambient_reject(&req.url) {
                tracing::debug!("default pattern matched media URL: {}", req.url);
                self.record(req).await;
            }
        } else if wants_probe(&self.play_url, req) && self.state.mark_probed(&req.url).await {
            self.prober.dispatch(
                req.url.clone(),
                capture_replay_headers(&req.headers),
                Arc::clone(&self.state),
            );
        }

        RouteDecision::Continue
    }

    async fn record(&self, req: &PausedRequest) {
        self.state
            .record_hit(UrlHit {
                url: req.url.clone(),
                headers: capture_replay_headers(&req.headers),
            })
            .await;
    }
}

/// Pump a page's event stream through the router until the subscription is
/// dropped. The page stays blocked on each paused request until we answer.
pub async fn run_router(
    router: Arc<InterceptRouter>,
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<PageEvent>,
) {
    while let Some(event) = events.recv().await {
        if event.method != "Fetch.requestPaused" {
            continue;
        }
        let paused: FetchRequestPausedEvent = match serde_json::from_value(event.params) {
            Ok(paused) => paused,
            Err(e) => {
                tracing::debug!("Unparseable requestPaused event: {}", e);
                continue;
            }
        };

        let req = PausedRequest::from_event(&paused);
        let answer = match router.route(&req).await {
            RouteDecision::Continue => session.fetch_continue(&paused.request_id).await,
            RouteDecision::Block => session.fetch_fail(&paused.request_id, "BlockedByClient").await,
        };
        if let Err(e) = answer {
            // The page may already be closing; the request dies with it
            tracing::debug!("Failed to answer paused request: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SniffMode;

    fn router(mode: SniffMode, custom: &str, exclude: &str) -> (InterceptRouter, Arc<SessionState>) {
        let state = Arc::new(SessionState::new(mode));
        let router = InterceptRouter::new(
            Arc::clone(&state),
            Arc::new(HeadProber::new(500, 1)),
            SessionPredicate::compile(custom, "custom_regex"),
            SessionPredicate::compile(exclude, "sniffer_exclude"),
            "https://site/play".to_string(),
        );
        (router, state)
    }

    fn get_request(url: &str, resource_type: &str) -> PausedRequest {
        PausedRequest {
            url: url.to_string(),
            method: "GET".to_string(),
            resource_type: resource_type.to_string(),
            headers: HashMap::new(),
        }
    }

    fn with_headers(mut req: PausedRequest, pairs: &[(&str, &str)]) -> PausedRequest {
        for (k, v) in pairs {
            req.headers.insert(k.to_string(), v.to_string());
        }
        req
    }

    #[tokio::test]
    async fn blocks_non_essential_resources() {
        let (router, state) = router(SniffMode::Batch, "", "");
        for resource in ["Image", "stylesheet", "Font", "Media", "CSPViolationReport"] {
            let req = get_request("https://site/play", resource);
            assert_eq!(router.route(&req).await, RouteDecision::Block, "{resource}");
        }
        for resource in ["Document", "XHR", "Fetch", "Script"] {
            let req = get_request("https://site/play", resource);
            assert_eq!(router.route(&req).await, RouteDecision::Continue, "{resource}");
        }
        assert!(state.hits().await.is_empty());
    }

    #[tokio::test]
    async fn records_default_media_in_order() {
        let (router, state) = router(SniffMode::Batch, "", "");
        router
            .route(&get_request("https://cdn.site/stream/first.m3u8?t=1", "XHR"))
            .await;
        router
            .route(&get_request("https://cdn.site/stream/second.mp4", "XHR"))
            .await;
        // An image and a stylesheet never reach classification
        router.route(&get_request("https://cdn.site/poster.png", "Image")).await;
        router.route(&get_request("https://cdn.site/app.css", "Stylesheet")).await;

        let hits = state.hits().await;
        assert_eq!(hits.len(), 2);
        assert!(hits[0].url.contains("first.m3u8"));
        assert!(hits[1].url.contains("second.mp4"));
    }

    #[tokio::test]
    async fn first_hit_mode_terminates_on_match() {
        let (router, state) = router(SniffMode::FirstHit, "", "");
        router
            .route(&get_request("https://cdn.site/stream/abc.m3u8", "XHR"))
            .await;
        assert!(state.scope.is_cancelled());
        assert_eq!(state.hits().await.len(), 1);
    }

    #[tokio::test]
    async fn custom_pattern_wins_on_first_match() {
        let (router, state) = router(SniffMode::FirstHit, r"foo\.bar/seg", "");
        router.route(&get_request("https://foo.bar/seg/1", "XHR")).await;
        router.route(&get_request("https://x.test/abcdefgh/a.mp4", "XHR")).await;

        let hits = state.hits().await;
        assert_eq!(hits[0].url, "https://foo.bar/seg/1");
        assert!(state.scope.is_cancelled());
    }

    #[tokio::test]
    async fn exclusion_dominates_custom_and_default() {
        let (router, state) = router(SniffMode::Batch, r"ads\.example", r"ads\.example");
        let decision = router
            .route(&get_request("https://ads.example/spot/a.mp4", "XHR"))
            .await;
        // Suppressed but still forwarded
        assert_eq!(decision, RouteDecision::Continue);
        router.route(&get_request("https://cdn.other.site/b.mp4", "XHR")).await;

        let hits = state.hits().await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://cdn.other.site/b.mp4");
    }

    #[tokio::test]
    async fn ambient_reject_suppresses_wrapped_media() {
        let (router, state) = router(SniffMode::Batch, "", "");
        let decision = router
            .route(&get_request(
                "https://player.site/jump?url=http://cdn/real.m3u8",
                "XHR",
            ))
            .await;
        assert_eq!(decision, RouteDecision::Continue);
        assert!(state.hits().await.is_empty());
    }

    #[tokio::test]
    async fn captured_headers_are_minimal_and_lowercase() {
        let (router, state) = router(SniffMode::Batch, "", "");
        let req = with_headers(
            get_request("https://cdn.site/stream/abc.m3u8", "XHR"),
            &[
                ("Referer", "https://site/play"),
                ("User-Agent", "Mozilla/5.0"),
                ("Cookie", "session=1"),
                ("Accept", "*/*"),
            ],
        );
        router.route(&req).await;

        let hits = state.hits().await;
        let headers = &hits[0].headers;
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["referer"], "https://site/play");
        assert_eq!(headers["user-agent"], "Mozilla/5.0");
    }

    #[tokio::test]
    async fn empty_header_values_are_omitted() {
        let (router, state) = router(SniffMode::Batch, "", "");
        let req = with_headers(
            get_request("https://cdn.site/stream/abc.m3u8", "XHR"),
            &[("Referer", "")],
        );
        router.route(&req).await;

        let hits = state.hits().await;
        assert!(hits[0].headers.is_empty());
    }

    #[test]
    fn probe_gating() {
        let play = "https://site/play";
        let eligible = get_request("https://host.example.com/segment/chunk", "XHR");
        assert!(wants_probe(play, &eligible));

        // Never probe the page itself
        let own = get_request(play, "Document");
        assert!(!wants_probe(play, &own));

        // Only GETs
        let mut post = get_request("https://host.example.com/segment/chunk", "XHR");
        post.method = "POST".to_string();
        assert!(!wants_probe(play, &post));

        // Endpoints that mishandle HEAD
        let no_head = get_request("https://api.example.com/parse/path?ac=dm&url=x", "XHR");
        assert!(!wants_probe(play, &no_head));

        // Trailing slash: no filename to reason about
        let dir = get_request("https://host.example.com/segments/", "XHR");
        assert!(!wants_probe(play, &dir));
    }

    #[tokio::test]
    async fn invalid_custom_pattern_falls_back_to_default_rules() {
        let (router, state) = router(SniffMode::Batch, "([broken", "");
        router
            .route(&get_request("https://cdn.site/stream/abc.m3u8", "XHR"))
            .await;
        // Default classification still applies
        assert_eq!(state.hits().await.len(), 1);
    }
}
