//! HEAD probe side channel
//!
//! Some stream endpoints serve m3u8 playlists from extensionless or opaque
//! URLs. For those, an out-of-band HTTP HEAD classifies the URL by its
//! response headers while the browser keeps loading the page.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use tokio::sync::Semaphore;

use crate::session::{SessionState, UrlHit};

/// A probe matches when the endpoint answers with this content type and a
/// disposition naming an m3u8 playlist.
const OCTET_STREAM: &str = "application/octet-stream";

/// Bounded-concurrency HEAD prober, shared by all sessions of one sniffer
pub struct HeadProber {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl HeadProber {
    pub fn new(head_timeout_ms: u64, concurrency: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(head_timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("HTTP client for HEAD probes");
        Self {
            client,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Fire an async probe for `url`. On a playlist match the URL is appended
    /// to the session with `headers` (the originating request's captured
    /// replay headers); in first-hit mode that terminates the session.
    ///
    /// Errors and non-matching responses are swallowed. The probe may outlive
    /// its session: it only writes into session-scoped state, where a late
    /// append is harmless.
    pub fn dispatch(
        self: &Arc<Self>,
        url: String,
        headers: HashMap<String, String>,
        state: Arc<SessionState>,
    ) {
        let prober = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match prober.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let response = match prober.client.head(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("HEAD probe failed for {}: {}", url, e);
                    return;
                }
            };

            let content_type = header_str(&response, CONTENT_TYPE);
            let disposition = header_str(&response, CONTENT_DISPOSITION);

            if content_type == OCTET_STREAM && disposition.contains(".m3u8") {
                tracing::debug!("HEAD probe identified media URL: {}", url);
                state.record_hit(UrlHit { url, headers }).await;
            }
        });
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> &str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}
