//! # Truffler
//!
//! Media-URL sniffer built on headless Chrome.
//!
//! Given the URL of a playback page, truffler drives a real browser, watches
//! every network request the page issues, and returns the URL(s) of the
//! underlying media resource (HLS manifests, MP4/FLV/MKV, audio streams)
//! together with the request headers a downstream fetcher needs to replay
//! them. It identifies URLs; it never downloads media bodies.
//!
//! ## How it works
//!
//! - One long-lived browser process, one isolated page per sniff.
//! - Request interception pauses each outgoing request: obvious non-media
//!   resource types are blocked, the rest are classified against built-in and
//!   user-supplied patterns, and ambiguous URLs are probed out-of-band with a
//!   bounded-concurrency HEAD side channel.
//! - A per-session cancellation scope ties it together: first-hit mode
//!   returns as soon as one URL qualifies, batch mode exhausts the budget.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use truffler::{Sniffer, SnifferConfig, SnifferOptions};
//!
//! #[tokio::main]
//! async fn main() -> truffler::Result<()> {
//!     let sniffer = Sniffer::new(SnifferConfig::default());
//!
//!     let result = sniffer
//!         .sniff_media_url("https://example.com/play/123", &SnifferOptions::default())
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!
//!     sniffer.close().await;
//!     Ok(())
//! }
//! ```
//!
//! The `truffler` binary wraps the engine in the legacy HTTP API
//! (`/sniffer`, `/fetCodeByWebView`).

pub mod browser;
pub mod cdp;
pub mod classify;
pub mod error;
pub mod intercept;
pub mod probe;
pub mod result;
pub mod server;
pub mod session;
pub mod sniffer;

// Re-exports
pub use error::{Error, Result};
pub use result::{PageSourceResult, SniffOutcome, SniffResult};
pub use session::{SniffMode, UrlHit};
pub use sniffer::{Sniffer, SnifferOptions};

/// Device class a page emulates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// iPhone-X-class mobile profile (viewport, touch, mobile UA)
    #[default]
    Mobile,
    /// Plain desktop page
    Pc,
}

/// Process-wide sniffer configuration, immutable after construction
#[derive(Debug, Clone)]
pub struct SnifferConfig {
    /// Chatty per-request logging
    pub debug: bool,
    /// Headless browser (new headless mode)
    pub headless: bool,
    /// Prefer a system-installed browser; discovery walks the same
    /// well-known paths either way
    pub use_system_browser: bool,
    /// Default device profile for pages; per-request `is_pc` forces desktop
    pub device_type: DeviceType,
    /// User agent for every page (None picks a per-device default)
    pub user_agent: Option<String>,
    /// Budget cap for batch (mode 1) sniffs, milliseconds
    pub session_timeout_ms: u64,
    /// Budget cap for first-hit (mode 0) sniffs, milliseconds
    pub single_hit_timeout_ms: u64,
    /// Timeout for each HEAD probe, milliseconds
    pub head_timeout_ms: u64,
    /// Maximum in-flight HEAD probes
    pub head_probe_concurrency: usize,
    /// Explicit browser binary (None runs discovery)
    pub browser_path: Option<String>,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            debug: true,
            headless: true,
            use_system_browser: true,
            device_type: DeviceType::Mobile,
            user_agent: None,
            session_timeout_ms: 30_000,
            single_hit_timeout_ms: 10_000,
            head_timeout_ms: 5_000,
            head_probe_concurrency: 3,
            browser_path: None,
        }
    }
}
