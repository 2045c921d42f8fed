//! Per-sniff shared state
//!
//! One `SessionState` lives for the duration of a sniff. The interception
//! router and HEAD probe callbacks append hits and mark probed URLs
//! concurrently; the session coroutine blocks on the cancellation scope until
//! the deadline elapses or a first-hit cancels it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};

use crate::SnifferConfig;

/// Hard ceiling on any session budget, milliseconds.
pub const HARD_TIMEOUT_MS: u64 = 60_000;

/// Sniff termination mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SniffMode {
    /// Return as soon as one qualifying URL is seen
    #[default]
    FirstHit,
    /// Run the full time budget and return every qualifying URL
    Batch,
}

impl SniffMode {
    /// Legacy integer form: 1 is batch, everything else first-hit
    pub fn from_i64(mode: i64) -> Self {
        if mode == 1 {
            Self::Batch
        } else {
            Self::FirstHit
        }
    }
}

/// One discovered media URL plus the request headers needed to replay it
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UrlHit {
    pub url: String,
    /// Captured `referer` and `user-agent` of the originating request only
    pub headers: HashMap<String, String>,
}

/// Single-use cancellation scope shared between the session coroutine and the
/// router/probe callbacks. Cancel is idempotent.
#[derive(Debug, Default)]
pub struct CancelScope {
    notify: Notify,
    cancelled: AtomicBool,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block until cancelled or the deadline elapses, whichever is first
    pub async fn wait(&self, deadline: tokio::time::Instant) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        if self.is_cancelled() {
            return;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

/// Mutable state of one sniff session
#[derive(Debug)]
pub struct SessionState {
    mode: SniffMode,
    /// Append-only within the session; insertion order is discovery order
    hits: Mutex<Vec<UrlHit>>,
    /// URLs already handed to the HEAD prober
    probed: Mutex<HashSet<String>>,
    pub scope: CancelScope,
}

impl SessionState {
    pub fn new(mode: SniffMode) -> Self {
        Self {
            mode,
            hits: Mutex::new(Vec::new()),
            probed: Mutex::new(HashSet::new()),
            scope: CancelScope::new(),
        }
    }

    pub fn mode(&self) -> SniffMode {
        self.mode
    }

    /// Append a hit; in first-hit mode this also terminates the session.
    /// Appends after cancellation are accepted (in-flight requests may still
    /// land) but cannot displace the first hit.
    pub async fn record_hit(&self, hit: UrlHit) {
        {
            let mut hits = self.hits.lock().await;
            hits.push(hit);
        }
        if self.mode == SniffMode::FirstHit {
            self.scope.cancel();
        }
    }

    /// Mark a URL as probed; true if it was newly added
    pub async fn mark_probed(&self, url: &str) -> bool {
        let mut probed = self.probed.lock().await;
        probed.insert(url.to_string())
    }

    /// Snapshot of the hit list in insertion order
    pub async fn hits(&self) -> Vec<UrlHit> {
        self.hits.lock().await.clone()
    }
}

/// Clamp a requested budget to the mode's configured cap and the hard ceiling
pub fn effective_timeout_ms(config: &SnifferConfig, mode: SniffMode, requested_ms: u64) -> u64 {
    let cap = match mode {
        SniffMode::Batch => config.session_timeout_ms,
        SniffMode::FirstHit => config.single_hit_timeout_ms,
    };
    requested_ms.min(cap).min(HARD_TIMEOUT_MS)
}
