//! HTTP adapter
//!
//! Wraps the engine in the legacy query-parameter API: `/sniffer` and
//! `/fetCodeByWebView`, plus health/status endpoints. Results are enveloped
//! as `{code, msg, data, timestamp}` with a `total_cost` added to the data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::classify;
use crate::error::{Error, Result};
use crate::session::SniffMode;
use crate::{Sniffer, SnifferOptions};

/// Unified response envelope
#[derive(Debug, Serialize)]
struct Envelope {
    code: u16,
    msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    timestamp: u128,
}

impl Envelope {
    fn ok(data: Value) -> Self {
        Self {
            code: 200,
            msg: "success".to_string(),
            data: Some(data),
            timestamp: unix_millis(),
        }
    }

    fn error(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
            timestamp: unix_millis(),
        }
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Raw query parameters, parsed leniently below
#[derive(Debug, Default, Deserialize)]
struct SniffQuery {
    url: Option<String>,
    mode: Option<String>,
    is_pc: Option<String>,
    timeout: Option<String>,
    custom_regex: Option<String>,
    sniffer_exclude: Option<String>,
    css: Option<String>,
    headers: Option<String>,
    script: Option<String>,
    init_script: Option<String>,
}

/// Base64-decode a script parameter; a string that does not decode is passed
/// through raw
fn decode_script(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    match base64::engine::general_purpose::STANDARD.decode(raw) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| raw.to_string()),
        Err(e) => {
            tracing::debug!("Script parameter is not base64 ({}), using raw value", e);
            raw.to_string()
        }
    }
}

/// Parse newline-separated `Name: Value` header lines. Names are lowercased;
/// lines without a colon or with an empty key/value are dropped.
fn parse_header_lines(raw: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in raw.split('\n') {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_lowercase();
        let value = value.trim().to_string();
        if !name.is_empty() && !value.is_empty() {
            headers.insert(name, value);
        }
    }
    headers
}

/// Integer milliseconds, default 10 000, clamped to 60 000
fn parse_timeout(raw: Option<&str>) -> u64 {
    raw.and_then(|t| t.parse::<u64>().ok())
        .unwrap_or(10_000)
        .min(60_000)
}

fn parse_mode(raw: Option<&str>) -> SniffMode {
    SniffMode::from_i64(raw.and_then(|m| m.parse::<i64>().ok()).unwrap_or(0))
}

/// Only the literals "1" and "true" are pc
fn parse_is_pc(raw: Option<&str>) -> bool {
    matches!(raw, Some("1") | Some("true"))
}

fn sniff_options(query: &SniffQuery) -> SnifferOptions {
    SnifferOptions {
        mode: parse_mode(query.mode.as_deref()),
        custom_regex: query.custom_regex.clone().unwrap_or_default(),
        sniffer_exclude: query.sniffer_exclude.clone().unwrap_or_default(),
        timeout_ms: parse_timeout(query.timeout.as_deref()),
        css: query.css.clone().unwrap_or_default(),
        is_pc: parse_is_pc(query.is_pc.as_deref()),
        headers: parse_header_lines(query.headers.as_deref().unwrap_or("")),
        script: decode_script(query.script.as_deref().unwrap_or("")),
        init_script: decode_script(query.init_script.as_deref().unwrap_or("")),
    }
}

fn error_response(status: StatusCode, code: u16, msg: impl Into<String>) -> Response {
    (status, Json(Envelope::error(code, msg))).into_response()
}

/// Envelope a result value, adding the handler-wide `total_cost`
fn data_response(result: serde_json::Result<Value>, started: Instant) -> Response {
    match result {
        Ok(mut value) => {
            if let Value::Object(map) = &mut value {
                map.insert(
                    "total_cost".to_string(),
                    json!(format!("{} ms", started.elapsed().as_millis())),
                );
            }
            Json(Envelope::ok(value)).into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            500,
            format!("failed to serialize result: {e}"),
        ),
    }
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>truffler</title><meta charset="utf-8"></head>
<body>
<h1>truffler</h1>
<p>Media-URL sniffer.</p>
<ul>
<li><code>GET /sniffer</code> &mdash; sniff media URLs from a playback page.
Parameters: <code>url</code> (required), <code>mode</code> (0 first hit, 1 batch),
<code>is_pc</code>, <code>timeout</code> (ms), <code>custom_regex</code>,
<code>sniffer_exclude</code>, <code>css</code>, <code>script</code> (base64),
<code>init_script</code> (base64), <code>headers</code></li>
<li><code>GET /fetCodeByWebView</code> &mdash; rendered page source, same parameters</li>
<li><code>GET /health</code> &mdash; health check</li>
<li><code>GET /active</code> &mdash; engine status</li>
</ul>
<pre>curl "http://localhost:57573/sniffer?url=https://example.com/play&amp;mode=0&amp;timeout=10000"</pre>
</body>
</html>"#;

async fn handle_home() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn handle_health() -> Json<Envelope> {
    Json(Envelope::ok(json!({
        "status": "ok",
        "service": "truffler",
    })))
}

async fn handle_active(State(sniffer): State<Arc<Sniffer>>) -> Json<Envelope> {
    let browser = if sniffer.is_initialized().await {
        "initialized"
    } else {
        "not_initialized"
    };
    Json(Envelope::ok(json!({
        "active": true,
        "browser": browser,
    })))
}

async fn handle_sniffer(
    State(sniffer): State<Arc<Sniffer>>,
    Query(query): Query<SniffQuery>,
) -> Response {
    let started = Instant::now();

    let Some(url) = query.url.as_deref().filter(|u| !u.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, 400, "missing required parameter: url");
    };
    if !classify::is_valid_url(url) {
        return error_response(StatusCode::BAD_REQUEST, 400, "invalid URL format");
    }

    let options = sniff_options(&query);
    match sniffer.sniff_media_url(url, &options).await {
        Ok(result) => data_response(serde_json::to_value(&result), started),
        Err(e) => {
            tracing::error!("Sniff failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                500,
                format!("sniff failed: {e}"),
            )
        }
    }
}

async fn handle_page_source(
    State(sniffer): State<Arc<Sniffer>>,
    Query(query): Query<SniffQuery>,
) -> Response {
    let started = Instant::now();

    let Some(url) = query.url.as_deref().filter(|u| !u.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, 400, "missing required parameter: url");
    };
    if !classify::is_valid_url(url) {
        return error_response(StatusCode::BAD_REQUEST, 400, "invalid URL format");
    }

    let options = sniff_options(&query);
    match sniffer.fetch_rendered_source(url, &options).await {
        Ok(result) => data_response(serde_json::to_value(&result), started),
        Err(e) => {
            tracing::error!("Page source fetch failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                500,
                format!("page source fetch failed: {e}"),
            )
        }
    }
}

/// Build the router with CORS and request tracing
pub fn router(sniffer: Arc<Sniffer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_home))
        .route("/health", get(handle_health))
        .route("/active", get(handle_active))
        .route("/sniffer", get(handle_sniffer))
        .route("/fetCodeByWebView", get(handle_page_source))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(sniffer)
}

fn port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Use the requested port, or scan for a free one from 57573
fn pick_port(requested: Option<u16>) -> Result<u16> {
    match requested {
        Some(port) => {
            if port_available(port) {
                Ok(port)
            } else {
                Err(Error::Server(format!("port {port} is already in use")))
            }
        }
        None => (57573..57673)
            .find(|&port| port_available(port))
            .ok_or_else(|| Error::Server("no free port between 57573 and 57672".into())),
    }
}

async fn shutdown_signal(sniffer: Arc<Sniffer>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, closing");
    sniffer.close().await;
}

/// Serve the API until a shutdown signal arrives
pub async fn run(sniffer: Arc<Sniffer>, requested_port: Option<u16>) -> Result<()> {
    let port = pick_port(requested_port)?;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;

    tracing::info!("Server listening on http://0.0.0.0:{}", port);
    tracing::info!("Sniff endpoint: http://0.0.0.0:{}/sniffer", port);
    tracing::info!("Page source:    http://0.0.0.0:{}/fetCodeByWebView", port);
    tracing::info!("Health check:   http://0.0.0.0:{}/health", port);

    let app = router(Arc::clone(&sniffer));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sniffer))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lines_are_lowercased_and_filtered() {
        let headers = parse_header_lines(
            "Referer: https://site/play\nUser-Agent: Mozilla/5.0\nbroken line\n: novalue\nEmpty:\n",
        );
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["referer"], "https://site/play");
        assert_eq!(headers["user-agent"], "Mozilla/5.0");
    }

    #[test]
    fn header_lines_empty_input() {
        assert!(parse_header_lines("").is_empty());
    }

    #[test]
    fn script_decodes_base64_and_falls_back_to_raw() {
        // "video.play();"
        assert_eq!(decode_script("dmlkZW8ucGxheSgpOw=="), "video.play();");
        assert_eq!(decode_script("not base64!!!"), "not base64!!!");
        assert_eq!(decode_script(""), "");
    }

    #[test]
    fn timeout_defaults_and_clamps() {
        assert_eq!(parse_timeout(None), 10_000);
        assert_eq!(parse_timeout(Some("abc")), 10_000);
        assert_eq!(parse_timeout(Some("5000")), 5_000);
        assert_eq!(parse_timeout(Some("90000")), 60_000);
    }

    #[test]
    fn is_pc_matches_exact_literals() {
        assert!(parse_is_pc(Some("1")));
        assert!(parse_is_pc(Some("true")));
        assert!(!parse_is_pc(Some("TRUE")));
        assert!(!parse_is_pc(Some("0")));
        assert!(!parse_is_pc(Some("yes")));
        assert!(!parse_is_pc(None));
    }

    #[test]
    fn mode_parses_leniently() {
        assert_eq!(parse_mode(None), SniffMode::FirstHit);
        assert_eq!(parse_mode(Some("1")), SniffMode::Batch);
        assert_eq!(parse_mode(Some("0")), SniffMode::FirstHit);
        assert_eq!(parse_mode(Some("junk")), SniffMode::FirstHit);
    }

    #[test]
    fn options_assembled_from_query() {
        let query = SniffQuery {
            url: Some("https://site/play".to_string()),
            mode: Some("1".to_string()),
            is_pc: Some("true".to_string()),
            timeout: Some("99999".to_string()),
            custom_regex: Some(r"foo\.bar".to_string()),
            headers: Some("Origin: https://site".to_string()),
            script: Some("dmlkZW8ucGxheSgpOw==".to_string()),
            ..Default::default()
        };
        let options = sniff_options(&query);
        assert_eq!(options.mode, SniffMode::Batch);
        assert!(options.is_pc);
        assert_eq!(options.timeout_ms, 60_000);
        assert_eq!(options.custom_regex, r"foo\.bar");
        assert_eq!(options.headers["origin"], "https://site");
        assert_eq!(options.script, "video.play();");
    }
}
