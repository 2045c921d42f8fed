//! Integration tests for truffler
//!
//! These tests require Chrome to be installed and available.
//! Run with: cargo test --test integration -- --ignored
//!
//! Each test serves a playback fixture on a loopback port and sniffs it with
//! a real browser.

use std::net::SocketAddr;

use axum::http::header;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use truffler::{SniffMode, Sniffer, SnifferConfig, SnifferOptions};

/// Check if a browser is available
fn browser_available() -> bool {
    truffler::browser::find_browser().is_ok()
}

async fn serve_fixture() -> SocketAddr {
    let app = Router::new()
        .route(
            "/play",
            get(|| async {
                Html(
                    r#"<!DOCTYPE html>
<html>
<head><title>player</title></head>
<body>
<div id="player">loading</div>
<script>
  setTimeout(function () {
    fetch('/stream/abc.m3u8?t=1');
  }, 200);
</script>
</body>
</html>"#,
                )
            }),
        )
        .route(
            "/multi",
            get(|| async {
                Html(
                    r#"<!DOCTYPE html>
<html>
<body>
<img src="/poster.png">
<script>
  setTimeout(function () { fetch('/stream/first.m3u8'); }, 100);
  setTimeout(function () { fetch('/stream/second.mp4'); }, 400);
  setTimeout(function () { fetch('/stream/third.mp3'); }, 700);
</script>
</body>
</html>"#,
                )
            }),
        )
        .route(
            "/plain",
            get(|| async {
                Html("<!DOCTYPE html><html><body><h1 id=\"marker\">rendered content</h1></body></html>")
            }),
        )
        .route(
            "/stream/{name}",
            get(|| async { ([(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")], "#EXTM3U\n") }),
        )
        .route("/poster.png", get(|| async { "png" }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn sniffs_first_media_url() {
    if !browser_available() {
        eprintln!("Browser not found, skipping test");
        return;
    }

    let addr = serve_fixture().await;
    let sniffer = Sniffer::new(SnifferConfig::default());

    let options = SnifferOptions {
        timeout_ms: 8_000,
        ..SnifferOptions::default()
    };
    let result = sniffer
        .sniff_media_url(&format!("http://{addr}/play"), &options)
        .await
        .expect("sniff should not error");

    assert_eq!(result.code, 200, "msg: {}", result.msg);
    let json = serde_json::to_value(&result).unwrap();
    let url = json["url"].as_str().unwrap();
    assert!(url.contains("/stream/abc.m3u8"), "unexpected url: {url}");

    sniffer.close().await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn batch_collects_every_media_url_in_order() {
    if !browser_available() {
        eprintln!("Browser not found, skipping test");
        return;
    }

    let addr = serve_fixture().await;
    let sniffer = Sniffer::new(SnifferConfig::default());

    let options = SnifferOptions {
        mode: SniffMode::Batch,
        timeout_ms: 3_000,
        ..SnifferOptions::default()
    };
    let result = sniffer
        .sniff_media_url(&format!("http://{addr}/multi"), &options)
        .await
        .expect("sniff should not error");

    assert_eq!(result.code, 200, "msg: {}", result.msg);
    let json = serde_json::to_value(&result).unwrap();
    let urls: Vec<String> = json["urls"]
        .as_array()
        .unwrap()
        .iter()
        .map(|hit| hit["url"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(urls.len(), 3, "urls: {urls:?}");
    assert!(urls[0].contains("first.m3u8"));
    assert!(urls[1].contains("second.mp4"));
    assert!(urls[2].contains("third.mp3"));
    assert!(urls.iter().all(|u| !u.contains("poster.png")));

    sniffer.close().await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn no_media_is_a_404_within_budget() {
    if !browser_available() {
        eprintln!("Browser not found, skipping test");
        return;
    }

    let addr = serve_fixture().await;
    let sniffer = Sniffer::new(SnifferConfig::default());

    let options = SnifferOptions {
        timeout_ms: 1_000,
        ..SnifferOptions::default()
    };
    let result = sniffer
        .sniff_media_url(&format!("http://{addr}/plain"), &options)
        .await
        .expect("sniff should not error");

    assert_eq!(result.code, 404);

    sniffer.close().await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn fetches_rendered_page_source() {
    if !browser_available() {
        eprintln!("Browser not found, skipping test");
        return;
    }

    let addr = serve_fixture().await;
    let sniffer = Sniffer::new(SnifferConfig::default());

    let options = SnifferOptions {
        timeout_ms: 5_000,
        ..SnifferOptions::default()
    };
    let result = sniffer
        .fetch_rendered_source(&format!("http://{addr}/plain"), &options)
        .await
        .expect("fetch should not error");

    assert!(result.code.contains("rendered content"), "msg: {}", result.msg);

    sniffer.close().await;
}
