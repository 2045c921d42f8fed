//! Terminal records of sniff and page-source sessions
//!
//! The hit shape depends on the mode: first-hit returns one `url` + `headers`
//! pair, batch returns an ordered `urls` list. Internally that is a tagged
//! variant, serialized into the legacy flat JSON form at the boundary.

use std::collections::HashMap;

use serde::Serialize;

use crate::session::{SniffMode, UrlHit};

/// The mode-dependent payload of a successful (or empty) sniff
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SniffOutcome {
    /// First-hit mode: the first captured hit
    Single {
        url: String,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// Batch mode: every hit, in discovery order
    Batch { urls: Vec<UrlHit> },
    /// No hits within the budget
    Miss {},
}

/// Terminal record of one sniff session
#[derive(Debug, Clone, Serialize)]
pub struct SniffResult {
    #[serde(flatten)]
    pub outcome: SniffOutcome,
    /// The input URL
    pub from: String,
    /// Wall-clock duration, "N ms"
    pub cost: String,
    /// 200 hit, 404 no hit, 400/500 failure
    pub code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub script: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub init_script: String,
    pub msg: String,
}

impl SniffResult {
    /// A session that never ran (bad input or page allocation failure)
    pub(crate) fn rejected(
        code: u16,
        msg: impl Into<String>,
        from: &str,
        cost_ms: u128,
        script: &str,
        init_script: &str,
    ) -> Self {
        Self {
            outcome: SniffOutcome::Miss {},
            from: from.to_string(),
            cost: format_cost(cost_ms),
            code,
            script: script.to_string(),
            init_script: init_script.to_string(),
            msg: msg.into(),
        }
    }

    /// Assemble the terminal record from the session's hit snapshot
    pub(crate) fn assemble(
        mode: SniffMode,
        hits: Vec<UrlHit>,
        from: &str,
        cost_ms: u128,
        script: &str,
        init_script: &str,
    ) -> Self {
        let (outcome, code, msg) = match mode {
            SniffMode::FirstHit => match hits.into_iter().next() {
                Some(first) => (
                    SniffOutcome::Single {
                        url: first.url,
                        headers: first.headers,
                    },
                    200,
                    "sniff succeeded",
                ),
                None => (SniffOutcome::Miss {}, 404, "sniff found no media URL"),
            },
            SniffMode::Batch if hits.is_empty() => {
                (SniffOutcome::Miss {}, 404, "sniff found no media URL")
            }
            SniffMode::Batch => (SniffOutcome::Batch { urls: hits }, 200, "sniff succeeded"),
        };

        Self {
            outcome,
            from: from.to_string(),
            cost: format_cost(cost_ms),
            code,
            script: script.to_string(),
            init_script: init_script.to_string(),
            msg: msg.to_string(),
        }
    }
}

/// Terminal record of one page-source session; `code` is the serialized DOM,
/// empty on failure
#[derive(Debug, Clone, Serialize)]
pub struct PageSourceResult {
    pub code: String,
    pub from: String,
    pub cost: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub script: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub init_script: String,
    pub msg: String,
}

impl PageSourceResult {
    pub(crate) fn failure(
        msg: impl Into<String>,
        from: &str,
        cost_ms: u128,
        script: &str,
        init_script: &str,
    ) -> Self {
        Self {
            code: String::new(),
            from: from.to_string(),
            cost: format_cost(cost_ms),
            script: script.to_string(),
            init_script: init_script.to_string(),
            msg: msg.into(),
        }
    }
}

pub(crate) fn format_cost(cost_ms: u128) -> String {
    format!("{cost_ms} ms")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(url: &str, pairs: &[(&str, &str)]) -> UrlHit {
        UrlHit {
            url: url.to_string(),
            headers: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn first_hit_serializes_flat_url_and_headers() {
        let result = SniffResult::assemble(
            SniffMode::FirstHit,
            vec![
                hit("https://cdn/a.m3u8", &[("referer", "https://site/play")]),
                hit("https://cdn/b.mp4", &[]),
            ],
            "https://site/play",
            120,
            "",
            "",
        );
        assert_eq!(result.code, 200);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["url"], "https://cdn/a.m3u8");
        assert_eq!(json["headers"]["referer"], "https://site/play");
        assert_eq!(json["cost"], "120 ms");
        assert!(json.get("urls").is_none());
        assert!(json.get("script").is_none());
    }

    #[test]
    fn batch_serializes_ordered_urls() {
        let result = SniffResult::assemble(
            SniffMode::Batch,
            vec![hit("https://cdn/a.m3u8", &[]), hit("https://cdn/b.mp4", &[])],
            "https://site/play",
            2000,
            "",
            "",
        );

        let json = serde_json::to_value(&result).unwrap();
        let urls = json["urls"].as_array().unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0]["url"], "https://cdn/a.m3u8");
        assert_eq!(urls[1]["url"], "https://cdn/b.mp4");
        assert!(json.get("url").is_none());
    }

    #[test]
    fn miss_omits_url_fields() {
        let result = SniffResult::assemble(
            SniffMode::FirstHit,
            Vec::new(),
            "https://site/play",
            800,
            "",
            "",
        );
        assert_eq!(result.code, 404);

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("url").is_none());
        assert!(json.get("urls").is_none());
        assert!(json.get("headers").is_none());
    }

    #[test]
    fn empty_single_headers_are_omitted() {
        let result = SniffResult::assemble(
            SniffMode::FirstHit,
            vec![hit("https://cdn/a.m3u8", &[])],
            "https://site/play",
            50,
            "",
            "",
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["url"], "https://cdn/a.m3u8");
        assert!(json.get("headers").is_none());
    }

    #[test]
    fn scripts_are_echoed_when_present() {
        let result = SniffResult::assemble(
            SniffMode::FirstHit,
            vec![hit("https://cdn/a.m3u8", &[])],
            "https://site/play",
            50,
            "document.querySelector('video').play()",
            "window.x = 1",
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["script"], "document.querySelector('video').play()");
        assert_eq!(json["init_script"], "window.x = 1");
    }

    #[test]
    fn page_source_failure_has_empty_code() {
        let result =
            PageSourceResult::failure("navigation failed", "https://site/page", 30, "", "");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["code"], "");
        assert_eq!(json["msg"], "navigation failed");
    }
}
