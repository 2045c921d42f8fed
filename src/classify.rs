//! URL classification
//!
//! Stateless predicates that decide whether a URL looks like media, whether a
//! HEAD probe makes sense, and the per-session user predicates.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use url::Url;

/// Media-looking URLs: a long-enough path ending in a known container/stream
/// extension, or the `video/tos` / `obj/tos` CDN path shape.
static DEFAULT_MEDIA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#"(?i)https?://[^\s"'<>]{12,}?\.(m3u8|mp4|flv|avi|mkv|rm|wmv|mpg|m4a|mp3)(\?[^\s"'<>]*)?"#,
        r#"|https?://[^\s"'<>]*?(video|obj)/tos[^\s"'<>]*"#
    ))
    .expect("default media pattern")
});

/// Endpoints known to mishandle HEAD requests.
static NO_HEAD_PROBE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>]{12,}?(ac=dm&url=)"#).expect("no-head pattern"));

/// Substrings that mark a URL as something other than real media.
const NOT_MEDIA_MARKERS: &[&str] = &[
    "google",
    "facebook",
    "twitter",
    "analytics",
    "doubleclick",
    ".css",
    ".js",
    ".html",
    ".htm",
    ".png",
    ".jpg",
    ".jpeg",
    ".gif",
];

/// Media-URL-shaped query parameters referencing non-media; checked after a
/// default-media match.
const AMBIENT_REJECT_MARKERS: &[&str] = &["url=http", "v=http", ".css", ".html"];

/// An absolute http(s) URL. Intentionally lax: anything the URL parser
/// accepts with the right prefix passes, no stricter structural checks.
pub fn is_valid_url(raw: &str) -> bool {
    Url::parse(raw).is_ok() && (raw.starts_with("http://") || raw.starts_with("https://"))
}

/// Does the URL match the built-in media pattern?
pub fn matches_default_media(url: &str) -> bool {
    DEFAULT_MEDIA.is_match(url)
}

/// Reject URLs that mention well-known non-media hosts or asset extensions
/// anywhere. The extension part overlaps with the default pattern on purpose:
/// the `video/tos` alternative can match URLs whose query strings name image
/// assets.
pub fn is_likely_real_media(url: &str) -> bool {
    let lower = url.to_lowercase();
    !NOT_MEDIA_MARKERS.iter().any(|m| lower.contains(m))
}

/// Endpoints that must not be HEAD-probed.
pub fn cannot_head_probe(url: &str) -> bool {
    NO_HEAD_PROBE.is_match(url)
}

/// Post-match guard: a default-media hit is dropped when the URL also carries
/// one of these markers.
pub fn has_ambient_reject(url: &str) -> bool {
    AMBIENT_REJECT_MARKERS.iter().any(|m| url.contains(m))
}

/// Last path segment of the URL, or empty when it cannot be parsed.
pub fn last_path_segment(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return String::new();
    };
    parsed
        .path()
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

/// Is this URL worth an out-of-band HEAD probe?
///
/// Either the filename is extensionless (and the endpoint tolerates HEAD), or
/// it has an extension and is longer than one character.
pub fn head_probe_eligible(url: &str) -> bool {
    let filename = last_path_segment(url);
    (!filename.is_empty() && !filename.contains('.') && !cannot_head_probe(url))
        || (filename.contains('.') && filename.len() > 1)
}

/// A per-session URL predicate compiled from a user-supplied pattern.
///
/// Patterns are case-insensitive and multi-line. A pattern that fails to
/// compile is logged and disabled, never fatal.
#[derive(Debug, Default)]
pub struct SessionPredicate(Option<Regex>);

impl SessionPredicate {
    pub fn compile(pattern: &str, what: &str) -> Self {
        if pattern.is_empty() {
            return Self(None);
        }
        match RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
        {
            Ok(re) => Self(Some(re)),
            Err(e) => {
                tracing::warn!("Ignoring invalid {} pattern {:?}: {}", what, pattern, e);
                Self(None)
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    pub fn matches(&self, url: &str) -> bool {
        self.0.as_ref().is_some_and(|re| re.is_match(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_media_extensions() {
        assert!(matches_default_media("https://cdn.site/stream/abc.m3u8?t=1"));
        assert!(matches_default_media("http://media.example.com/videos/a.mp4"));
        assert!(matches_default_media("HTTPS://CDN.SITE/STREAM/ABC.M3U8"));
        assert!(matches_default_media("https://host.example/audio/track01.mp3"));
    }

    #[test]
    fn accepts_tos_cdn_paths() {
        assert!(matches_default_media(
            "https://v1.example.com/video/tos/cn/tos-cn-ve-15/abcdef/"
        ));
        assert!(matches_default_media("https://x.example.com/obj/tos/media/123"));
    }

    #[test]
    fn rejects_short_or_non_media() {
        // Fewer than 12 chars between scheme and extension
        assert!(!matches_default_media("https://a.b/x.mp4"));
        assert!(!matches_default_media("https://example.com/page"));
        assert!(!matches_default_media("https://example.com/script.js"));
    }

    #[test]
    fn likely_real_media_filters_known_hosts_and_assets() {
        assert!(is_likely_real_media("https://cdn.site/stream/abc.m3u8"));
        assert!(!is_likely_real_media("https://www.google.com/video/tos/x"));
        assert!(!is_likely_real_media("https://cdn.site/a.m3u8?poster=x.jpg"));
        assert!(!is_likely_real_media("https://analytics.site/v.mp4"));
    }

    #[test]
    fn ambient_reject_catches_wrapped_urls() {
        assert!(has_ambient_reject("https://host/player?url=http://other/a.mp4"));
        assert!(has_ambient_reject("https://host/play?v=http%3A//x"));
        assert!(!has_ambient_reject("https://cdn.site/stream/abc.m3u8?t=1"));
    }

    #[test]
    fn no_head_probe_pattern() {
        assert!(cannot_head_probe("https://api.example.com/parse?ac=dm&url=abc"));
        assert!(!cannot_head_probe("https://cdn.example.com/segment/001"));
    }

    #[test]
    fn valid_url_is_lax() {
        assert!(is_valid_url("https://example.com/play"));
        assert!(is_valid_url("http://example.com"));
        // Parseable even though structurally odd
        assert!(is_valid_url("http://example.com/%%"));
        assert!(!is_valid_url("ftp://example.com/file"));
        assert!(!is_valid_url("example.com/play"));
        assert!(!is_valid_url(""));
    }

    #[test]
    fn probe_eligibility_rules() {
        // Extensionless filename
        assert!(head_probe_eligible("https://host.example.com/path/segment"));
        // Extensionless but endpoint refuses HEAD
        assert!(!head_probe_eligible(
            "https://api.example.com/parse/video?ac=dm&url=segment"
        ));
        // Filename with an extension longer than one char
        assert!(head_probe_eligible("https://host.example.com/file.bin"));
        // Bare dot filename
        assert!(!head_probe_eligible("https://host.example.com/x/."));
        // Empty filename (trailing slash)
        assert!(!head_probe_eligible("https://host.example.com/dir/"));
    }

    #[test]
    fn predicate_compiles_with_flags() {
        let p = SessionPredicate::compile(r"foo\.bar/seg", "custom_regex");
        assert!(p.is_enabled());
        assert!(p.matches("https://FOO.BAR/seg/1"));
        assert!(!p.matches("https://other.site/seg/1"));
    }

    #[test]
    fn predicate_invalid_pattern_is_disabled() {
        let p = SessionPredicate::compile(r"([unclosed", "custom_regex");
        assert!(!p.is_enabled());
        assert!(!p.matches("anything"));
    }

    #[test]
    fn predicate_empty_pattern_is_disabled() {
        let p = SessionPredicate::compile("", "sniffer_exclude");
        assert!(!p.is_enabled());
    }
}
