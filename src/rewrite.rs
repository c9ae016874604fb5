// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Request/response rewrite rules and their matchers.
//!
//! A rule pairs a path glob (and optionally a domain) with replacement
//! bodies. The path glob language: literals match themselves, `*` matches a
//! run (possibly empty) of non-`/` bytes, and a trailing `*` matches to the
//! end of the path. Host globs (host filter, proxy bypass) let `*` span any
//! characters including dots.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::message::{HttpRequest, HttpResponse};

/// One rewrite entry; first enabled match wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestRewriteRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Path glob, required and non-empty.
    pub path: String,
    /// Optional domain; matches the host exactly or any of its subdomains.
    #[serde(default)]
    pub domain: Option<String>,
    /// Replacement request body (UTF-8), applied before forwarding.
    #[serde(default)]
    pub request_body: Option<String>,
    /// Replacement response body (UTF-8), applied before emission.
    #[serde(default)]
    pub response_body: Option<String>,
}

fn default_true() -> bool {
    true
}

/// The ordered rewrite rule list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestRewrites {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<RequestRewriteRule>,
}

impl RequestRewrites {
    /// First enabled rule matching the host and path, in insertion order.
    pub fn find_match(&self, host: Option<&str>, path: &str) -> Option<&RequestRewriteRule> {
        if !self.enabled {
            return None;
        }
        self.rules.iter().find(|rule| {
            rule.enabled
                && rule
                    .domain
                    .as_deref()
                    .filter(|d| !d.is_empty())
                    .map_or(true, |d| host.is_some_and(|h| domain_matches(d, h)))
                && path_glob_match(&rule.path, path)
        })
    }
}

/// Case-insensitive equality, or `host` ends with `"." + domain`.
pub fn domain_matches(domain: &str, host: &str) -> bool {
    if host.eq_ignore_ascii_case(domain) {
        return true;
    }
    let host = host.as_bytes();
    let domain = domain.as_bytes();
    if host.len() <= domain.len() {
        return false;
    }
    let tail = &host[host.len() - domain.len()..];
    tail.eq_ignore_ascii_case(domain) && host[host.len() - domain.len() - 1] == b'.'
}

/// Path glob: `*` matches a run of non-`/` bytes, except a trailing `*`
/// which matches everything to the end of the path.
pub fn path_glob_match(pattern: &str, path: &str) -> bool {
    glob_match(pattern.as_bytes(), path.as_bytes(), false)
}

/// Host glob: `*` spans any characters, dots included.
pub fn host_glob_match(pattern: &str, host: &str) -> bool {
    glob_match(
        pattern.to_ascii_lowercase().as_bytes(),
        host.to_ascii_lowercase().as_bytes(),
        true,
    )
}

fn glob_match(pattern: &[u8], text: &[u8], star_crosses_slash: bool) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((&b'*', rest)) => {
            if rest.is_empty() {
                // trailing star runs to end-of-text
                return true;
            }
            // try every run length the star could absorb, shortest first
            for skip in 0..=text.len() {
                if glob_match(rest, &text[skip..], star_crosses_slash) {
                    return true;
                }
                if skip < text.len() && !star_crosses_slash && text[skip] == b'/' {
                    break;
                }
            }
            false
        }
        Some((&c, rest)) => match text.split_first() {
            Some((&t, text_rest)) if t == c => glob_match(rest, text_rest, star_crosses_slash),
            _ => false,
        },
    }
}

/// Replace the request body per the matched rule. The replacement is plain
/// UTF-8, so any content coding headers are dropped alongside the framing.
pub fn apply_request_rewrite(rule: &RequestRewriteRule, req: &mut HttpRequest) -> bool {
    let Some(replacement) = &rule.request_body else {
        return false;
    };
    req.body = Bytes::copy_from_slice(replacement.as_bytes());
    req.content_length = req.body.len() as i64;
    req.headers.remove("Transfer-Encoding");
    req.headers.remove("Content-Encoding");
    req.headers.set("Content-Length", req.body.len().to_string());
    true
}

/// Replace the response body per the matched rule, recomputing framing and
/// dropping the content coding (the replacement is not compressed).
pub fn apply_response_rewrite(rule: &RequestRewriteRule, resp: &mut HttpResponse) -> bool {
    let Some(replacement) = &rule.response_body else {
        return false;
    };
    resp.body = Bytes::copy_from_slice(replacement.as_bytes());
    resp.content_length = resp.body.len() as i64;
    resp.headers.remove("Transfer-Encoding");
    resp.headers.remove("Content-Encoding");
    resp.headers
        .set("Content-Length", resp.body.len().to_string());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;
    use rstest::rstest;

    fn rule(path: &str) -> RequestRewriteRule {
        RequestRewriteRule {
            enabled: true,
            path: path.to_string(),
            domain: None,
            request_body: None,
            response_body: None,
        }
    }

    #[rstest]
    #[case("example.com", "example.com", true)]
    #[case("example.com", "EXAMPLE.COM", true)]
    #[case("example.com", "api.example.com", true)]
    #[case("example.com", "a.b.example.com", true)]
    #[case("example.com", "badexample.com", false)]
    #[case("example.com", "example.com.evil", false)]
    #[case("example.com", "other.org", false)]
    #[case("api.example.com", "example.com", false)]
    fn domain_predicate(#[case] domain: &str, #[case] host: &str, #[case] expected: bool) {
        assert_eq!(domain_matches(domain, host), expected);
    }

    #[rstest]
    #[case("/api/*", "/api/x", true)]
    #[case("/api/*", "/api/", true)]
    #[case("/api/*", "/api/x/y", true)] // trailing star runs past slashes
    #[case("/api/*/end", "/api/x/end", true)]
    #[case("/api/*/end", "/api/x/y/end", false)] // inner star stops at '/'
    #[case("/api/x", "/api/x", true)]
    #[case("/api/x", "/api/y", false)]
    #[case("*", "/anything/at/all", true)]
    #[case("/a*c", "/abc", true)]
    #[case("/a*c", "/ac", true)]
    #[case("/a*c", "/a/c", false)]
    #[case("/exact", "/exact/more", false)]
    fn path_glob_cases(#[case] pattern: &str, #[case] path: &str, #[case] expected: bool) {
        assert_eq!(path_glob_match(pattern, path), expected);
    }

    #[rstest]
    #[case("*.example.com", "a.b.example.com", true)]
    #[case("*.example.com", "example.com", false)]
    #[case("example.*", "example.org", true)]
    #[case("10.0.*", "10.0.1.20", true)]
    #[case("*", "anything", true)]
    #[case("EXAMPLE.com", "example.COM", true)]
    fn host_glob_cases(#[case] pattern: &str, #[case] host: &str, #[case] expected: bool) {
        assert_eq!(host_glob_match(pattern, host), expected);
    }

    #[test]
    fn first_enabled_match_wins() {
        let mut rewrites = RequestRewrites {
            enabled: true,
            rules: vec![rule("/api/*"), rule("/api/x")],
        };
        rewrites.rules[0].response_body = Some("first".into());
        rewrites.rules[1].response_body = Some("second".into());

        let matched = rewrites.find_match(None, "/api/x").expect("match");
        assert_eq!(matched.response_body.as_deref(), Some("first"));
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut rewrites = RequestRewrites {
            enabled: true,
            rules: vec![rule("/api/*"), rule("/api/x")],
        };
        rewrites.rules[0].enabled = false;
        rewrites.rules[0].response_body = Some("first".into());
        rewrites.rules[1].response_body = Some("second".into());

        let matched = rewrites.find_match(None, "/api/x").expect("match");
        assert_eq!(matched.response_body.as_deref(), Some("second"));
    }

    #[test]
    fn disabled_list_matches_nothing() {
        let rewrites = RequestRewrites {
            enabled: false,
            rules: vec![rule("*")],
        };
        assert!(rewrites.find_match(None, "/x").is_none());
    }

    #[test]
    fn domain_restricts_match() {
        let mut r = rule("/api/*");
        r.domain = Some("example.com".into());
        let rewrites = RequestRewrites {
            enabled: true,
            rules: vec![r],
        };
        assert!(rewrites.find_match(Some("api.example.com"), "/api/x").is_some());
        assert!(rewrites.find_match(Some("other.org"), "/api/x").is_none());
        assert!(rewrites.find_match(None, "/api/x").is_none());
    }

    #[test]
    fn empty_domain_is_ignored() {
        let mut r = rule("/x");
        r.domain = Some(String::new());
        let rewrites = RequestRewrites {
            enabled: true,
            rules: vec![r],
        };
        assert!(rewrites.find_match(None, "/x").is_some());
    }

    #[test]
    fn marker_rule_matches_without_changes() {
        let rewrites = RequestRewrites {
            enabled: true,
            rules: vec![rule("/api/*")],
        };
        let matched = rewrites.find_match(None, "/api/x").expect("match");

        let mut req = HttpRequest::new(Method::Get, "/api/x", "HTTP/1.1");
        assert!(!apply_request_rewrite(matched, &mut req));
        let mut resp = HttpResponse::new("HTTP/1.1", 200, "OK");
        assert!(!apply_response_rewrite(matched, &mut resp));
    }

    #[test]
    fn response_rewrite_recomputes_framing() {
        let mut r = rule("/api/*");
        r.response_body = Some("{\"ok\":true}".into());

        let mut resp = HttpResponse::new("HTTP/1.1", 200, "OK");
        resp.headers.set("Transfer-Encoding", "chunked");
        resp.headers.set("Content-Encoding", "gzip");
        resp.body = Bytes::from_static(b"IGNORED");

        assert!(apply_response_rewrite(&r, &mut resp));
        assert_eq!(resp.body, Bytes::from_static(b"{\"ok\":true}"));
        assert_eq!(resp.headers.content_length(), Some(11));
        assert!(!resp.headers.contains("Transfer-Encoding"));
        assert!(!resp.headers.contains("Content-Encoding"));
    }

    #[test]
    fn request_rewrite_replaces_body() {
        let mut r = rule("/submit");
        r.request_body = Some("patched".into());

        let mut req = HttpRequest::new(Method::Post, "/submit", "HTTP/1.1");
        req.body = Bytes::from_static(b"original");
        req.headers.set("Content-Length", "8");

        assert!(apply_request_rewrite(&r, &mut req));
        assert_eq!(req.body, Bytes::from_static(b"patched"));
        assert_eq!(req.headers.content_length(), Some(7));
    }
}
