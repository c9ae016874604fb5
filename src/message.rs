// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Request and response value types produced by the codec.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::headers::HttpHeaders;
use crate::helpers::encoding;
use crate::hostport::HostAndPort;

/// Length value meaning "no Content-Length declared".
pub const LENGTH_UNSET: i64 = -1;

/// The request methods the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
    Trace,
    Connect,
    Propfind,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "OPTIONS" => Some(Self::Options),
            "HEAD" => Some(Self::Head),
            "TRACE" => Some(Self::Trace),
            "CONNECT" => Some(Self::Connect),
            "PROPFIND" => Some(Self::Propfind),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Head => "HEAD",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
            Self::Propfind => "PROPFIND",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded (or synthesized) HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Request target exactly as it appeared on the request-line
    /// (origin-form, absolute-form, or `host:port` for CONNECT).
    pub target: String,
    /// The HTTP-version token from the request-line, e.g. "HTTP/1.1".
    pub version: String,
    pub headers: HttpHeaders,
    pub body: Bytes,
    /// Declared Content-Length; [`LENGTH_UNSET`] when absent.
    pub content_length: i64,
    pub remote_addr: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HttpRequest {
    pub fn new(method: Method, target: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: version.into(),
            headers: HttpHeaders::new(),
            body: Bytes::new(),
            content_length: LENGTH_UNSET,
            remote_addr: None,
            timestamp: Utc::now(),
        }
    }

    /// Resolve the upstream endpoint for this request.
    pub fn host_and_port(&self) -> Result<HostAndPort, crate::error::ProxyError> {
        HostAndPort::resolve(self.method, &self.target, self.headers.get("Host"))
    }

    /// Path component of the target, used for rewrite matching.
    pub fn path(&self) -> &str {
        request_target_path(&self.target)
    }

    /// True when the client side of the exchange may be reused.
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.connection_has("close") {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.connection_has("keep-alive");
        }
        true
    }

    /// Body decoded for display: br bodies are decompressed, everything else
    /// is returned as stored (gzip is already transparent at the codec).
    pub fn display_body(&self) -> Bytes {
        display_body(&self.headers, &self.body)
    }
}

/// A decoded (or synthesized) HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The HTTP-version token from the status-line.
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HttpHeaders,
    pub body: Bytes,
    pub content_length: i64,
    pub timestamp: DateTime<Utc>,
}

impl HttpResponse {
    pub fn new(version: impl Into<String>, status: u16, reason: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            status,
            reason: reason.into(),
            headers: HttpHeaders::new(),
            body: Bytes::new(),
            content_length: LENGTH_UNSET,
            timestamp: Utc::now(),
        }
    }

    /// Build a locally-originated response (403, 400, 502, 504, ...).
    pub fn synthetic(status: u16, reason: &str, body: &str) -> Self {
        let mut resp = Self::new("HTTP/1.1", status, reason);
        if !body.is_empty() {
            resp.headers.set("Content-Type", "text/plain; charset=utf-8");
            resp.headers.set("Content-Length", body.len().to_string());
            resp.content_length = body.len() as i64;
            resp.body = Bytes::copy_from_slice(body.as_bytes());
        } else {
            resp.headers.set("Content-Length", "0");
            resp.content_length = 0;
        }
        resp.headers.set("Connection", "close");
        resp
    }

    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True when this response permits connection reuse.
    pub fn allows_keep_alive(&self) -> bool {
        if self.headers.connection_has("close") {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.connection_has("keep-alive");
        }
        true
    }

    pub fn display_body(&self) -> Bytes {
        display_body(&self.headers, &self.body)
    }
}

/// Path component of a request-target: strips scheme/authority from
/// absolute-form, strips query and fragment, passes `*` and CONNECT
/// authority-forms through as-is.
pub fn request_target_path(target: &str) -> &str {
    let path = if let Some(idx) = target.find("://") {
        let after = &target[idx + 3..];
        match after.find('/') {
            Some(pos) => &after[pos..],
            None => "/",
        }
    } else {
        target
    };
    match path.find(['?', '#']) {
        Some(end) => &path[..end],
        None => path,
    }
}

fn display_body(headers: &HttpHeaders, body: &Bytes) -> Bytes {
    if headers.content_encoding().as_deref() == Some("br") && !body.is_empty() {
        match encoding::brotli_decode(body) {
            Ok(decoded) => return Bytes::from(decoded),
            Err(e) => {
                tracing::warn!(error = %e, "brotli decode failed, showing raw body");
            }
        }
    }
    body.clone()
}
