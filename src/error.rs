// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Typed error kinds for the proxy core.
//!
//! The connection state machine needs to distinguish "malformed bytes" from
//! "upstream unreachable" from "deadline exceeded" in order to synthesize the
//! right status code, so the core uses this enum rather than an opaque error.

use bytes::Bytes;
use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    /// Malformed request-line, status-line, headers, or chunk framing.
    /// Carries a snapshot of the offending bytes for diagnostics.
    Parse { detail: String, snapshot: Bytes },

    /// DNS or TCP failure reaching the origin or the external proxy.
    UpstreamConnect(String),

    /// Connect or read deadline exceeded while talking upstream.
    UpstreamTimeout(&'static str),

    /// I/O failure inside an established CONNECT tunnel.
    Tunnel(std::io::Error),

    /// Invalid configuration (port out of range, empty proxy host, ...).
    Config(String),

    /// Any other socket-level failure.
    Io(std::io::Error),
}

impl ProxyError {
    pub fn parse(detail: impl Into<String>, snapshot: impl Into<Bytes>) -> Self {
        Self::Parse {
            detail: detail.into(),
            snapshot: snapshot.into(),
        }
    }

    /// Short tag used by event records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "ParseError",
            Self::UpstreamConnect(_) => "UpstreamConnectError",
            Self::UpstreamTimeout(_) => "UpstreamTimeoutError",
            Self::Tunnel(_) => "TunnelError",
            Self::Config(_) => "ConfigError",
            Self::Io(_) => "IoError",
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { detail, snapshot } => {
                write!(f, "{} (near {:?})", detail, snapshot_preview(snapshot))
            }
            Self::UpstreamConnect(msg) => write!(f, "upstream connect failed: {}", msg),
            Self::UpstreamTimeout(what) => write!(f, "upstream timeout: {}", what),
            Self::Tunnel(e) => write!(f, "tunnel I/O error: {}", e),
            Self::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tunnel(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

fn snapshot_preview(snapshot: &Bytes) -> String {
    let cap = snapshot.len().min(64);
    String::from_utf8_lossy(&snapshot[..cap]).into_owned()
}
