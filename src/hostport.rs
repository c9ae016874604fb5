// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Upstream endpoint resolution from CONNECT targets, absolute-form URIs,
//! and Host headers.

use bytes::Bytes;

use crate::error::ProxyError;
use crate::helpers::ipv6;
use crate::message::Method;

/// An upstream endpoint with its transport classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Parse a CONNECT target (`host:port`, IPv6 bracketed). TLS is assumed
    /// for port 443.
    pub fn from_connect_target(target: &str) -> Result<Self, ProxyError> {
        let (host, port) = split_host_port(target)?;
        let port = port.ok_or_else(|| bad_target(target, "CONNECT target requires a port"))?;
        Ok(Self::new(host, port, port == 443))
    }

    /// Parse an absolute-form URI. Returns `None` for any other target form.
    pub fn from_absolute_uri(uri: &str) -> Result<Option<Self>, ProxyError> {
        let (scheme, rest) = match uri.split_once("://") {
            Some(parts) => parts,
            None => return Ok(None),
        };
        let tls = match scheme.to_ascii_lowercase().as_str() {
            "http" => false,
            "https" => true,
            other => {
                return Err(bad_target(uri, &format!("unsupported scheme '{}'", other)));
            }
        };
        let authority = match rest.find('/') {
            Some(idx) => &rest[..idx],
            None => rest,
        };
        let (host, port) = split_host_port(authority)?;
        let port = port.unwrap_or(if tls { 443 } else { 80 });
        // explicit port 443 always means TLS, regardless of scheme
        Ok(Some(Self::new(host, port, tls || port == 443)))
    }

    /// Parse a Host header value for an origin-form request.
    pub fn from_host_header(value: &str, tls: bool) -> Result<Self, ProxyError> {
        let (host, port) = split_host_port(value)?;
        let port = port.unwrap_or(if tls { 443 } else { 80 });
        Ok(Self::new(host, port, tls || port == 443))
    }

    /// Resolve the endpoint for a decoded request: CONNECT targets, then
    /// absolute-form, then origin-form completed by the Host header.
    pub fn resolve(
        method: Method,
        target: &str,
        host_header: Option<&str>,
    ) -> Result<Self, ProxyError> {
        if method == Method::Connect {
            return Self::from_connect_target(target);
        }
        if let Some(resolved) = Self::from_absolute_uri(target)? {
            return Ok(resolved);
        }
        match host_header {
            Some(value) => Self::from_host_header(value, false),
            None => Err(bad_target(
                target,
                "origin-form target without a Host header",
            )),
        }
    }

    /// `host:port` (brackets restored for IPv6 literals).
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.authority())
    }
}

fn bad_target(target: &str, detail: &str) -> ProxyError {
    ProxyError::parse(
        format!("invalid target: {}", detail),
        Bytes::copy_from_slice(target.as_bytes()),
    )
}

/// Split `host[:port]`, accepting bracketed IPv6 literals. The returned host
/// has brackets stripped.
fn split_host_port(value: &str) -> Result<(String, Option<u16>), ProxyError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(bad_target(value, "empty host"));
    }

    if value.starts_with('[') {
        let (literal, port_text) = ipv6::parse_bracketed_ipv6(value)
            .ok_or_else(|| bad_target(value, "malformed IPv6 literal"))?;
        let port = match port_text {
            Some(text) => Some(
                ipv6::parse_port_str(text)
                    .ok_or_else(|| bad_target(value, "port out of range"))?,
            ),
            None => None,
        };
        return Ok((literal.to_string(), port));
    }

    match value.rsplit_once(':') {
        Some((host, port_text)) => {
            if host.is_empty() {
                return Err(bad_target(value, "empty host"));
            }
            if host.contains(':') {
                // unbracketed IPv6 literal, no port component
                return Ok((value.to_string(), None));
            }
            let port = ipv6::parse_port_str(port_text)
                .ok_or_else(|| bad_target(value, "invalid port"))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((value.to_string(), None)),
    }
}
