// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Parsing of bracketed IPv6 literals in CONNECT targets and Host headers.

/// Split a `[v6]` or `[v6]:port` string into the literal and the optional
/// port text. Returns `None` when the bracket is unmatched, the literal is
/// empty, or trailing text is not a `:digits` sequence. Port range is not
/// checked here; see [`parse_port_str`].
pub fn parse_bracketed_ipv6(s: &str) -> Option<(&str, Option<&str>)> {
    let rest = s.strip_prefix('[')?;
    let closing = rest.find(']')?;
    if closing == 0 {
        return None;
    }
    let literal = &rest[..closing];
    let tail = &rest[closing + 1..];
    if tail.is_empty() {
        return Some((literal, None));
    }
    let port = tail.strip_prefix(':')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((literal, Some(port)))
}

/// Parse a digits-only port string into `u16`, requiring 1..=65535.
pub fn parse_port_str(port: &str) -> Option<u16> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match port.parse::<u32>() {
        Ok(n) if (1..=65535).contains(&n) => Some(n as u16),
        _ => None,
    }
}
