// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Byte-level CRLF line scanning shared by request and response decoding.

use bytes::{Bytes, BytesMut};

use crate::error::ProxyError;
use crate::headers::HttpHeaders;

/// Upper bound for the initial line and for the accumulated header region.
pub const MAX_INITIAL_LINE_LEN: usize = 10240;

/// The three whitespace-delimited tokens of a request-line or status-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialLine {
    pub first: String,
    pub second: String,
    pub third: String,
}

/// Find the offset of the first CRLF at or after `from`.
pub fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

/// Consume one CRLF-terminated line and split it into three tokens at the
/// first two SP bytes; everything after the second SP (further SPs included)
/// is the third token.
///
/// Returns `Ok(None)` when no complete line is buffered yet. Fails when the
/// buffered prefix exceeds `max_len` without a CRLF, or when fewer than three
/// tokens are present.
pub fn parse_initial_line(
    buf: &mut BytesMut,
    max_len: usize,
) -> Result<Option<InitialLine>, ProxyError> {
    let line_end = match find_crlf(buf, 0) {
        Some(idx) => idx,
        None => {
            if buf.len() > max_len {
                return Err(ProxyError::parse(
                    "parseLine error: line too long",
                    buf.clone().freeze(),
                ));
            }
            return Ok(None);
        }
    };
    if line_end > max_len {
        return Err(ProxyError::parse(
            "parseLine error: line too long",
            buf.clone().freeze(),
        ));
    }

    let line = buf.split_to(line_end + 2);
    let line = &line[..line_end];

    let first_sp = line.iter().position(|&b| b == b' ');
    let second_sp = first_sp.and_then(|p| {
        line[p + 1..]
            .iter()
            .position(|&b| b == b' ')
            .map(|q| p + 1 + q)
    });
    let (Some(a), Some(b)) = (first_sp, second_sp) else {
        return Err(ProxyError::parse(
            "parseLine error",
            Bytes::copy_from_slice(line),
        ));
    };

    let token = |bytes: &[u8]| -> Result<String, ProxyError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProxyError::parse("parseLine error", Bytes::copy_from_slice(line)))
    };

    Ok(Some(InitialLine {
        first: token(&line[..a])?,
        second: token(&line[a + 1..b])?,
        third: token(&line[b + 1..])?,
    }))
}

/// Resumable header-block scanner.
///
/// Extracts `name: value` lines until the empty line that terminates the
/// block. A partial trailing line stays in the buffer for the next call.
/// Reusable across messages on one connection after [`HeaderScanner::reset`].
#[derive(Debug, Default)]
pub struct HeaderScanner {
    consumed: usize,
}

impl HeaderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.consumed = 0;
    }

    /// Returns `Ok(true)` when the terminating empty line was consumed,
    /// `Ok(false)` when more bytes are needed.
    pub fn parse(
        &mut self,
        buf: &mut BytesMut,
        headers: &mut HttpHeaders,
    ) -> Result<bool, ProxyError> {
        loop {
            let line_end = match find_crlf(buf, 0) {
                Some(idx) => idx,
                None => {
                    if self.consumed + buf.len() > MAX_INITIAL_LINE_LEN {
                        return Err(ProxyError::parse(
                            "parseHeader error: header block too large",
                            buf.clone().freeze(),
                        ));
                    }
                    return Ok(false);
                }
            };
            if self.consumed + line_end + 2 > MAX_INITIAL_LINE_LEN {
                return Err(ProxyError::parse(
                    "parseHeader error: header block too large",
                    buf.clone().freeze(),
                ));
            }

            let line = buf.split_to(line_end + 2);
            let line = &line[..line_end];
            self.consumed += line_end + 2;

            if line.is_empty() {
                return Ok(true);
            }

            let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
                ProxyError::parse("parseHeader error: missing ':'", Bytes::copy_from_slice(line))
            })?;
            let name = &line[..colon];
            let mut value = &line[colon + 1..];
            if value.first() == Some(&b' ') {
                value = &value[1..];
            }

            let name = std::str::from_utf8(name).map_err(|_| {
                ProxyError::parse("parseHeader error", Bytes::copy_from_slice(line))
            })?;
            if name.is_empty() {
                return Err(ProxyError::parse(
                    "parseHeader error: empty field name",
                    Bytes::copy_from_slice(line),
                ));
            }
            // Header values are treated as Latin-1 on the wire; lossy decode
            // keeps odd-but-real traffic flowing.
            let value = String::from_utf8_lossy(value).into_owned();
            headers.append(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn buf(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn request_line_tokens() {
        let mut b = buf(b"GET /hello HTTP/1.1\r\nrest");
        let line = parse_initial_line(&mut b, MAX_INITIAL_LINE_LEN)
            .expect("parse")
            .expect("complete");
        assert_eq!(line.first, "GET");
        assert_eq!(line.second, "/hello");
        assert_eq!(line.third, "HTTP/1.1");
        assert_eq!(&b[..], b"rest");
    }

    #[test]
    fn third_token_keeps_embedded_spaces() {
        let mut b = buf(b"HTTP/1.1 404 Not Found\r\n");
        let line = parse_initial_line(&mut b, MAX_INITIAL_LINE_LEN)
            .expect("parse")
            .expect("complete");
        assert_eq!(line.first, "HTTP/1.1");
        assert_eq!(line.second, "404");
        assert_eq!(line.third, "Not Found");
    }

    #[test]
    fn incomplete_line_needs_more_bytes() {
        let mut b = buf(b"GET /hello HT");
        assert!(parse_initial_line(&mut b, MAX_INITIAL_LINE_LEN)
            .expect("no error")
            .is_none());
        assert_eq!(b.len(), 13);
    }

    #[rstest]
    #[case(b"GET\r\n".as_slice())]
    #[case(b"GET /only-two\r\n".as_slice())]
    #[case(b"\r\n".as_slice())]
    fn too_few_tokens_is_parse_error(#[case] data: &[u8]) {
        let mut b = buf(data);
        let err = parse_initial_line(&mut b, MAX_INITIAL_LINE_LEN).unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }

    #[test]
    fn line_at_limit_ok_one_more_fails() {
        // line_len bytes followed by CRLF, where line_len == max
        let max = 64;
        let mut line = vec![b'a'; max - 8];
        let mut data = b"GET /".to_vec();
        data.append(&mut line);
        data.extend_from_slice(b" HT\r\n");
        assert_eq!(data.len() - 2, max);

        let mut ok = buf(&data);
        assert!(parse_initial_line(&mut ok, max).expect("parse").is_some());

        let mut over = data.clone();
        over.insert(5, b'a');
        let mut over = buf(&over);
        assert!(parse_initial_line(&mut over, max).is_err());
    }

    #[test]
    fn unterminated_overlong_buffer_fails() {
        let mut b = buf(&vec![b'a'; MAX_INITIAL_LINE_LEN + 1]);
        assert!(parse_initial_line(&mut b, MAX_INITIAL_LINE_LEN).is_err());
    }

    #[test]
    fn header_block_parses_and_terminates() {
        let mut b = buf(b"Host: example.com\r\nAccept: */*\r\n\r\nBODY");
        let mut scanner = HeaderScanner::new();
        let mut headers = HttpHeaders::new();
        assert!(scanner.parse(&mut b, &mut headers).expect("parse"));
        assert_eq!(headers.get("host"), Some("example.com"));
        assert_eq!(headers.get("accept"), Some("*/*"));
        assert_eq!(&b[..], b"BODY");
    }

    #[test]
    fn header_block_resumes_across_partial_lines() {
        let mut scanner = HeaderScanner::new();
        let mut headers = HttpHeaders::new();

        let mut b = buf(b"Host: exam");
        assert!(!scanner.parse(&mut b, &mut headers).expect("parse"));
        assert_eq!(&b[..], b"Host: exam");

        b.extend_from_slice(b"ple.com\r\n\r\n");
        assert!(scanner.parse(&mut b, &mut headers).expect("parse"));
        assert_eq!(headers.get("Host"), Some("example.com"));
    }

    #[test]
    fn header_without_space_after_colon_is_accepted() {
        let mut b = buf(b"Host:example.com\r\n\r\n");
        let mut scanner = HeaderScanner::new();
        let mut headers = HttpHeaders::new();
        assert!(scanner.parse(&mut b, &mut headers).expect("parse"));
        assert_eq!(headers.get("Host"), Some("example.com"));
    }

    #[test]
    fn header_line_without_colon_fails() {
        let mut b = buf(b"not-a-header\r\n\r\n");
        let mut scanner = HeaderScanner::new();
        let mut headers = HttpHeaders::new();
        assert!(scanner.parse(&mut b, &mut headers).is_err());
    }

    #[test]
    fn oversized_header_block_fails() {
        let mut scanner = HeaderScanner::new();
        let mut headers = HttpHeaders::new();
        let mut data = Vec::new();
        for i in 0..600 {
            data.extend_from_slice(format!("X-Fill-{}: {}\r\n", i, "v".repeat(20)).as_bytes());
        }
        let mut b = buf(&data);
        assert!(scanner.parse(&mut b, &mut headers).is_err());
    }

    #[test]
    fn reset_allows_reuse_for_next_message() {
        let mut scanner = HeaderScanner::new();
        let mut headers = HttpHeaders::new();
        let mut b = buf(b"A: 1\r\n\r\n");
        assert!(scanner.parse(&mut b, &mut headers).expect("parse"));

        scanner.reset();
        let mut headers2 = HttpHeaders::new();
        let mut b2 = buf(b"B: 2\r\n\r\n");
        assert!(scanner.parse(&mut b2, &mut headers2).expect("parse"));
        assert_eq!(headers2.get("B"), Some("2"));
    }
}
