// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Incremental HTTP/1.x decoding and one-shot encoding.
//!
//! One codec instance serves one direction of one connection. Decoding is a
//! strict forward state machine (initial line, header block, body); emitting
//! a message resets it for the next message on the same connection. gzip
//! content is transparent: decoded after the body completes, re-encoded on
//! emission while the message still advertises `Content-Encoding: gzip`.

use bytes::{Bytes, BytesMut};

use crate::body::BodyReader;
use crate::error::ProxyError;
use crate::headers::HttpHeaders;
use crate::helpers::encoding;
use crate::lines::{parse_initial_line, HeaderScanner, MAX_INITIAL_LINE_LEN};
use crate::message::{HttpRequest, HttpResponse, Method, LENGTH_UNSET};

enum RequestState {
    ReadInitial,
    ReadHeader {
        msg: HttpRequest,
        scanner: HeaderScanner,
    },
    ReadBody {
        msg: HttpRequest,
        reader: BodyReader,
    },
}

/// Decoder for the client→proxy direction.
pub struct RequestCodec {
    state: RequestState,
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCodec {
    pub fn new() -> Self {
        Self {
            state: RequestState::ReadInitial,
        }
    }

    /// True when no message is partially decoded (a clean point to close).
    pub fn is_idle(&self) -> bool {
        matches!(self.state, RequestState::ReadInitial)
    }

    /// Consume buffered bytes; returns a request once one is complete.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<HttpRequest>, ProxyError> {
        loop {
            match std::mem::replace(&mut self.state, RequestState::ReadInitial) {
                RequestState::ReadInitial => {
                    let Some(line) = parse_initial_line(buf, MAX_INITIAL_LINE_LEN)? else {
                        return Ok(None);
                    };
                    let method = Method::from_token(&line.first).ok_or_else(|| {
                        ProxyError::parse(
                            format!("unknown method '{}'", line.first),
                            Bytes::from(line.first.clone().into_bytes()),
                        )
                    })?;
                    let msg = HttpRequest::new(method, line.second, line.third);
                    self.state = RequestState::ReadHeader {
                        msg,
                        scanner: HeaderScanner::new(),
                    };
                }
                RequestState::ReadHeader { mut msg, mut scanner } => {
                    if !scanner.parse(buf, &mut msg.headers)? {
                        self.state = RequestState::ReadHeader { msg, scanner };
                        return Ok(None);
                    }
                    msg.content_length =
                        msg.headers.content_length().unwrap_or(LENGTH_UNSET);
                    let reader = BodyReader::for_request(&msg.headers);
                    self.state = RequestState::ReadBody { msg, reader };
                }
                RequestState::ReadBody { mut msg, mut reader } => {
                    if !reader.feed(buf)? {
                        self.state = RequestState::ReadBody { msg, reader };
                        return Ok(None);
                    }
                    msg.body = reader.take_body();
                    decode_gzip_in_place(&msg.headers, &mut msg.body);
                    return Ok(Some(msg));
                }
            }
        }
    }

    /// Serialize a complete request to wire bytes.
    pub fn encode(req: &HttpRequest) -> Bytes {
        let initial = format!("{} {} {}", req.method, req.target, req.version);
        encode_message(&initial, &req.headers, &req.body)
    }
}

enum ResponseState {
    ReadInitial,
    ReadHeader {
        msg: HttpResponse,
        scanner: HeaderScanner,
    },
    ReadBody {
        msg: HttpResponse,
        reader: BodyReader,
    },
}

/// Decoder for the upstream→proxy direction.
pub struct ResponseCodec {
    state: ResponseState,
    head_only: bool,
}

impl Default for ResponseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCodec {
    pub fn new() -> Self {
        Self {
            state: ResponseState::ReadInitial,
            head_only: false,
        }
    }

    /// Mark the next response as a reply to HEAD (headers only, no body).
    pub fn expect_head_only(&mut self, head: bool) {
        self.head_only = head;
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ResponseState::ReadInitial)
    }

    /// True while decoding a body framed only by connection close.
    pub fn reading_until_close(&self) -> bool {
        matches!(&self.state, ResponseState::ReadBody { reader, .. } if reader.reads_until_close())
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<HttpResponse>, ProxyError> {
        loop {
            match std::mem::replace(&mut self.state, ResponseState::ReadInitial) {
                ResponseState::ReadInitial => {
                    let Some(line) = parse_initial_line(buf, MAX_INITIAL_LINE_LEN)? else {
                        return Ok(None);
                    };
                    let status: u16 = line.second.parse().map_err(|_| {
                        ProxyError::parse(
                            format!("invalid status code '{}'", line.second),
                            Bytes::from(line.second.clone().into_bytes()),
                        )
                    })?;
                    let msg = HttpResponse::new(line.first, status, line.third);
                    self.state = ResponseState::ReadHeader {
                        msg,
                        scanner: HeaderScanner::new(),
                    };
                }
                ResponseState::ReadHeader { mut msg, mut scanner } => {
                    if !scanner.parse(buf, &mut msg.headers)? {
                        self.state = ResponseState::ReadHeader { msg, scanner };
                        return Ok(None);
                    }
                    msg.content_length =
                        msg.headers.content_length().unwrap_or(LENGTH_UNSET);
                    let reader =
                        BodyReader::for_response(&msg.headers, msg.status, self.head_only);
                    self.state = ResponseState::ReadBody { msg, reader };
                }
                ResponseState::ReadBody { mut msg, mut reader } => {
                    if !reader.feed(buf)? {
                        self.state = ResponseState::ReadBody { msg, reader };
                        return Ok(None);
                    }
                    return Ok(Some(self.finish(msg, &mut reader)));
                }
            }
        }
    }

    /// Signal upstream EOF. Completes an until-close body; mid-message EOF
    /// anywhere else is a parse error, and EOF between messages yields None.
    pub fn on_eof(&mut self) -> Result<Option<HttpResponse>, ProxyError> {
        match std::mem::replace(&mut self.state, ResponseState::ReadInitial) {
            ResponseState::ReadInitial => Ok(None),
            ResponseState::ReadBody { msg, mut reader } => {
                if reader.on_eof() {
                    Ok(Some(self.finish(msg, &mut reader)))
                } else {
                    Err(ProxyError::parse(
                        "unexpected EOF mid-message",
                        Bytes::new(),
                    ))
                }
            }
            ResponseState::ReadHeader { .. } => Err(ProxyError::parse(
                "unexpected EOF mid-message",
                Bytes::new(),
            )),
        }
    }

    fn finish(&mut self, mut msg: HttpResponse, reader: &mut BodyReader) -> HttpResponse {
        msg.body = reader.take_body();
        decode_gzip_in_place(&msg.headers, &mut msg.body);
        self.head_only = false;
        msg
    }

    /// Serialize a complete response to wire bytes.
    pub fn encode(resp: &HttpResponse) -> Bytes {
        let initial = format!("{} {} {}", resp.version, resp.status, resp.reason);
        encode_message(&initial, &resp.headers, &resp.body)
    }
}

/// Replace a completed gzip body with its decoded contents. A broken stream
/// keeps the raw bytes and logs a warning instead of failing the exchange.
fn decode_gzip_in_place(headers: &HttpHeaders, body: &mut Bytes) {
    if headers.content_encoding().as_deref() != Some("gzip") || body.is_empty() {
        return;
    }
    match encoding::gzip_decode(body) {
        Ok(decoded) => *body = Bytes::from(decoded),
        Err(e) => {
            tracing::warn!(error = %e, "gzip decode failed, keeping raw body");
        }
    }
}

fn encode_message(initial: &str, headers: &HttpHeaders, body: &Bytes) -> Bytes {
    let mut headers = headers.clone();
    let mut body = body.clone();

    if headers.content_encoding().as_deref() == Some("gzip") && !body.is_empty() {
        body = Bytes::from(encoding::gzip_encode(&body));
    }

    headers.remove("Transfer-Encoding");
    if !body.is_empty() {
        headers.set("Content-Length", body.len().to_string());
    } else if headers.contains("Content-Length") {
        headers.set("Content-Length", "0");
    }

    let mut out = BytesMut::with_capacity(initial.len() + 2 + headers.len() * 32 + body.len());
    out.extend_from_slice(initial.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn decode_simple_request() {
        let mut codec = RequestCodec::new();
        let mut b = buf(b"GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let req = codec.decode(&mut b).expect("decode").expect("complete");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/hello");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.headers.get("host"), Some("example.com"));
        assert!(req.body.is_empty());
        assert_eq!(req.content_length, LENGTH_UNSET);
        assert!(codec.is_idle());
    }

    #[test]
    fn decode_across_split_reads() {
        let mut codec = RequestCodec::new();
        let wire = b"POST /api HTTP/1.1\r\nHost: e\r\nContent-Length: 5\r\n\r\nhello";
        let mut b = BytesMut::new();
        for chunk in wire.chunks(7) {
            b.extend_from_slice(chunk);
            if let Some(req) = codec.decode(&mut b).expect("decode") {
                assert_eq!(req.body, Bytes::from_static(b"hello"));
                assert_eq!(req.content_length, 5);
                return;
            }
        }
        panic!("request never completed");
    }

    #[test]
    fn decode_two_requests_back_to_back() {
        let mut codec = RequestCodec::new();
        let mut b = buf(b"GET /a HTTP/1.1\r\nHost: e\r\n\r\nGET /b HTTP/1.1\r\nHost: e\r\n\r\n");
        let first = codec.decode(&mut b).expect("decode").expect("first");
        assert_eq!(first.target, "/a");
        assert!(codec.is_idle());
        let second = codec.decode(&mut b).expect("decode").expect("second");
        assert_eq!(second.target, "/b");
        assert!(b.is_empty());
    }

    #[test]
    fn decode_chunked_request_body() {
        let mut codec = RequestCodec::new();
        let mut b = buf(
            b"POST / HTTP/1.1\r\nHost: e\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        let req = codec.decode(&mut b).expect("decode").expect("complete");
        assert_eq!(req.body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn transfer_encoding_wins_over_content_length() {
        let mut codec = RequestCodec::new();
        let mut b = buf(
            b"POST / HTTP/1.1\r\nHost: e\r\nTransfer-Encoding: chunked\r\nContent-Length: 9999\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        let req = codec.decode(&mut b).expect("decode").expect("complete");
        assert_eq!(req.body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn malformed_request_line_is_parse_error() {
        let mut codec = RequestCodec::new();
        let mut b = buf(b"GET\r\n\r\n");
        let err = codec.decode(&mut b).unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }

    #[test]
    fn unknown_method_is_parse_error() {
        let mut codec = RequestCodec::new();
        let mut b = buf(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert!(codec.decode(&mut b).is_err());
    }

    #[test]
    fn decode_response_with_body() {
        let mut codec = ResponseCodec::new();
        let mut b = buf(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let resp = codec.decode(&mut b).expect("decode").expect("complete");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.body, Bytes::from_static(b"hello"));
        assert!(codec.is_idle());
    }

    #[test]
    fn decode_response_until_close() {
        let mut codec = ResponseCodec::new();
        let mut b = buf(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\npartial");
        assert!(codec.decode(&mut b).expect("decode").is_none());
        assert!(codec.reading_until_close());
        let resp = codec.on_eof().expect("eof").expect("finalized");
        assert_eq!(resp.body, Bytes::from_static(b"partial"));
    }

    #[test]
    fn eof_mid_header_is_error() {
        let mut codec = ResponseCodec::new();
        let mut b = buf(b"HTTP/1.1 200 OK\r\nContent-");
        assert!(codec.decode(&mut b).expect("decode").is_none());
        assert!(codec.on_eof().is_err());
    }

    #[test]
    fn eof_between_messages_is_clean() {
        let mut codec = ResponseCodec::new();
        assert!(codec.on_eof().expect("eof").is_none());
    }

    #[test]
    fn head_reply_carries_no_body() {
        let mut codec = ResponseCodec::new();
        codec.expect_head_only(true);
        let mut b = buf(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n");
        let resp = codec.decode(&mut b).expect("decode").expect("complete");
        assert!(resp.body.is_empty());
        assert_eq!(resp.content_length, 1234);
    }

    #[test]
    fn gzip_body_is_decoded_transparently() {
        let gz = encoding::gzip_encode(b"hello world");
        let mut wire = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            gz.len()
        )
        .into_bytes();
        wire.extend_from_slice(&gz);

        let mut codec = ResponseCodec::new();
        let mut b = BytesMut::from(&wire[..]);
        let resp = codec.decode(&mut b).expect("decode").expect("complete");
        assert_eq!(resp.body, Bytes::from_static(b"hello world"));
        assert_eq!(resp.headers.content_encoding().as_deref(), Some("gzip"));
    }

    #[test]
    fn encode_regzips_when_advertised() {
        let mut resp = HttpResponse::new("HTTP/1.1", 200, "OK");
        resp.headers.set("Content-Encoding", "gzip");
        resp.body = Bytes::from_static(b"hello world");

        let wire = ResponseCodec::encode(&resp);
        let mut codec = ResponseCodec::new();
        let mut b = BytesMut::from(&wire[..]);
        let back = codec.decode(&mut b).expect("decode").expect("complete");
        assert_eq!(back.body, Bytes::from_static(b"hello world"));
    }

    #[test]
    fn encode_strips_transfer_encoding_and_sets_length() {
        let mut resp = HttpResponse::new("HTTP/1.1", 200, "OK");
        resp.headers.set("Transfer-Encoding", "chunked");
        resp.body = Bytes::from_static(b"data!");

        let wire = ResponseCodec::encode(&resp);
        let text = String::from_utf8(wire.to_vec()).expect("utf8");
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.contains("Content-Length: 5"));
        assert!(text.ends_with("\r\n\r\ndata!"));
    }

    #[test]
    fn encode_decode_roundtrip_preserves_message() {
        let mut req = HttpRequest::new(Method::Post, "/submit", "HTTP/1.1");
        req.headers.append("Host", "example.com");
        req.headers.append("X-Multi", "one");
        req.headers.append("X-Multi", "two");
        req.body = Bytes::from_static(b"payload");

        let wire = RequestCodec::encode(&req);
        let mut codec = RequestCodec::new();
        let mut b = BytesMut::from(&wire[..]);
        let back = codec.decode(&mut b).expect("decode").expect("complete");

        assert_eq!(back.method, req.method);
        assert_eq!(back.target, req.target);
        assert_eq!(back.version, req.version);
        assert_eq!(back.body, req.body);
        assert_eq!(back.headers.get_all("x-multi"), vec!["one", "two"]);
        assert_eq!(back.headers.get("host"), Some("example.com"));
    }

    #[test]
    fn encode_preserves_header_name_order_and_casing() {
        let mut req = HttpRequest::new(Method::Get, "/", "HTTP/1.1");
        req.headers.append("HOST", "e");
        req.headers.append("x-first", "1");
        req.headers.append("X-Second", "2");

        let wire = RequestCodec::encode(&req);
        let text = String::from_utf8(wire.to_vec()).expect("utf8");
        let host_at = text.find("HOST: e").expect("host");
        let first_at = text.find("x-first: 1").expect("first");
        let second_at = text.find("X-Second: 2").expect("second");
        assert!(host_at < first_at && first_at < second_at);
    }

    #[test]
    fn status_line_with_empty_buffer_needs_more() {
        let mut codec = ResponseCodec::new();
        let mut b = BytesMut::new();
        assert!(codec.decode(&mut b).expect("decode").is_none());
    }
}
