// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Streaming body consumption under the HTTP/1.x framing rules.
//!
//! RFC 7230 §3.3.3: chunked wins over Content-Length, responses without
//! framing run until connection close, and 1xx/204/304 plus replies to HEAD
//! carry no body at all.

use bytes::{Bytes, BytesMut};

use crate::error::ProxyError;
use crate::headers::HttpHeaders;
use crate::lines::find_crlf;

/// Cap for until-close bodies; reaching it truncates with a warning.
pub const MAX_BODY_LEN: usize = 4_096_000;

#[derive(Debug)]
enum ChunkState {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

#[derive(Debug)]
enum Framing {
    Chunked(ChunkState),
    Fixed { remaining: usize },
    UntilClose,
    Empty,
}

/// Incremental body reader; callers feed it buffered slices as they arrive.
/// After it reports done, no further bytes are consumed.
#[derive(Debug)]
pub struct BodyReader {
    framing: Framing,
    body: BytesMut,
    done: bool,
    truncated: bool,
}

impl BodyReader {
    /// Select framing for a request: chunked, then Content-Length; requests
    /// without either carry no body.
    pub fn for_request(headers: &HttpHeaders) -> Self {
        if headers.is_chunked() {
            return Self::with_framing(Framing::Chunked(ChunkState::Size));
        }
        match headers.content_length() {
            Some(n) if n > 0 => Self::with_framing(Framing::Fixed {
                remaining: n as usize,
            }),
            _ => Self::with_framing(Framing::Empty),
        }
    }

    /// Select framing for a response with the given status; `head` marks a
    /// reply to a HEAD request.
    pub fn for_response(headers: &HttpHeaders, status: u16, head: bool) -> Self {
        if head || (100..200).contains(&status) || status == 204 || status == 304 {
            return Self::with_framing(Framing::Empty);
        }
        if headers.is_chunked() {
            return Self::with_framing(Framing::Chunked(ChunkState::Size));
        }
        match headers.content_length() {
            Some(n) if n > 0 => Self::with_framing(Framing::Fixed {
                remaining: n as usize,
            }),
            Some(_) => Self::with_framing(Framing::Empty),
            None => Self::with_framing(Framing::UntilClose),
        }
    }

    fn with_framing(framing: Framing) -> Self {
        let done = matches!(framing, Framing::Empty);
        Self {
            framing,
            body: BytesMut::new(),
            done,
            truncated: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// True for response bodies framed only by connection close.
    pub fn reads_until_close(&self) -> bool {
        matches!(self.framing, Framing::UntilClose)
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    /// Consume what the current framing allows from `buf`; returns done.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<bool, ProxyError> {
        if self.done {
            return Ok(true);
        }
        match &mut self.framing {
            Framing::Empty => {
                self.done = true;
            }
            Framing::Fixed { remaining } => {
                let take = (*remaining).min(buf.len());
                self.body.extend_from_slice(&buf.split_to(take));
                *remaining -= take;
                if *remaining == 0 {
                    self.done = true;
                }
            }
            Framing::UntilClose => {
                self.body.extend_from_slice(&buf.split_to(buf.len()));
                if self.body.len() >= MAX_BODY_LEN {
                    tracing::warn!(
                        limit = MAX_BODY_LEN,
                        "body length limit reached, truncating"
                    );
                    self.body.truncate(MAX_BODY_LEN);
                    self.truncated = true;
                    self.done = true;
                }
            }
            Framing::Chunked(_) => {
                self.feed_chunked(buf)?;
            }
        }
        Ok(self.done)
    }

    /// Signal end-of-stream. Finalizes until-close bodies; returns done.
    pub fn on_eof(&mut self) -> bool {
        if matches!(self.framing, Framing::UntilClose) {
            self.done = true;
        }
        self.done
    }

    /// The accumulated body. Valid once done.
    pub fn take_body(&mut self) -> Bytes {
        std::mem::take(&mut self.body).freeze()
    }

    fn feed_chunked(&mut self, buf: &mut BytesMut) -> Result<(), ProxyError> {
        loop {
            let Framing::Chunked(state) = &mut self.framing else {
                unreachable!("feed_chunked requires chunked framing");
            };
            match state {
                ChunkState::Size => {
                    let Some(line_end) = find_crlf(buf, 0) else {
                        return Ok(());
                    };
                    let line = buf.split_to(line_end + 2);
                    let line = &line[..line_end];
                    let size_part = match line.iter().position(|&b| b == b';') {
                        Some(semi) => &line[..semi],
                        None => line,
                    };
                    let size_text = std::str::from_utf8(size_part)
                        .map_err(|_| chunk_error(line))?
                        .trim();
                    let size = usize::from_str_radix(size_text, 16)
                        .map_err(|_| chunk_error(line))?;
                    *state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    let take = (*remaining).min(buf.len());
                    self.body.extend_from_slice(&buf.split_to(take));
                    *remaining -= take;
                    if *remaining > 0 {
                        return Ok(());
                    }
                    *state = ChunkState::DataCrlf;
                }
                ChunkState::DataCrlf => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    let sep = buf.split_to(2);
                    if &sep[..] != b"\r\n" {
                        return Err(chunk_error(&sep));
                    }
                    *state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(line_end) = find_crlf(buf, 0) else {
                        return Ok(());
                    };
                    let line = buf.split_to(line_end + 2);
                    if line_end == 0 {
                        self.done = true;
                        return Ok(());
                    }
                    // trailers are discarded
                    let _ = line;
                }
            }
        }
    }
}

fn chunk_error(context: &[u8]) -> ProxyError {
    ProxyError::parse(
        "parseBody error: malformed chunk framing",
        Bytes::copy_from_slice(context),
    )
}
