// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Content-coding and byte/string conversions used by the codec and exporter.
//!
//! gzip is decoded on ingest and re-encoded on emit; brotli is decoded for
//! display only. Bodies persist to JSON as Latin-1 strings (one code unit per
//! byte) so binary content survives without base64 framing.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Decode a complete gzip stream.
pub fn gzip_decode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// gzip-encode a complete body. Encoding into a `Vec` cannot fail; if the
/// encoder errors anyway the input is returned unchanged with a warning.
pub fn gzip_encode(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let result = encoder
        .write_all(data)
        .and_then(|_| encoder.finish());
    match result {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(error = %e, "gzip encode failed, emitting identity body");
            data.to_vec()
        }
    }
}

/// Decode a complete brotli stream.
pub fn brotli_decode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = brotli::Decompressor::new(data, 4096);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Map each byte to the char with the same code point (ISO-8859-1).
pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Inverse of [`latin1_to_string`]. Returns `None` if any char is above U+00FF.
pub fn string_to_latin1(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        let cp = c as u32;
        if cp > 0xFF {
            return None;
        }
        out.push(cp as u8);
    }
    Some(out)
}
