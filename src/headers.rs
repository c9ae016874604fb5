// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Case-insensitive multi-valued header store.
//!
//! Field names keep the casing they first arrived with so emission reproduces
//! the wire form; lookup and removal are case-insensitive. Value order within
//! a name and name insertion order are both preserved.

/// Ordered header multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    entries: Vec<(String, Vec<String>)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, creating the name entry on first use.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entry_mut(&name) {
            Some(values) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Replace all values for a name (keeps the stored casing if the name
    /// already exists, otherwise records the given casing).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entry_mut(&name) {
            Some(values) => {
                values.clear();
                values.push(value);
            }
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Remove every value under a name. Returns true if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    /// First value under a name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first().map(String::as_str))
    }

    /// All values under a name, in arrival order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Iterate `(name, value)` pairs in stored order, one pair per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, values)| values.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    /// Iterate names with their full value lists in stored order.
    pub fn iter_names(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Case-insensitive structural equality, ignoring name order differences
    /// but requiring per-name value sequences to match.
    pub fn same_fields(&self, other: &HttpHeaders) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries
            .iter()
            .all(|(name, values)| other.get_all(name) == values.iter().map(String::as_str).collect::<Vec<_>>())
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }

    // ---- derived accessors for standard fields ----

    /// Declared Content-Length, when present and numeric.
    pub fn content_length(&self) -> Option<i64> {
        self.get("Content-Length")
            .and_then(|v| v.trim().parse::<i64>().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    /// First Content-Encoding token, lowercased.
    pub fn content_encoding(&self) -> Option<String> {
        self.get("Content-Encoding")
            .map(|v| v.trim().to_ascii_lowercase())
    }

    pub fn transfer_encoding(&self) -> Option<&str> {
        self.get("Transfer-Encoding")
    }

    /// True when Transfer-Encoding contains the `chunked` coding.
    pub fn is_chunked(&self) -> bool {
        self.get_all("Transfer-Encoding").iter().any(|v| {
            list_tokens(v).any(|t| t.eq_ignore_ascii_case("chunked"))
        })
    }

    /// All cookie pairs from every Cookie header, in order.
    pub fn cookies(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for value in self.get_all("Cookie") {
            for pair in value.split(';') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((k, v)) => out.push((k.trim().to_string(), v.trim().to_string())),
                    None => out.push((pair.to_string(), String::new())),
                }
            }
        }
        out
    }

    /// True when a Connection header contains the given token.
    pub fn connection_has(&self, token: &str) -> bool {
        self.get_all("Connection")
            .iter()
            .any(|v| list_tokens(v).any(|t| t.eq_ignore_ascii_case(token)))
    }
}

/// Split a comma-separated header value into trimmed non-empty tokens.
fn list_tokens(val: &str) -> impl Iterator<Item = &str> {
    val.split(',').map(|s| s.trim()).filter(|s| !s.is_empty())
}
