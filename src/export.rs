// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! JSONL persistence of captured exchanges.
//!
//! Each line is one exchange record; message bodies are stored as Latin-1
//! strings (one code unit per byte) so binary content survives without
//! base64 framing.

use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::ProxyError;
use crate::events::ExchangeEvent;
use crate::headers::HttpHeaders;
use crate::helpers::encoding::{latin1_to_string, string_to_latin1};
use crate::message::{HttpRequest, HttpResponse, Method, LENGTH_UNSET};

/// Append-only JSONL writer shared across connection tasks.
#[derive(Clone)]
pub struct ExchangeWriter {
    file: ArcFile,
}

#[derive(Clone)]
struct ArcFile {
    inner: std::sync::Arc<Mutex<tokio::fs::File>>,
}

impl ArcFile {
    async fn new(path: &PathBuf) -> anyhow::Result<Self> {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            inner: std::sync::Arc::new(Mutex::new(f)),
        })
    }

    async fn write_line(&self, line: &str) -> anyhow::Result<()> {
        let mut file = self.inner.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

impl ExchangeWriter {
    pub async fn new<P: Into<PathBuf>>(path: P) -> anyhow::Result<Self> {
        let path: PathBuf = path.into();
        let file = ArcFile::new(&path).await?;
        Ok(Self { file })
    }

    /// Append one exchange record.
    pub async fn write_exchange(&self, event: &ExchangeEvent) -> anyhow::Result<()> {
        let record = json!({
            "id": event.id.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "remoteAddress": event.remote_addr,
            "durationMs": event.duration_ms,
            "kind": event.outcome.as_str(),
            "request": event.request.as_ref().map(request_to_json),
            "response": event.response.as_ref().map(response_to_json),
        });
        self.file.write_line(&record.to_string()).await?;
        Ok(())
    }
}

/// One exchange loaded back from a JSONL file.
#[derive(Debug)]
pub struct LoadedExchange {
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub remote_addr: String,
    pub duration_ms: u64,
    pub kind: String,
}

/// Read exchange records back, skipping malformed lines with a warning.
pub async fn load_exchanges<P: AsRef<std::path::Path>>(
    path: P,
) -> anyhow::Result<Vec<LoadedExchange>> {
    use tokio::io::AsyncBufReadExt;

    let path_ref = path.as_ref();
    if !tokio::fs::try_exists(path_ref).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    let file = tokio::fs::File::open(path_ref).await?;
    let reader = tokio::io::BufReader::new(file);
    let mut lines = reader.lines();
    let mut records = Vec::new();
    let mut line_num = 0;

    while let Some(line) = lines.next_line().await? {
        line_num += 1;
        if line.trim().is_empty() {
            continue;
        }
        match parse_record(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(line = line_num, error = %e, "skipping malformed exchange record");
            }
        }
    }

    Ok(records)
}

fn parse_record(line: &str) -> Result<LoadedExchange, ProxyError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| ProxyError::Config(format!("bad record JSON: {}", e)))?;
    let request = match value.get("request") {
        Some(Value::Null) | None => None,
        Some(v) => Some(request_from_json(v)?),
    };
    let response = match value.get("response") {
        Some(Value::Null) | None => None,
        Some(v) => Some(response_from_json(v)?),
    };
    Ok(LoadedExchange {
        request,
        response,
        remote_addr: value
            .get("remoteAddress")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        duration_ms: value
            .get("durationMs")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
        kind: value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("complete")
            .to_string(),
    })
}

/// Serialize a request in its persisted shape.
pub fn request_to_json(req: &HttpRequest) -> Value {
    json!({
        "_class": "HttpRequest",
        "uri": req.target,
        "method": req.method.as_str(),
        "headers": headers_to_json(&req.headers),
        "body": body_to_json(&req.body),
    })
}

/// Serialize a response in its persisted shape.
pub fn response_to_json(resp: &HttpResponse) -> Value {
    json!({
        "_class": "HttpResponse",
        "protocolVersion": resp.version,
        "status": { "code": resp.status, "reasonPhrase": resp.reason },
        "headers": headers_to_json(&resp.headers),
        "body": body_to_json(&resp.body),
    })
}

pub fn request_from_json(value: &Value) -> Result<HttpRequest, ProxyError> {
    expect_class(value, "HttpRequest")?;
    let method_token = field_str(value, "method")?;
    let method = Method::from_token(method_token).ok_or_else(|| {
        ProxyError::Config(format!("unknown method '{}' in record", method_token))
    })?;
    let mut req = HttpRequest::new(method, field_str(value, "uri")?, "HTTP/1.1");
    req.headers = headers_from_json(value.get("headers"))?;
    req.body = body_from_json(value.get("body"))?;
    req.content_length = req.headers.content_length().unwrap_or(LENGTH_UNSET);
    Ok(req)
}

pub fn response_from_json(value: &Value) -> Result<HttpResponse, ProxyError> {
    expect_class(value, "HttpResponse")?;
    let status = value
        .get("status")
        .and_then(|s| s.get("code"))
        .and_then(Value::as_u64)
        .ok_or_else(|| ProxyError::Config("record missing status.code".into()))?;
    let reason = value
        .get("status")
        .and_then(|s| s.get("reasonPhrase"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let version = value
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or("HTTP/1.1");
    let mut resp = HttpResponse::new(version, status as u16, reason);
    resp.headers = headers_from_json(value.get("headers"))?;
    resp.body = body_from_json(value.get("body"))?;
    resp.content_length = resp.headers.content_length().unwrap_or(LENGTH_UNSET);
    Ok(resp)
}

fn expect_class(value: &Value, class: &str) -> Result<(), ProxyError> {
    match value.get("_class").and_then(Value::as_str) {
        Some(found) if found == class => Ok(()),
        other => Err(ProxyError::Config(format!(
            "expected _class {}, found {:?}",
            class, other
        ))),
    }
}

fn field_str<'a>(value: &'a Value, name: &str) -> Result<&'a str, ProxyError> {
    value
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::Config(format!("record missing '{}'", name)))
}

fn headers_to_json(headers: &HttpHeaders) -> Value {
    let mut map = Map::new();
    for (name, values) in headers.iter_names() {
        map.insert(
            name.to_string(),
            Value::Array(values.iter().map(|v| Value::String(v.clone())).collect()),
        );
    }
    Value::Object(map)
}

fn headers_from_json(value: Option<&Value>) -> Result<HttpHeaders, ProxyError> {
    let mut headers = HttpHeaders::new();
    let Some(Value::Object(map)) = value else {
        return Ok(headers);
    };
    for (name, values) in map {
        match values {
            Value::Array(items) => {
                for item in items {
                    let v = item.as_str().ok_or_else(|| {
                        ProxyError::Config(format!("non-string value under header '{}'", name))
                    })?;
                    headers.append(name.clone(), v);
                }
            }
            Value::String(v) => headers.append(name.clone(), v.clone()),
            _ => {
                return Err(ProxyError::Config(format!(
                    "bad values under header '{}'",
                    name
                )))
            }
        }
    }
    Ok(headers)
}

fn body_to_json(body: &bytes::Bytes) -> Value {
    if body.is_empty() {
        Value::Null
    } else {
        Value::String(latin1_to_string(body))
    }
}

fn body_from_json(value: Option<&Value>) -> Result<bytes::Bytes, ProxyError> {
    match value {
        Some(Value::String(s)) => string_to_latin1(s)
            .map(bytes::Bytes::from)
            .ok_or_else(|| ProxyError::Config("body is not a Latin-1 string".into())),
        Some(Value::Null) | None => Ok(bytes::Bytes::new()),
        Some(_) => Err(ProxyError::Config("body is not a string".into())),
    }
}
