// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Exchange event delivery to UI subscribers.
//!
//! Publishing never blocks an exchange: with no subscriber installed the
//! event is dropped, and a subscriber that falls behind loses the oldest
//! events first (broadcast lagging semantics).

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::message::{HttpRequest, HttpResponse};

const DEFAULT_CAPACITY: usize = 256;

/// How the exchange ended; mirrors the error kinds the engine surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Complete,
    ParseError,
    UpstreamConnectError,
    UpstreamTimeoutError,
    TunnelError,
    Aborted,
}

impl ExchangeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::ParseError => "ParseError",
            Self::UpstreamConnectError => "UpstreamConnectError",
            Self::UpstreamTimeoutError => "UpstreamTimeoutError",
            Self::TunnelError => "TunnelError",
            Self::Aborted => "Aborted",
        }
    }

    /// Map an engine error to its event tag.
    pub fn from_error(err: &crate::error::ProxyError) -> Self {
        match err {
            crate::error::ProxyError::Parse { .. } => Self::ParseError,
            crate::error::ProxyError::UpstreamConnect(_) => Self::UpstreamConnectError,
            crate::error::ProxyError::UpstreamTimeout(_) => Self::UpstreamTimeoutError,
            crate::error::ProxyError::Tunnel(_) => Self::TunnelError,
            _ => Self::Aborted,
        }
    }
}

/// One record per exchange, published after the response (if any) is final.
#[derive(Debug, Clone)]
pub struct ExchangeEvent {
    pub id: Uuid,
    /// Absent when the request never parsed (e.g. malformed request-line).
    pub request: Option<HttpRequest>,
    /// Absent when the exchange aborted before a response was available.
    pub response: Option<HttpResponse>,
    pub remote_addr: String,
    pub duration_ms: u64,
    pub outcome: ExchangeOutcome,
}

impl ExchangeEvent {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: None,
            response: None,
            remote_addr: remote_addr.into(),
            duration_ms: 0,
            outcome: ExchangeOutcome::Complete,
        }
    }
}

/// Fan-out handle shared by the engine and its subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<ExchangeEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ExchangeEvent>> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish; a send error just means nobody is listening.
    pub fn publish(&self, event: ExchangeEvent) {
        let _ = self.tx.send(Arc::new(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let mut event = ExchangeEvent::new("127.0.0.1:5000");
        event.request = Some(HttpRequest::new(Method::Get, "/x", "HTTP/1.1"));
        event.duration_ms = 12;
        bus.publish(event);

        let received = rx.recv().await.expect("recv");
        assert_eq!(received.remote_addr, "127.0.0.1:5000");
        assert_eq!(received.duration_ms, 12);
        assert_eq!(received.outcome, ExchangeOutcome::Complete);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(8);
        bus.publish(ExchangeEvent::new("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5u64 {
            let mut ev = ExchangeEvent::new("127.0.0.1:1");
            ev.duration_ms = i;
            bus.publish(ev);
        }
        // first recv reports the lag, subsequent recvs yield the newest two
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {:?}", other.map(|e| e.duration_ms)),
        }
        assert_eq!(rx.recv().await.expect("recv").duration_ms, 3);
        assert_eq!(rx.recv().await.expect("recv").duration_ms, 4);
    }

    #[test]
    fn outcome_tags_match_error_kinds() {
        use crate::error::ProxyError;
        let err = ProxyError::parse("x", bytes::Bytes::new());
        assert_eq!(
            ExchangeOutcome::from_error(&err).as_str(),
            err.kind()
        );
        let err = ProxyError::UpstreamConnect("refused".into());
        assert_eq!(
            ExchangeOutcome::from_error(&err).as_str(),
            err.kind()
        );
    }
}
