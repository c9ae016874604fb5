// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use httptap::config::{Config, ConfigStore};
use httptap::events::EventBus;
use httptap::proxy::ProxyEngine;

pub struct TestProxy {
    pub addr: SocketAddr,
    pub store: ConfigStore,
    pub events: EventBus,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Start the engine on a free port and wait until it accepts connections.
pub async fn start_proxy_and_wait(mut cfg: Config) -> anyhow::Result<TestProxy> {
    // choose a free port by binding then dropping
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    cfg.listen_port = port;

    let store = ConfigStore::new(cfg);
    let events = EventBus::default();
    let engine = ProxyEngine::new(store.subscribe(), events.clone());
    let handle = tokio::spawn(async move {
        let _ = engine.run().await;
    });

    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            anyhow::bail!("timeout waiting for proxy to start");
        }
        if let Ok(stream) = TcpStream::connect(addr).await {
            drop(stream);
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }

    Ok(TestProxy {
        addr,
        store,
        events,
        handle,
    })
}

/// Read everything until the peer closes, with a safety deadline.
pub async fn read_to_eof(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            anyhow::bail!("timeout reading response");
        }
        let mut tmp = [0u8; 2048];
        match timeout(Duration::from_millis(500), stream.read(&mut tmp)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => out.extend_from_slice(&tmp[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
    Ok(out)
}

/// Read exactly one Content-Length framed response head plus body.
pub async fn read_one_response(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);

    let head_end = loop {
        if let Some(pos) = out.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if Instant::now() > deadline {
            anyhow::bail!("timeout reading response head");
        }
        let mut tmp = [0u8; 2048];
        let n = timeout(Duration::from_secs(1), stream.read(&mut tmp)).await??;
        if n == 0 {
            anyhow::bail!("unexpected EOF reading response head");
        }
        out.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&out[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while out.len() < head_end + content_length {
        if Instant::now() > deadline {
            anyhow::bail!("timeout reading response body");
        }
        let mut tmp = [0u8; 2048];
        let n = timeout(Duration::from_secs(1), stream.read(&mut tmp)).await??;
        if n == 0 {
            anyhow::bail!("unexpected EOF reading response body");
        }
        out.extend_from_slice(&tmp[..n]);
    }

    Ok(out)
}

/// Send one absolute-form request through the proxy.
pub async fn send_request(stream: &mut TcpStream, request: &str) -> anyhow::Result<()> {
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
