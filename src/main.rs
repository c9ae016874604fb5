// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use httptap::config::{Config, ConfigStore};
use httptap::events::EventBus;
use httptap::export::ExchangeWriter;
use httptap::proxy::ProxyEngine;

#[derive(Parser, Debug)]
#[command(name = "httptap")]
struct Args {
    /// Listen port override (falls back to the config file, default 9999)
    #[arg(long)]
    listen_port: Option<u16>,

    /// Optional TOML configuration path
    #[arg(long)]
    config: Option<String>,

    /// Optional JSONL path to persist captured exchanges
    #[arg(long)]
    export: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut cfg = if let Some(ref p) = args.config {
        Config::load_from_path(p).await.unwrap_or_else(|e| {
            warn!(%p, %e, "failed to load config, using defaults");
            Config::default()
        })
    } else {
        Config::default()
    };
    if let Some(port) = args.listen_port {
        cfg.listen_port = port;
    }
    cfg.validate()?;

    let mut store = ConfigStore::new(cfg);
    if let Some(path) = args.config.clone() {
        store.on_flush(move |cfg| {
            let cfg = cfg.clone();
            let path = path.clone();
            tokio::spawn(async move {
                if let Err(e) = cfg.save_to_path(&path).await {
                    warn!(%path, %e, "failed to persist configuration");
                }
            });
        });
    }

    let events = EventBus::default();
    spawn_exchange_logger(&events);

    let mut engine = ProxyEngine::new(store.subscribe(), events);
    if let Some(path) = args.export {
        engine = engine.with_exporter(ExchangeWriter::new(path).await?);
    }

    tokio::select! {
        res = engine.run() => {
            if let Err(e) = res {
                error!(%e, "engine error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}

/// Log one line per exchange; this is the CLI's stand-in for a UI subscriber.
fn spawn_exchange_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let method = ev
                        .request
                        .as_ref()
                        .map(|r| r.method.as_str())
                        .unwrap_or("-");
                    let uri = ev
                        .request
                        .as_ref()
                        .map(|r| r.target.as_str())
                        .unwrap_or("-");
                    let status = ev.response.as_ref().map(|r| r.status);
                    info!(
                        method,
                        uri,
                        status = ?status,
                        duration_ms = ev.duration_ms,
                        kind = ev.outcome.as_str(),
                        "exchange"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "exchange log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
