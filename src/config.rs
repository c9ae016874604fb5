// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration model and the command-based store that drives the engine.
//!
//! The engine never reads a shared mutable config: every exchange takes an
//! `Arc<Config>` snapshot at its start, and UI-style edits go through typed
//! [`ConfigCommand`]s applied by a single writer. Each applied command
//! publishes a fresh snapshot (restarting the listener when the port changed)
//! and invokes the registered flush callback for persistence.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ProxyError;
use crate::rewrite::{host_glob_match, RequestRewriteRule, RequestRewrites};

fn default_listen_port() -> u16 {
    9999
}

/// Upstream (external) proxy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalProxy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Host globs that connect directly even when the proxy is enabled.
    #[serde(default)]
    pub bypass: Vec<String>,
}

impl ExternalProxy {
    /// True when the target host should skip the external proxy.
    pub fn bypasses(&self, host: &str) -> bool {
        self.bypass.iter().any(|glob| host_glob_match(glob, host))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    Allow,
    #[default]
    Deny,
}

/// Host allow/deny list applied before dialing upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostFilter {
    #[serde(default)]
    pub mode: FilterMode,
    #[serde(default)]
    pub list: Vec<String>,
}

impl HostFilter {
    /// An empty allow-list admits everything; an empty deny-list denies
    /// nothing.
    pub fn allows(&self, host: &str) -> bool {
        let matched = self.list.iter().any(|glob| host_glob_match(glob, host));
        match self.mode {
            FilterMode::Allow => self.list.is_empty() || matched,
            FilterMode::Deny => !matched,
        }
    }
}

/// Engine timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    pub client_idle_secs: u64,
    pub upstream_connect_secs: u64,
    pub upstream_read_secs: u64,
    pub tunnel_drain_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            client_idle_secs: 30,
            upstream_connect_secs: 30,
            upstream_read_secs: 60,
            tunnel_drain_secs: 10,
        }
    }
}

/// The whole configuration surface consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub listen_port: u16,
    pub system_proxy_enabled: bool,
    pub external_proxy: ExternalProxy,
    pub host_filter: HostFilter,
    pub rewrites: RequestRewrites,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            system_proxy_enabled: false,
            external_proxy: ExternalProxy::default(),
            host_filter: HostFilter::default(),
            rewrites: RequestRewrites::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    /// Reject configurations the listener must not start with.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.listen_port == 0 {
            return Err(ProxyError::Config("listen port must be non-zero".into()));
        }
        if self.external_proxy.enabled {
            if self.external_proxy.host.trim().is_empty() {
                return Err(ProxyError::Config(
                    "external proxy enabled without a host".into(),
                ));
            }
            if self.external_proxy.port == 0 {
                return Err(ProxyError::Config(
                    "external proxy enabled without a port".into(),
                ));
            }
        }
        for (idx, rule) in self.rewrites.rules.iter().enumerate() {
            if rule.path.is_empty() {
                return Err(ProxyError::Config(format!(
                    "rewrite rule {} has an empty path glob",
                    idx
                )));
            }
        }
        Ok(())
    }

    /// Load and validate a TOML configuration file.
    pub async fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        let cfg: Self = toml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Persist as pretty TOML.
    pub async fn save_to_path<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let text = toml::to_string_pretty(self)?;
        tokio::fs::write(path.as_ref(), text).await?;
        Ok(())
    }
}

/// Typed edits the UI applies to the running engine.
#[derive(Debug, Clone)]
pub enum ConfigCommand {
    SetListenPort(u16),
    SetSystemProxy(bool),
    SetExternalProxy(ExternalProxy),
    SetHostFilter(HostFilter),
    SetRewritesEnabled(bool),
    /// Insert at the index (clamped to the list length) or replace in place.
    UpsertRule { index: usize, rule: RequestRewriteRule, replace: bool },
    RemoveRule { index: usize },
}

type FlushFn = dyn Fn(&Config) + Send + Sync;

/// Single-writer configuration store with copy-on-write snapshots.
pub struct ConfigStore {
    tx: watch::Sender<Arc<Config>>,
    flush: Option<Box<FlushFn>>,
}

impl ConfigStore {
    pub fn new(initial: Config) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx, flush: None }
    }

    /// Register the persistence callback invoked after each applied command.
    pub fn on_flush(&mut self, flush: impl Fn(&Config) + Send + Sync + 'static) {
        self.flush = Some(Box::new(flush));
    }

    /// Current snapshot; exchanges take one of these at start and never see
    /// mid-exchange edits.
    pub fn snapshot(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    /// Receiver the listener watches for port changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Validate and apply one command, publishing the new snapshot.
    pub fn apply(&self, command: ConfigCommand) -> Result<(), ProxyError> {
        let mut next = (*self.snapshot()).clone();
        match command {
            ConfigCommand::SetListenPort(port) => next.listen_port = port,
            ConfigCommand::SetSystemProxy(enabled) => next.system_proxy_enabled = enabled,
            ConfigCommand::SetExternalProxy(proxy) => next.external_proxy = proxy,
            ConfigCommand::SetHostFilter(filter) => next.host_filter = filter,
            ConfigCommand::SetRewritesEnabled(enabled) => next.rewrites.enabled = enabled,
            ConfigCommand::UpsertRule { index, rule, replace } => {
                let rules = &mut next.rewrites.rules;
                if replace && index < rules.len() {
                    rules[index] = rule;
                } else {
                    let at = index.min(rules.len());
                    rules.insert(at, rule);
                }
            }
            ConfigCommand::RemoveRule { index } => {
                let rules = &mut next.rewrites.rules;
                if index >= rules.len() {
                    return Err(ProxyError::Config(format!(
                        "no rewrite rule at index {}",
                        index
                    )));
                }
                rules.remove(index);
            }
        }
        next.validate()?;

        if let Some(flush) = &self.flush {
            flush(&next);
        }
        // send_replace stores the snapshot even when no receiver is alive
        self.tx.send_replace(Arc::new(next));
        Ok(())
    }
}
