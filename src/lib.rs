// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP/1.x proxy core.
//!
//! This library provides the byte-level HTTP/1.x codec, the per-connection
//! proxy state machine, request/response rewrite rules, the configuration
//! model, and exchange capture for UI subscribers.

pub mod body;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod export;
pub mod headers;
pub mod helpers;
pub mod hostport;
pub mod lines;
pub mod message;
pub mod proxy;
pub mod rewrite;

// Keep library small; main.rs remains the binary entrypoint.
