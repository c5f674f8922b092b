// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # ByteBlaster - EMWIN Quick Block Transfer client
//!
//! A pure Rust client for the EMWIN (Emergency Managers Weather
//! Information Network) ByteBlaster feed. The client keeps a persistent
//! TCP connection to one of a rotating pool of servers, decodes the
//! XOR-obfuscated Quick Block Transfer stream, reassembles interleaved
//! file fragments and delivers completed files to subscribers.
//!
//! ## Quick Start
//!
//! ```no_run
//! use byteblaster::{ByteBlasterClient, ByteBlasterConfig, ClosureHandler, CompletedFile};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = ByteBlasterClient::new(ByteBlasterConfig::new("user@example.com"))?;
//!
//!     client.subscribe(Arc::new(ClosureHandler::new(|file: &CompletedFile| {
//!         println!("received {} ({} bytes)", file.filename, file.data.len());
//!         Ok(())
//!     })));
//!
//!     client.start()?;
//!     std::thread::park();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |        ByteBlasterClient -> FileHandler subscribers                |
//! +--------------------------------------------------------------------+
//! |                         Assembly Layer                             |
//! |   FileAssembler (interleaved blocks -> files, duplicate cache)     |
//! +--------------------------------------------------------------------+
//! |                         Protocol Layer                             |
//! |   XorBuffer -> ProtocolDecoder -> Frame (DataBlock | ServerList)   |
//! +--------------------------------------------------------------------+
//! |                        Transport Layer                             |
//! |   mio poll loop | server rotation | Authenticator | Watchdog       |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ByteBlasterClient`] | Connection supervisor and public entry point |
//! | [`ByteBlasterConfig`] | Client options (email, timeouts, persistence) |
//! | [`FileHandler`] | Subscriber trait receiving [`CompletedFile`]s |
//! | [`ProtocolDecoder`] | QBT stream state machine |
//! | [`FileAssembler`] | Out-of-order block reassembly |
//! | [`ServerListManager`] | Persistent, shuffled server rotation |
//!
//! ## Wire Protocol
//!
//! Every byte on the socket is XORed with `0xFF`. After de-obfuscation the
//! stream is a sequence of frames, each preceded by six `0x00` sync bytes:
//! 80-byte ASCII block headers followed by 1024-byte (V1) or `/DL`-sized,
//! optionally zlib-compressed (V2) bodies, or null-terminated ASCII server
//! lists. See the [`protocol`] module for details.
//!
//! Logging goes through the [`log`] facade; install any `log`-compatible
//! logger to see reconnect attempts and frame summaries.

/// Reassembly of interleaved QBT blocks into complete files.
pub mod assembler;
/// Logon message construction and re-authentication cadence.
pub mod auth;
/// Connection supervisor: reconnect loop, I/O thread, frame routing.
pub mod client;
/// Client configuration.
pub mod config;
/// Completed-file subscription and dispatch.
pub mod dispatch;
/// Wire protocol: XOR codec, checksums, models, stream decoder.
pub mod protocol;
/// Persistent server-list rotation.
pub mod serverlist;
/// Idle/error connection watchdog.
pub mod watchdog;

pub use assembler::{AssemblerStats, FileAssembler};
pub use auth::{Authenticator, REAUTH_INTERVAL};
pub use client::ByteBlasterClient;
pub use config::{ByteBlasterConfig, ConfigError};
pub use dispatch::{ClosureHandler, FileHandler, HandlerError, HandlerRegistry};
pub use protocol::{
    CompletedFile, DecodeError, DecoderState, Frame, ProtocolDecoder, QbtSegment, ServerAddr,
    ServerList,
};
pub use serverlist::ServerListManager;
pub use watchdog::{Watchdog, WatchdogTrip};
