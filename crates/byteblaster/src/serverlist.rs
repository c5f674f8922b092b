// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent server-list management.
//!
//! Keeps the pool of ByteBlaster servers (regular + satellite), persisted
//! as a small JSON document so a restarted client remembers in-band list
//! updates:
//!
//! ```json
//! {
//!   "servers": ["emwin.weathermessage.com:2211", "..."],
//!   "sat_servers": [],
//!   "received_at": "2026-01-07T12:00:00Z",
//!   "version": "1.0"
//! }
//! ```
//!
//! A missing or malformed document falls back to the built-in defaults
//! without error. Pools are optionally shuffled on load and on update so a
//! fleet of clients does not pile onto the first listed server.
//!
//! A single cursor walks the concatenation regular ++ satellite and wraps;
//! in-band updates replace the pools but deliberately leave the cursor
//! alone.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::models::{ServerAddr, ServerList};

/// Version tag written into the persistence document.
const PERSIST_VERSION: &str = "1.0";

/// On-disk form of the server list.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedServerList {
    servers: Vec<String>,
    sat_servers: Vec<String>,
    received_at: DateTime<Utc>,
    version: String,
}

/// Persistent, shuffled, index-cycling server pool.
#[derive(Debug)]
pub struct ServerListManager {
    list: ServerList,
    index: usize,
    persist_path: PathBuf,
    enable_persistence: bool,
    shuffle: bool,
}

impl ServerListManager {
    /// Create a manager with persistence and shuffling enabled.
    pub fn new(persist_path: impl Into<PathBuf>) -> Self {
        Self::with_options(persist_path, true, true)
    }

    /// Create a manager with explicit persistence/shuffle behavior.
    pub fn with_options(
        persist_path: impl Into<PathBuf>,
        enable_persistence: bool,
        shuffle: bool,
    ) -> Self {
        let persist_path = persist_path.into();

        let mut list = if enable_persistence {
            load_list(&persist_path).unwrap_or_default()
        } else {
            ServerList::default()
        };

        if shuffle {
            shuffle_pools(&mut list);
        }

        log::debug!(
            "[SERVERS] Loaded {} servers ({} satellite) from {}",
            list.len(),
            list.sat_servers.len(),
            persist_path.display()
        );

        Self {
            list,
            index: 0,
            persist_path,
            enable_persistence,
            shuffle,
        }
    }

    /// Next server in rotation, wrapping modulo the total pool size.
    pub fn get_next_server(&mut self) -> Option<ServerAddr> {
        let total = self.list.len();
        if total == 0 {
            return None;
        }
        let all = self.list.all_servers();
        let server = all[self.index % total].clone();
        self.index = (self.index + 1) % total;
        Some(server)
    }

    /// Rewind the rotation to the first server.
    pub fn reset_index(&mut self) {
        self.index = 0;
    }

    /// Replace the pool from an in-band update.
    ///
    /// Shuffles and persists per configuration. The cursor is not reset.
    pub fn update(&mut self, mut list: ServerList) {
        if self.shuffle {
            shuffle_pools(&mut list);
        }
        self.list = list;
        self.save();
    }

    /// Write the current list to the persistence path, if enabled.
    /// Persistence faults are logged and otherwise ignored; the in-memory
    /// pool stays authoritative.
    pub fn save(&self) {
        if !self.enable_persistence {
            return;
        }

        let doc = PersistedServerList {
            servers: self.list.servers.iter().map(ToString::to_string).collect(),
            sat_servers: self
                .list
                .sat_servers
                .iter()
                .map(ToString::to_string)
                .collect(),
            received_at: self.list.received_at,
            version: PERSIST_VERSION.to_string(),
        };

        match serde_json::to_string_pretty(&doc) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.persist_path, json) {
                    log::warn!(
                        "[SERVERS] Failed to persist server list to {}: {e}",
                        self.persist_path.display()
                    );
                }
            }
            Err(e) => log::warn!("[SERVERS] Failed to serialize server list: {e}"),
        }
    }

    /// Total number of servers in the pool.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True when the pool has no servers.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// The current server list.
    pub fn current_list(&self) -> &ServerList {
        &self.list
    }

    /// The persistence location.
    pub fn persist_path(&self) -> &Path {
        &self.persist_path
    }
}

fn shuffle_pools(list: &mut ServerList) {
    fastrand::shuffle(&mut list.servers);
    fastrand::shuffle(&mut list.sat_servers);
}

fn load_list(path: &Path) -> Option<ServerList> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return None, // Missing file is the common first-run case
    };

    let doc: PersistedServerList = match serde_json::from_str(&text) {
        Ok(doc) => doc,
        Err(e) => {
            log::warn!(
                "[SERVERS] Malformed server list at {}, using defaults: {e}",
                path.display()
            );
            return None;
        }
    };

    let servers = parse_persisted(&doc.servers);
    let sat_servers = parse_persisted(&doc.sat_servers);

    if servers.is_empty() {
        // An empty regular pool is useless; treat it like a missing file.
        return None;
    }

    Some(ServerList {
        servers,
        sat_servers,
        received_at: doc.received_at,
    })
}

fn parse_persisted(entries: &[String]) -> Vec<ServerAddr> {
    entries
        .iter()
        .filter_map(|entry| match ServerAddr::parse(entry) {
            Ok(addr) => Some(addr),
            Err(e) => {
                log::warn!("[SERVERS] Skipping persisted server entry: {e}");
                None
            }
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
