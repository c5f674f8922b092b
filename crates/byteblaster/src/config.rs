// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client configuration.
//!
//! # Example
//!
//! ```
//! use byteblaster::ByteBlasterConfig;
//! use std::time::Duration;
//!
//! let config = ByteBlasterConfig {
//!     watchdog_timeout: Duration::from_secs(30),
//!     ..ByteBlasterConfig::new("user@example.com")
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// ByteBlaster client configuration.
#[derive(Clone, Debug)]
pub struct ByteBlasterConfig {
    // === Identity ===
    /// Email address sent in the logon message (required, non-empty)
    pub email: String,

    // === Server list ===
    /// Server-list persistence location
    pub server_list_path: PathBuf,

    /// Persist server-list updates to disk
    pub enable_persistence: bool,

    /// Shuffle server pools on load and on in-band updates,
    /// distributing client pressure across the fleet
    pub shuffle_servers: bool,

    // === Connection ===
    /// TCP connect timeout
    pub connection_timeout: Duration,

    /// Base delay between connection attempts
    pub reconnect_delay: Duration,

    // === Watchdog ===
    /// Idle-data threshold before the connection is forced closed
    pub watchdog_timeout: Duration,

    /// Protocol-error threshold before the connection is forced closed
    pub max_exceptions: u32,
}

impl Default for ByteBlasterConfig {
    fn default() -> Self {
        Self {
            email: String::new(),

            server_list_path: PathBuf::from("servers.json"),
            enable_persistence: true,
            shuffle_servers: true,

            connection_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),

            watchdog_timeout: Duration::from_secs(20),
            max_exceptions: 10,
        }
    }
}

impl ByteBlasterConfig {
    /// Create a configuration with defaults and the given logon email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration. Called by the client at construction;
    /// configuration faults fail fast rather than at connect time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.email.trim().is_empty() {
            return Err(ConfigError::EmptyEmail);
        }
        Ok(())
    }
}

/// Configuration error, raised at client construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The logon email was empty or whitespace-only.
    EmptyEmail,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyEmail => write!(f, "email address cannot be empty"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Tests
// ============================================================================
