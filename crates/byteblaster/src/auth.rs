// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logon authentication.
//!
//! ByteBlaster servers expect an XOR-encoded ASCII logon string of the form
//! `ByteBlast Client|NM-<email>|V2`, sent immediately after connecting and
//! re-sent every [`REAUTH_INTERVAL`] for as long as the connection lives.
//!
//! The authenticator is a deadline component: the I/O loop asks
//! [`Authenticator::logon_due`] on every tick and writes
//! [`Authenticator::logon_message`] when it answers yes. Send failures are
//! the loop's to handle (they count toward the watchdog and force a
//! disconnect).

use std::time::{Duration, Instant};

use crate::config::ConfigError;
use crate::protocol::xor::xor_encode;

/// Cadence at which the logon message is re-sent while connected.
pub const REAUTH_INTERVAL: Duration = Duration::from_secs(115);

/// Builds the logon message and tracks the re-auth cadence.
#[derive(Debug)]
pub struct Authenticator {
    email: String,
    message: Vec<u8>,
    active: bool,
    last_sent: Option<Instant>,
}

impl Authenticator {
    /// Create an authenticator for the given email.
    ///
    /// The email is whitespace-trimmed; an empty result is a configuration
    /// fault and is rejected.
    pub fn new(email: &str) -> Result<Self, ConfigError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(ConfigError::EmptyEmail);
        }

        let message = xor_encode(format!("ByteBlast Client|NM-{email}|V2").as_bytes());

        Ok(Self {
            email: email.to_string(),
            message,
            active: false,
            last_sent: None,
        })
    }

    /// The (trimmed) email identity.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// The XOR-encoded logon message as written to the wire.
    pub fn logon_message(&self) -> &[u8] {
        &self.message
    }

    /// Whether the re-auth cadence is armed.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Arm the cadence. The first logon is due immediately.
    pub fn activate(&mut self) {
        self.active = true;
        self.last_sent = None;
        log::debug!("[AUTH] Authentication armed for {}", self.email);
    }

    /// Disarm the cadence (on disconnect).
    pub fn deactivate(&mut self) {
        self.active = false;
        self.last_sent = None;
        log::debug!("[AUTH] Authentication disarmed");
    }

    /// Whether a logon send is due at `now`.
    pub fn logon_due(&self, now: Instant) -> bool {
        if !self.active {
            return false;
        }
        match self.last_sent {
            None => true,
            Some(sent) => now.duration_since(sent) >= REAUTH_INTERVAL,
        }
    }

    /// Record a completed logon send.
    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::xor::xor_decode;

    #[test]
    fn test_logon_message_format() {
        let auth = Authenticator::new("user@example.com").unwrap();
        assert_eq!(
            xor_decode(auth.logon_message()),
            b"ByteBlast Client|NM-user@example.com|V2"
        );
    }

    #[test]
    fn test_email_is_trimmed() {
        let auth = Authenticator::new("  user@example.com  ").unwrap();
        assert_eq!(auth.email(), "user@example.com");
        assert_eq!(
            xor_decode(auth.logon_message()),
            b"ByteBlast Client|NM-user@example.com|V2"
        );
    }

    #[test]
    fn test_empty_email_rejected() {
        assert_eq!(Authenticator::new("").unwrap_err(), ConfigError::EmptyEmail);
        assert_eq!(
            Authenticator::new(" \t\n ").unwrap_err(),
            ConfigError::EmptyEmail
        );
    }

    #[test]
    fn test_inactive_until_armed() {
        let auth = Authenticator::new("user@example.com").unwrap();
        assert!(!auth.is_active());
        assert!(!auth.logon_due(Instant::now()));
    }

    #[test]
    fn test_first_logon_due_immediately() {
        let mut auth = Authenticator::new("user@example.com").unwrap();
        auth.activate();
        assert!(auth.logon_due(Instant::now()));
    }

    #[test]
    fn test_reauth_cadence() {
        let mut auth = Authenticator::new("user@example.com").unwrap();
        let now = Instant::now();

        auth.activate();
        auth.mark_sent(now);

        assert!(!auth.logon_due(now));
        assert!(!auth.logon_due(now + Duration::from_secs(114)));
        assert!(auth.logon_due(now + REAUTH_INTERVAL));
        assert!(auth.logon_due(now + Duration::from_secs(500)));
    }

    #[test]
    fn test_deactivate_disarms() {
        let mut auth = Authenticator::new("user@example.com").unwrap();
        auth.activate();
        auth.deactivate();
        assert!(!auth.logon_due(Instant::now() + Duration::from_secs(1000)));
    }
}
