// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol data models.
//!
//! Typed records for the two ByteBlaster frame kinds:
//!
//! - [`QbtSegment`] - one Quick Block Transfer data block. QBT divides
//!   files into small blocks so that urgent traffic can interrupt large,
//!   low-priority transmissions mid-file.
//! - [`ServerList`] - the in-band server list (regular + satellite pools).
//!
//! Frames are represented as a tagged sum ([`Frame`]), not a hierarchy.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Filler filename transmitted when no real payload is available.
/// Always suppressed before reaching subscribers.
pub const FILLFILE_NAME: &str = "FILLFILE.TXT";

/// Built-in fallback servers used when no persisted list exists.
const DEFAULT_SERVERS: &[(&str, u16)] = &[
    ("emwin.weathermessage.com", 2211),
    ("master.weathermessage.com", 2211),
    ("emwin.interweather.net", 1000),
    ("wxmesg.upstateweather.com", 2211),
];

// ============================================================================
// Server addresses
// ============================================================================

/// A `host:port` pair from a server list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    /// Server hostname (resolved at connect time)
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl ServerAddr {
    /// Create an address from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string.
    pub fn parse(s: &str) -> Result<Self, ServerParseError> {
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| ServerParseError::MissingPort(s.to_string()))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| ServerParseError::InvalidPort(s.to_string()))?;

        if host.is_empty() || port == 0 {
            return Err(ServerParseError::InvalidPort(s.to_string()));
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a `host:port` server string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerParseError {
    /// No `:` separator present.
    MissingPort(String),
    /// Port missing, non-numeric, zero, or out of range.
    InvalidPort(String),
}

impl fmt::Display for ServerParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPort(s) => write!(f, "invalid server format (expected host:port): {s}"),
            Self::InvalidPort(s) => write!(f, "invalid port in server string: {s}"),
        }
    }
}

impl std::error::Error for ServerParseError {}

// ============================================================================
// Server list
// ============================================================================

/// Ordered pools of ByteBlaster servers (regular and satellite).
#[derive(Clone, Debug, PartialEq)]
pub struct ServerList {
    /// Regular servers, in rotation order
    pub servers: Vec<ServerAddr>,

    /// Satellite servers, rotated into the same pool after the regular ones
    pub sat_servers: Vec<ServerAddr>,

    /// When this list was received (or constructed)
    pub received_at: DateTime<Utc>,
}

impl Default for ServerList {
    fn default() -> Self {
        Self {
            servers: DEFAULT_SERVERS
                .iter()
                .map(|&(host, port)| ServerAddr::new(host, port))
                .collect(),
            sat_servers: Vec::new(),
            received_at: Utc::now(),
        }
    }
}

// Accepts both wire forms:
//   /ServerList/host:port|host:port
//   /ServerList/...\ServerList\/SatServers/host:port+host:port\SatServers\
fn server_list_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^/ServerList/(?P<servers>[^\\]*)(?:\\ServerList\\(?:/SatServers/(?P<sat>[^\\]*)\\SatServers\\)?)?\s*$",
        )
        .expect("server list regex")
    })
}

impl ServerList {
    /// Create a list from explicit pools.
    pub fn new(servers: Vec<ServerAddr>, sat_servers: Vec<ServerAddr>) -> Self {
        Self {
            servers,
            sat_servers,
            received_at: Utc::now(),
        }
    }

    /// Parse a server-list frame body.
    ///
    /// Regular entries are `|`-separated, satellite entries `+`-separated.
    /// Individually malformed entries are skipped with a log line; an empty
    /// regular pool falls back to the built-in defaults.
    pub fn from_frame_content(content: &str) -> Result<Self, ServerListParseError> {
        let caps = server_list_re()
            .captures(content)
            .ok_or_else(|| ServerListParseError::new(content))?;

        let servers_str = caps.name("servers").map(|m| m.as_str()).unwrap_or("");
        let sat_str = caps.name("sat").map(|m| m.as_str()).unwrap_or("");

        let mut servers = parse_entries(servers_str, '|');
        let sat_servers = parse_entries(sat_str, '+');

        if servers.is_empty() {
            log::debug!("[PROTO] Server list frame carried no usable servers, keeping defaults");
            servers = Self::default().servers;
        }

        Ok(Self::new(servers, sat_servers))
    }

    /// Combined pool: regular servers followed by satellite servers.
    pub fn all_servers(&self) -> Vec<ServerAddr> {
        let mut all = self.servers.clone();
        all.extend(self.sat_servers.iter().cloned());
        all
    }

    /// Total number of servers across both pools.
    pub fn len(&self) -> usize {
        self.servers.len() + self.sat_servers.len()
    }

    /// True when neither pool has entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_entries(raw: &str, separator: char) -> Vec<ServerAddr> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| match ServerAddr::parse(entry) {
            Ok(addr) => Some(addr),
            Err(e) => {
                log::debug!("[PROTO] Skipping unparseable server entry: {e}");
                None
            }
        })
        .collect()
}

/// Error parsing a server-list frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerListParseError {
    snippet: String,
}

impl ServerListParseError {
    fn new(content: &str) -> Self {
        let snippet: String = content.chars().take(100).collect();
        Self { snippet }
    }
}

impl fmt::Display for ServerListParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to parse server list: {}", self.snippet)
    }
}

impl std::error::Error for ServerListParseError {}

// ============================================================================
// QBT segment
// ============================================================================

/// A single Quick Block Transfer data block.
///
/// `timestamp` comes from the header `FD` field; header dates carry no zone
/// and are stamped UTC unconditionally, so it should not be treated as
/// authoritative wall-clock time.
#[derive(Clone, Debug)]
pub struct QbtSegment {
    /// Filename as transmitted (case preserved for display)
    pub filename: String,

    /// 1-based block index
    pub block_number: u32,

    /// Total blocks in the transmission
    pub total_blocks: u32,

    /// Block body (decompressed and trimmed where applicable)
    pub content: Vec<u8>,

    /// Header checksum as parsed; the low 16 bits are the validated value
    pub checksum: u32,

    /// Body length on the wire, before decompression
    pub length: usize,

    /// Protocol version (1 or 2)
    pub version: u8,

    /// Transmit timestamp from the header `FD` field (assumed UTC)
    pub timestamp: DateTime<Utc>,

    /// When the decoder consumed the header
    pub received_at: DateTime<Utc>,

    /// Raw header string, for diagnostics
    pub header: String,

    /// Remote peer address the block arrived from
    pub source: String,
}

impl QbtSegment {
    /// Completion key grouping blocks of one transmission.
    ///
    /// The same filename at a different transmit timestamp is a distinct
    /// file; filename case is ignored.
    pub fn key(&self) -> String {
        format!(
            "{}_{}",
            self.filename.to_ascii_lowercase(),
            self.timestamp.to_rfc3339()
        )
    }
}

impl fmt::Display for QbtSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} block {}/{} v{} len={} ts={}",
            self.filename,
            self.block_number,
            self.total_blocks,
            self.version,
            self.length,
            self.timestamp.to_rfc3339()
        )
    }
}

// ============================================================================
// Frames and completed files
// ============================================================================

/// A decoded protocol frame.
#[derive(Clone, Debug)]
pub enum Frame {
    /// A validated (or invalid-but-emitted) data block.
    DataBlock {
        /// The decoded segment; its `content` is the body bytes
        segment: QbtSegment,
    },

    /// An in-band server list update.
    ServerList {
        /// The parsed list
        list: ServerList,
        /// Raw ASCII frame content, for diagnostics
        content: String,
    },
}

/// A fully reassembled file, ready for subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedFile {
    /// Filename from the first block (case preserved)
    pub filename: String,

    /// Concatenated block contents, in block order
    pub data: Vec<u8>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn segment_at(filename: &str, ts: DateTime<Utc>) -> QbtSegment {
        QbtSegment {
            filename: filename.to_string(),
            block_number: 1,
            total_blocks: 1,
            content: Vec::new(),
            checksum: 0,
            length: 0,
            version: 1,
            timestamp: ts,
            received_at: ts,
            header: String::new(),
            source: String::new(),
        }
    }

    #[test]
    fn test_parse_server_valid() {
        let addr = ServerAddr::parse("emwin.weathermessage.com:2211").unwrap();
        assert_eq!(addr.host, "emwin.weathermessage.com");
        assert_eq!(addr.port, 2211);
        assert_eq!(addr.to_string(), "emwin.weathermessage.com:2211");
    }

    #[test]
    fn test_parse_server_missing_port() {
        assert!(matches!(
            ServerAddr::parse("nocolon"),
            Err(ServerParseError::MissingPort(_))
        ));
    }

    #[test]
    fn test_parse_server_bad_port() {
        assert!(ServerAddr::parse("host:notaport").is_err());
        assert!(ServerAddr::parse("host:0").is_err());
        assert!(ServerAddr::parse("host:70000").is_err());
        assert!(ServerAddr::parse(":1234").is_err());
    }

    #[test]
    fn test_default_server_list() {
        let list = ServerList::default();
        assert_eq!(list.servers.len(), 4);
        assert!(list.sat_servers.is_empty());
        assert_eq!(list.servers[0], ServerAddr::new("emwin.weathermessage.com", 2211));
        assert!(!list.is_empty());
    }

    #[test]
    fn test_frame_content_simple_form() {
        let list = ServerList::from_frame_content("/ServerList/a.example:1000|b.example:2000")
            .unwrap();
        assert_eq!(
            list.servers,
            vec![
                ServerAddr::new("a.example", 1000),
                ServerAddr::new("b.example", 2000)
            ]
        );
        assert!(list.sat_servers.is_empty());
    }

    #[test]
    fn test_frame_content_simple_form_with_trailer() {
        let list =
            ServerList::from_frame_content(r"/ServerList/a.example:1000\ServerList\").unwrap();
        assert_eq!(list.servers, vec![ServerAddr::new("a.example", 1000)]);
    }

    #[test]
    fn test_frame_content_full_form() {
        let content =
            r"/ServerList/a.example:1000|b.example:2000\ServerList\/SatServers/s.example:3000+t.example:4000\SatServers\";
        let list = ServerList::from_frame_content(content).unwrap();
        assert_eq!(list.servers.len(), 2);
        assert_eq!(
            list.sat_servers,
            vec![
                ServerAddr::new("s.example", 3000),
                ServerAddr::new("t.example", 4000)
            ]
        );
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_frame_content_skips_bad_entries() {
        let list =
            ServerList::from_frame_content("/ServerList/good.example:1000|junk|:77|x.example:8")
                .unwrap();
        assert_eq!(
            list.servers,
            vec![
                ServerAddr::new("good.example", 1000),
                ServerAddr::new("x.example", 8)
            ]
        );
    }

    #[test]
    fn test_frame_content_empty_falls_back_to_defaults() {
        let list = ServerList::from_frame_content("/ServerList/").unwrap();
        assert_eq!(list.servers, ServerList::default().servers);
    }

    #[test]
    fn test_frame_content_rejects_other_prefixes() {
        assert!(ServerList::from_frame_content("/PFFILE.TXT").is_err());
        assert!(ServerList::from_frame_content("").is_err());
    }

    #[test]
    fn test_all_servers_order() {
        let list = ServerList::new(
            vec![ServerAddr::new("a", 1)],
            vec![ServerAddr::new("s", 2)],
        );
        assert_eq!(
            list.all_servers(),
            vec![ServerAddr::new("a", 1), ServerAddr::new("s", 2)]
        );
    }

    #[test]
    fn test_segment_key_lowercases_filename() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 9, 13, 0, 0).unwrap();
        let seg = segment_at("Weather.TXT", ts);
        assert_eq!(seg.key(), format!("weather.txt_{}", ts.to_rfc3339()));
    }

    #[test]
    fn test_segment_key_distinct_per_timestamp() {
        let t1 = Utc.with_ymd_and_hms(2025, 7, 9, 13, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 7, 9, 13, 0, 1).unwrap();
        assert_ne!(segment_at("weather.txt", t1).key(), segment_at("weather.txt", t2).key());
    }

    #[test]
    fn test_segment_display() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 9, 13, 0, 0).unwrap();
        let mut seg = segment_at("FILE.TXT", ts);
        seg.block_number = 2;
        seg.total_blocks = 4;
        seg.version = 2;
        seg.length = 512;
        let text = seg.to_string();
        assert!(text.contains("FILE.TXT"));
        assert!(text.contains("block 2/4"));
        assert!(text.contains("v2"));
    }
}
