// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ByteBlaster protocol decoder.
//!
//! A stream state machine that turns the XOR-obfuscated byte stream into
//! typed [`Frame`]s:
//!
//! ```text
//!            +--------+   sync marker    +-------------+
//!  bytes --> | RESYNC | ---------------> | START_FRAME | <------------+
//!            +--------+                  +-------------+              |
//!                ^                             | non-null byte        |
//!                | unknown type /              v                      |
//!                | structural error      +------------+               |
//!                +---------------------- | FRAME_TYPE |               |
//!                                        +------------+               |
//!                              "/Se" /         | "/PF"                |
//!                        +-------------+       v                      |
//!                        | SERVER_LIST |  +--------------+            |
//!                        +-------------+  | BLOCK_HEADER |            |
//!                               |         +--------------+            |
//!                               |               v                     |
//!                               |         +------------+  +----------+
//!                               |         | BLOCK_BODY |->| VALIDATE |
//!                               +-------->+------------+  +----------+
//! ```
//!
//! The decoder is driven by [`ProtocolDecoder::feed`], which appends to the
//! internal XOR buffer and then advances the machine until it stalls for
//! lack of data. Decoded frames queue internally and are drained with
//! [`ProtocolDecoder::next_frame`].
//!
//! TCP delivers arbitrary chunk boundaries; every state simply reports "not
//! enough data" and retries on the next feed, so byte-at-a-time input
//! produces the same frames as a single large chunk.

use std::collections::VecDeque;
use std::fmt;
use std::sync::OnceLock;

use chrono::{NaiveDateTime, Utc};

use super::checksum::{calculate_checksum, inflate, looks_compressed};
use super::models::{Frame, QbtSegment, ServerList, FILLFILE_NAME};
use super::xor::XorBuffer;

// ============================================================================
// Constants
// ============================================================================

/// Length of the post-XOR sync marker (consecutive `0x00` bytes).
pub const FRAME_SYNC_LEN: usize = 6;

/// Fixed size of the ASCII block header.
pub const HEADER_LEN: usize = 80;

/// Fixed body size for V1 blocks.
pub const V1_BODY_LEN: usize = 1024;

/// Maximum body size for V2 blocks.
pub const MAX_V2_BODY_LEN: usize = 1024;

/// Minimum buffered bytes before frame-type dispatch is attempted.
const FRAME_TYPE_MIN: usize = 10;

/// Header `FD` field format (no zone; stamped UTC unconditionally).
const HEADER_DATE_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Server-list terminator used when no plain null terminator is present.
const SAT_SERVERS_SENTINEL: &[u8] = b"\\SatServers\\\x00";

fn header_re() -> &'static regex::bytes::Regex {
    static RE: OnceLock<regex::bytes::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::bytes::Regex::new(
            r"(?-u)^/PF(?P<pf>[A-Za-z0-9\-._]+)\s*/PN\s*(?P<pn>[0-9]+)\s*/PT\s*(?P<pt>[0-9]+)\s*/CS\s*(?P<cs>[0-9]+)\s*/FD(?P<fd>[0-9/: ]+[AP]M)\s*(?:/DL(?P<dl>[0-9]+)\s*)?\r\n$",
        )
        .expect("block header regex")
    })
}

// ============================================================================
// Errors
// ============================================================================

/// Structural protocol error.
///
/// These reset the decoder to `Resync` before they are surfaced; the
/// supervisor counts them toward the watchdog error threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// An 80-byte header did not match the block header format.
    InvalidHeader(String),

    /// A V2 `DL` field was outside `1..=1024`.
    InvalidLength(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeader(header) => write!(f, "invalid block header: {header}"),
            Self::InvalidLength(len) => {
                write!(f, "invalid V2 body length: {len} (must be 1-{MAX_V2_BODY_LEN})")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Decoder
// ============================================================================

/// Decoder states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderState {
    /// Scanning for the sync marker
    Resync,
    /// Skipping null padding before a frame
    StartFrame,
    /// Classifying the next frame
    FrameType,
    /// Reading a server-list frame
    ServerList,
    /// Reading an 80-byte block header
    BlockHeader,
    /// Reading a block body
    BlockBody,
    /// Validating and emitting the block
    Validate,
}

/// Decoder counters, reported in periodic log summaries.
#[derive(Debug, Default, Clone)]
pub struct DecoderStats {
    /// Data blocks emitted
    pub data_blocks: u64,
    /// Server lists emitted
    pub server_lists: u64,
    /// Blocks emitted with a failed checksum
    pub checksum_failures: u64,
    /// Blocks dropped for impossible block numbers
    pub invalid_blocks: u64,
    /// Sync markers acquired
    pub resyncs: u64,
}

/// ByteBlaster protocol state machine.
pub struct ProtocolDecoder {
    state: DecoderState,
    buffer: XorBuffer,
    current: Option<QbtSegment>,
    frames: VecDeque<Frame>,
    remote_addr: String,
    stats: DecoderStats,
}

impl Default for ProtocolDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolDecoder {
    /// Create a decoder in the `Resync` state.
    pub fn new() -> Self {
        Self {
            state: DecoderState::Resync,
            buffer: XorBuffer::new(),
            current: None,
            frames: VecDeque::new(),
            remote_addr: String::new(),
            stats: DecoderStats::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Decoder counters.
    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    /// Record the remote peer address stamped onto emitted segments.
    pub fn set_remote_address(&mut self, address: impl Into<String>) {
        self.remote_addr = address.into();
    }

    /// Feed raw wire bytes and advance the state machine.
    ///
    /// On a structural error the decoder has already reset itself to
    /// `Resync`; the error is returned for watchdog accounting.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        self.buffer.append(data);
        match self.drive() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    /// Pop the next decoded frame, if any.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Reset to `Resync`, dropping buffered bytes and any in-progress block.
    pub fn reset(&mut self) {
        self.state = DecoderState::Resync;
        self.buffer.clear();
        self.current = None;
        log::debug!("[PROTO] Decoder state reset");
    }

    fn drive(&mut self) -> Result<(), DecodeError> {
        loop {
            let progressed = match self.state {
                DecoderState::Resync => self.on_resync(),
                DecoderState::StartFrame => self.on_start_frame(),
                DecoderState::FrameType => self.on_frame_type(),
                DecoderState::ServerList => self.on_server_list(),
                DecoderState::BlockHeader => self.on_block_header()?,
                DecoderState::BlockBody => self.on_block_body(),
                DecoderState::Validate => self.on_validate(),
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // States
    // ------------------------------------------------------------------

    /// Scan for `FRAME_SYNC_LEN` consecutive null bytes. Never errors:
    /// arbitrary garbage must be survivable.
    fn on_resync(&mut self) -> bool {
        let avail = self.buffer.available();
        if avail < FRAME_SYNC_LEN {
            return false;
        }

        let found = self
            .buffer
            .peek(avail, 0)
            .and_then(|buf| {
                buf.windows(FRAME_SYNC_LEN)
                    .position(|w| w.iter().all(|&b| b == 0))
            });

        if let Some(pos) = found {
            self.buffer.skip(pos + FRAME_SYNC_LEN);
            self.stats.resyncs += 1;
            log::debug!("[PROTO] Frame sync found at offset {pos}");
            self.state = DecoderState::StartFrame;
            return true;
        }

        // Keep the trailing bytes: the marker may straddle chunk boundaries.
        if avail > FRAME_SYNC_LEN {
            self.buffer.skip(avail - FRAME_SYNC_LEN + 1);
        }
        false
    }

    /// Skip null padding until the first byte of a frame appears.
    fn on_start_frame(&mut self) -> bool {
        while let Some(b) = self.buffer.peek(1, 0) {
            if b[0] != 0x00 {
                self.state = DecoderState::FrameType;
                return true;
            }
            self.buffer.skip(1);
        }
        false
    }

    /// Classify the frame by its leading bytes.
    fn on_frame_type(&mut self) -> bool {
        if self.buffer.available() < FRAME_TYPE_MIN {
            return false;
        }

        let head = match self.buffer.peek(3, 0) {
            Some(h) => h,
            None => return false,
        };

        if head == b"/PF" {
            self.state = DecoderState::BlockHeader;
            return true;
        }
        if head == b"/Se" {
            self.state = DecoderState::ServerList;
            return true;
        }

        let preview_len = self.buffer.available().min(20);
        let preview = self
            .buffer
            .peek(preview_len, 0)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        log::warn!("[PROTO] Unknown frame type, header starts: {preview:?}");
        self.buffer.skip(1);
        self.state = DecoderState::Resync;
        true
    }

    /// Read a null-terminated server list and emit it.
    fn on_server_list(&mut self) -> bool {
        let raw = match self.read_server_list_bytes() {
            Some(raw) => raw,
            None => return false,
        };

        let content = String::from_utf8_lossy(&raw).into_owned();
        match ServerList::from_frame_content(&content) {
            Ok(list) => {
                log::info!("[PROTO] Processed server list with {} servers", list.len());
                self.stats.server_lists += 1;
                self.frames.push_back(Frame::ServerList { list, content });
            }
            Err(e) => {
                log::error!("[PROTO] Failed to parse server list: {e}");
            }
        }

        self.state = DecoderState::StartFrame;
        true
    }

    fn read_server_list_bytes(&mut self) -> Option<Vec<u8>> {
        let avail = self.buffer.available();
        let buf = self.buffer.peek(avail, 0)?;

        if let Some(nul) = buf.iter().position(|&b| b == 0x00) {
            let raw = self.buffer.read(nul)?;
            self.buffer.skip(1);
            return Some(raw);
        }

        // No terminator; accept a frame ending in the satellite sentinel.
        if let Some(pos) = buf
            .windows(SAT_SERVERS_SENTINEL.len())
            .position(|w| w == SAT_SERVERS_SENTINEL)
        {
            let end = pos + SAT_SERVERS_SENTINEL.len();
            let raw = self.buffer.read(end - 1)?;
            self.buffer.skip(1);
            return Some(raw);
        }

        None
    }

    /// Read and parse the fixed-size block header.
    fn on_block_header(&mut self) -> Result<bool, DecodeError> {
        if self.buffer.available() < HEADER_LEN {
            return Ok(false);
        }

        let raw = match self.buffer.read(HEADER_LEN) {
            Some(raw) => raw,
            None => return Ok(false),
        };
        let header_str = String::from_utf8_lossy(&raw).into_owned();
        log::debug!("[PROTO] Processing header: {}", header_str.trim_end());

        let caps = header_re()
            .captures(&raw)
            .ok_or_else(|| DecodeError::InvalidHeader(header_str.trim_end().to_string()))?;

        let invalid = || DecodeError::InvalidHeader(header_str.trim_end().to_string());

        let filename = String::from_utf8_lossy(group(&caps, "pf")).into_owned();
        let block_number: u32 = parse_group(&caps, "pn").ok_or_else(invalid)?;
        let total_blocks: u32 = parse_group(&caps, "pt").ok_or_else(invalid)?;
        let checksum: u32 = parse_group(&caps, "cs").ok_or_else(invalid)?;

        let received_at = Utc::now();
        let fd_str = String::from_utf8_lossy(group(&caps, "fd")).into_owned();
        let timestamp = match NaiveDateTime::parse_from_str(&fd_str, HEADER_DATE_FORMAT) {
            Ok(naive) => naive.and_utc(),
            Err(e) => {
                log::warn!("[PROTO] Failed to parse header date {fd_str:?}: {e}");
                received_at
            }
        };

        let (version, length) = match caps.name("dl") {
            Some(dl) => {
                let length: usize = String::from_utf8_lossy(dl.as_bytes())
                    .parse()
                    .map_err(|_| invalid())?;
                if length == 0 || length > MAX_V2_BODY_LEN {
                    return Err(DecodeError::InvalidLength(length));
                }
                (2u8, length)
            }
            None => (1u8, V1_BODY_LEN),
        };

        self.current = Some(QbtSegment {
            filename,
            block_number,
            total_blocks,
            content: Vec::new(),
            checksum,
            length,
            version,
            timestamp,
            received_at,
            header: header_str,
            source: self.remote_addr.clone(),
        });
        self.state = DecoderState::BlockBody;
        Ok(true)
    }

    /// Read the block body. Decompression is deferred to validation.
    fn on_block_body(&mut self) -> bool {
        let length = self
            .current
            .as_ref()
            .expect("segment in progress in BLOCK_BODY")
            .length;

        if self.buffer.available() < length {
            return false;
        }

        let body = match self.buffer.read(length) {
            Some(body) => body,
            None => return false,
        };
        if let Some(seg) = self.current.as_mut() {
            seg.content = body;
        }
        self.state = DecoderState::Validate;
        true
    }

    /// Validate and emit the completed block.
    fn on_validate(&mut self) -> bool {
        let mut seg = self
            .current
            .take()
            .expect("segment in progress in VALIDATE");
        self.state = DecoderState::StartFrame;

        if seg.block_number == 0 || seg.total_blocks == 0 || seg.block_number > seg.total_blocks {
            log::error!(
                "[PROTO] Invalid block numbers for {}: {}/{}",
                seg.filename,
                seg.block_number,
                seg.total_blocks
            );
            self.stats.invalid_blocks += 1;
            return true;
        }

        // Filler blocks carry no payload worth delivering.
        if seg.filename == FILLFILE_NAME {
            log::debug!("[PROTO] Skipping {FILLFILE_NAME} (filler data)");
            return true;
        }

        let checksum_ok = self.validate_checksum(&mut seg);
        if !checksum_ok {
            self.stats.checksum_failures += 1;
        }

        // Text files are null/whitespace padded to the block size; strip it.
        let upper = seg.filename.to_ascii_uppercase();
        if upper.ends_with(".TXT") || upper.ends_with(".WMO") {
            let keep = seg
                .content
                .iter()
                .rposition(|b| !matches!(b, 0x00 | b' ' | b'\t' | b'\r' | b'\n'))
                .map_or(0, |p| p + 1);
            seg.content.truncate(keep);
        }

        log::debug!(
            "[PROTO] Processed segment: {seg} (checksum {})",
            if checksum_ok { "valid" } else { "invalid" }
        );
        self.stats.data_blocks += 1;
        // Emitted even on checksum failure; downstream decides what to keep.
        self.frames.push_back(Frame::DataBlock { segment: seg });
        true
    }

    // ------------------------------------------------------------------
    // Checksum policy
    // ------------------------------------------------------------------

    fn validate_checksum(&mut self, seg: &mut QbtSegment) -> bool {
        if seg.version == 1 {
            // V1 headers may carry a 32-bit value; only the low 16 bits count.
            let expected = seg.checksum & 0xFFFF;
            let actual = u32::from(calculate_checksum(&seg.content));
            if actual != expected {
                log::warn!(
                    "[PROTO] V1 checksum failed for {}: expected {expected} (header {}), got {actual} ({} bytes)",
                    seg.filename,
                    seg.checksum,
                    seg.content.len()
                );
                return false;
            }
            return true;
        }

        if looks_compressed(&seg.content) {
            match inflate(&seg.content) {
                Ok(uncompressed) => {
                    let actual = u32::from(calculate_checksum(&uncompressed));
                    if actual == seg.checksum {
                        seg.content = uncompressed;
                        return true;
                    }
                    log::warn!(
                        "[PROTO] V2 compressed checksum failed for {}: expected {}, got {actual} ({} bytes uncompressed)",
                        seg.filename,
                        seg.checksum,
                        uncompressed.len()
                    );
                    false
                }
                Err(e) => {
                    log::warn!("[PROTO] V2 decompression failed for {}: {e}", seg.filename);
                    u32::from(calculate_checksum(&seg.content)) == seg.checksum
                }
            }
        } else {
            let actual = u32::from(calculate_checksum(&seg.content));
            if actual != seg.checksum {
                log::warn!(
                    "[PROTO] V2 checksum failed for {}: expected {}, got {actual} ({} bytes)",
                    seg.filename,
                    seg.checksum,
                    seg.content.len()
                );
                return false;
            }
            true
        }
    }
}

fn group<'a>(caps: &'a regex::bytes::Captures<'_>, name: &str) -> &'a [u8] {
    caps.name(name).map(|m| m.as_bytes()).unwrap_or(b"")
}

fn parse_group<T: std::str::FromStr>(caps: &regex::bytes::Captures<'_>, name: &str) -> Option<T> {
    std::str::from_utf8(group(caps, name)).ok()?.parse().ok()
}

// ============================================================================
// Tests
// ============================================================================
