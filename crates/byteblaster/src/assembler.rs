// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File reassembly from interleaved QBT blocks.
//!
//! QBT interleaves the blocks of several in-flight files so urgent traffic
//! can pre-empt bulk traffic. Blocks are grouped by completion key
//! (lowercased filename + transmit timestamp), so the same filename sent at
//! a different time is a distinct file, and a file completes the moment its
//! last block arrives regardless of what else is in flight.
//!
//! A bounded FIFO of recently completed keys suppresses server-side
//! retransmissions of files we already delivered.
//!
//! Incomplete buckets are kept for the process lifetime: missing blocks
//! simply leave the bucket open until they arrive. [`FileAssembler::pending_files`]
//! exposes the bucket count for callers that want to watch for stale growth.

use std::collections::{HashMap, VecDeque};

use crate::protocol::models::{CompletedFile, QbtSegment, FILLFILE_NAME};

/// Default capacity of the recently-completed duplicate cache.
pub const DEFAULT_DUPLICATE_CACHE: usize = 100;

/// Assembler counters.
#[derive(Debug, Default, Clone)]
pub struct AssemblerStats {
    /// Segments offered to the assembler
    pub segments_received: u64,
    /// Segments dropped by the duplicate cache
    pub duplicates_suppressed: u64,
    /// Files completed and handed to the dispatcher
    pub files_completed: u64,
}

/// Reassembles QBT segments into complete files.
#[derive(Debug)]
pub struct FileAssembler {
    /// Open buckets, keyed by completion key
    buckets: HashMap<String, Vec<QbtSegment>>,

    /// Recently completed keys, oldest first
    recently_completed: VecDeque<String>,

    /// Duplicate cache capacity
    cache_capacity: usize,

    stats: AssemblerStats,
}

impl Default for FileAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FileAssembler {
    /// Create an assembler with the default duplicate-cache capacity.
    pub fn new() -> Self {
        Self::with_cache_capacity(DEFAULT_DUPLICATE_CACHE)
    }

    /// Create an assembler with an explicit duplicate-cache capacity.
    pub fn with_cache_capacity(cache_capacity: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            recently_completed: VecDeque::with_capacity(cache_capacity),
            cache_capacity,
            stats: AssemblerStats::default(),
        }
    }

    /// Offer one segment; returns the completed file when this segment was
    /// the last missing block of its transmission.
    ///
    /// Never blocks: incomplete files simply stay buffered. Reassembled
    /// bytes are ordered by block number, not arrival order.
    pub fn handle_segment(&mut self, segment: QbtSegment) -> Option<CompletedFile> {
        self.stats.segments_received += 1;

        // Filler traffic never reaches subscribers.
        if segment.filename == FILLFILE_NAME {
            return None;
        }

        let key = segment.key();

        if self.recently_completed.contains(&key) {
            self.stats.duplicates_suppressed += 1;
            log::debug!("[ASSEMBLER] Skipping segment for recently completed file: {key}");
            return None;
        }

        let total = segment.total_blocks as usize;
        let bucket = self.buckets.entry(key.clone()).or_default();
        bucket.push(segment);

        if total == 0 || bucket.len() != total {
            return None;
        }

        let mut segments = self.buckets.remove(&key)?;
        segments.sort_by_key(|s| s.block_number);

        let filename = segments[0].filename.clone();
        let mut data = Vec::with_capacity(segments.iter().map(|s| s.content.len()).sum());
        for segment in &segments {
            data.extend_from_slice(&segment.content);
        }

        self.recently_completed.push_back(key);
        while self.recently_completed.len() > self.cache_capacity {
            self.recently_completed.pop_front();
        }

        self.stats.files_completed += 1;
        log::debug!(
            "[ASSEMBLER] Completed {filename} ({} blocks, {} bytes)",
            segments.len(),
            data.len()
        );

        Some(CompletedFile { filename, data })
    }

    /// Number of open (incomplete) buckets.
    pub fn pending_files(&self) -> usize {
        self.buckets.len()
    }

    /// Assembler counters.
    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(seconds: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 9, 12, 0, seconds).unwrap()
    }

    fn segment(
        filename: &str,
        block_number: u32,
        total_blocks: u32,
        timestamp: DateTime<Utc>,
    ) -> QbtSegment {
        QbtSegment {
            filename: filename.to_string(),
            block_number,
            total_blocks,
            content: format!("{filename}#{block_number};").into_bytes(),
            checksum: 0,
            length: 0,
            version: 2,
            timestamp,
            received_at: timestamp,
            header: String::new(),
            source: String::new(),
        }
    }

    #[test]
    fn test_single_block_file_completes_immediately() {
        let mut assembler = FileAssembler::new();
        let file = assembler.handle_segment(segment("one.txt", 1, 1, ts(0))).unwrap();
        assert_eq!(file.filename, "one.txt");
        assert_eq!(file.data, b"one.txt#1;");
    }

    #[test]
    fn test_out_of_order_blocks_reassemble_in_block_order() {
        let mut assembler = FileAssembler::new();
        let t = ts(0);

        assert!(assembler.handle_segment(segment("file", 3, 4, t)).is_none());
        assert!(assembler.handle_segment(segment("file", 1, 4, t)).is_none());
        assert!(assembler.handle_segment(segment("file", 4, 4, t)).is_none());
        let file = assembler.handle_segment(segment("file", 2, 4, t)).unwrap();

        assert_eq!(file.data, b"file#1;file#2;file#3;file#4;");
    }

    #[test]
    fn test_interleaved_priority_completion_order() {
        // Urgent traffic interleaved into a bulk transmission completes
        // first even though the bulk file started first.
        let mut assembler = FileAssembler::new();
        let (t1, t2, t3) = (ts(1), ts(2), ts(3));
        let inputs = [
            ("low", 1, 4, t1),
            ("low", 2, 4, t1),
            ("high", 1, 2, t2),
            ("high", 2, 2, t2),
            ("med", 1, 3, t3),
            ("low", 3, 4, t1),
            ("med", 2, 3, t3),
            ("med", 3, 3, t3),
            ("low", 4, 4, t1),
        ];

        let completed: Vec<String> = inputs
            .iter()
            .filter_map(|&(name, block, total, t)| {
                assembler.handle_segment(segment(name, block, total, t))
            })
            .map(|f| f.filename)
            .collect();

        assert_eq!(completed, ["high", "med", "low"]);
    }

    #[test]
    fn test_same_filename_different_timestamps_are_distinct() {
        let mut assembler = FileAssembler::new();
        let (t1, t2) = (ts(1), ts(2));

        assert!(assembler.handle_segment(segment("weather.txt", 1, 2, t1)).is_none());
        assert!(assembler.handle_segment(segment("weather.txt", 1, 3, t2)).is_none());
        let first = assembler.handle_segment(segment("weather.txt", 2, 2, t1)).unwrap();
        assert!(assembler.handle_segment(segment("weather.txt", 2, 3, t2)).is_none());
        let second = assembler.handle_segment(segment("weather.txt", 3, 3, t2)).unwrap();

        assert_eq!(first.filename, "weather.txt");
        assert_eq!(second.filename, "weather.txt");
        assert_eq!(first.data, b"weather.txt#1;weather.txt#2;");
        assert_eq!(
            second.data,
            b"weather.txt#1;weather.txt#2;weather.txt#3;"
        );
    }

    #[test]
    fn test_completion_key_ignores_filename_case() {
        let mut assembler = FileAssembler::new();
        let t = ts(0);

        assert!(assembler.handle_segment(segment("MiXeD.txt", 1, 2, t)).is_none());
        let file = assembler.handle_segment(segment("mixed.TXT", 2, 2, t)).unwrap();
        assert_eq!(file.filename, "MiXeD.txt");
    }

    #[test]
    fn test_reassembled_size_is_sum_of_segment_sizes() {
        let mut assembler = FileAssembler::new();
        let t = ts(0);
        let segments: Vec<QbtSegment> = (1..=5).map(|i| segment("sized", i, 5, t)).collect();
        let expected: usize = segments.iter().map(|s| s.content.len()).sum();

        let mut file = None;
        for seg in segments {
            file = assembler.handle_segment(seg);
        }
        assert_eq!(file.unwrap().data.len(), expected);
    }

    #[test]
    fn test_duplicate_replay_after_completion_is_ignored() {
        let mut assembler = FileAssembler::new();
        let t = ts(0);

        assembler.handle_segment(segment("dup", 1, 2, t));
        assert!(assembler.handle_segment(segment("dup", 2, 2, t)).is_some());

        // Replaying a segment of the completed file dispatches nothing.
        assert!(assembler.handle_segment(segment("dup", 1, 2, t)).is_none());
        assert!(assembler.handle_segment(segment("dup", 2, 2, t)).is_none());
        assert_eq!(assembler.stats().duplicates_suppressed, 2);
        assert_eq!(assembler.stats().files_completed, 1);
    }

    #[test]
    fn test_duplicate_cache_evicts_oldest() {
        let mut assembler = FileAssembler::with_cache_capacity(1);
        let t = ts(0);

        assert!(assembler.handle_segment(segment("first", 1, 1, t)).is_some());
        assert!(assembler.handle_segment(segment("second", 1, 1, t)).is_some());

        // "first" was evicted from the cache, so a replay completes again.
        assert!(assembler.handle_segment(segment("first", 1, 1, t)).is_some());
    }

    #[test]
    fn test_fillfile_never_buffered() {
        let mut assembler = FileAssembler::new();
        assert!(assembler
            .handle_segment(segment(FILLFILE_NAME, 1, 1, ts(0)))
            .is_none());
        assert_eq!(assembler.pending_files(), 0);
    }

    #[test]
    fn test_incomplete_buckets_stay_open() {
        let mut assembler = FileAssembler::new();
        assembler.handle_segment(segment("partial", 1, 3, ts(0)));
        assembler.handle_segment(segment("other", 1, 2, ts(1)));

        assert_eq!(assembler.pending_files(), 2);
        assert_eq!(assembler.stats().files_completed, 0);
    }
}
