//! Incremental JPEG frame scanner.
//!
//! Bytes arrive in arbitrary chunks; [`FrameScanner`] keeps just enough of
//! them to find the next start-of-image / end-of-image pair and remembers
//! how far it has already searched, so nothing is rescanned and a marker
//! split across two chunks is still found. Output never depends on where
//! the chunk boundaries fall.

use bytes::{Bytes, BytesMut};
use tracing::warn;

pub const START_MARKER: [u8; 2] = [0xFF, 0xD8];
pub const END_MARKER: [u8; 2] = [0xFF, 0xD9];

/// Bytes kept after a failed search so a marker straddling two reads is
/// still seen.
const CARRY: usize = END_MARKER.len() - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Looking for a start marker.
    Seeking,
    /// Buffer begins with a start marker; looking for the end marker.
    InFrame,
    /// Current frame exceeded the size cap; dropping bytes up to its end.
    Skipping,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScannerStats {
    pub frames: u64,
    pub oversized: u64,
    pub discarded_bytes: u64,
}

#[derive(Debug)]
pub struct FrameScanner {
    buf: BytesMut,
    state: ScanState,
    /// Offset in `buf` where the next search resumes.
    cursor: usize,
    max_frame_bytes: usize,
    stats: ScannerStats,
}

impl FrameScanner {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: ScanState::Seeking,
            cursor: 0,
            max_frame_bytes,
            stats: ScannerStats::default(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently held.
    pub fn retained(&self) -> usize {
        self.buf.len()
    }

    pub fn stats(&self) -> ScannerStats {
        self.stats
    }

    /// Drop everything buffered, e.g. after the connection was replaced.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = ScanState::Seeking;
        self.cursor = 0;
    }

    /// Pull the next complete frame out of what has been pushed so far.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.state {
                ScanState::Seeking => match find(&self.buf, self.cursor, &START_MARKER) {
                    Some(pos) => {
                        self.discard(pos);
                        self.state = ScanState::InFrame;
                        self.cursor = START_MARKER.len();
                    }
                    None => {
                        self.keep_tail();
                        return None;
                    }
                },
                ScanState::InFrame => match find(&self.buf, self.cursor, &END_MARKER) {
                    Some(pos) => {
                        let frame = self.buf.split_to(pos + END_MARKER.len()).freeze();
                        self.state = ScanState::Seeking;
                        self.cursor = 0;
                        if frame.len() > self.max_frame_bytes {
                            self.reject_oversized(frame.len() as u64);
                            continue;
                        }
                        self.stats.frames += 1;
                        return Some(frame);
                    }
                    None if self.buf.len() > self.max_frame_bytes => {
                        let dropped = self.buf.len() - CARRY;
                        self.reject_oversized(dropped as u64);
                        let _ = self.buf.split_to(dropped);
                        self.state = ScanState::Skipping;
                        self.cursor = 0;
                    }
                    None => {
                        self.cursor = self
                            .buf
                            .len()
                            .saturating_sub(CARRY)
                            .max(START_MARKER.len());
                        return None;
                    }
                },
                ScanState::Skipping => match find(&self.buf, self.cursor, &END_MARKER) {
                    Some(pos) => {
                        self.discard(pos + END_MARKER.len());
                        self.state = ScanState::Seeking;
                        self.cursor = 0;
                    }
                    None => {
                        self.keep_tail();
                        return None;
                    }
                },
            }
        }
    }

    fn discard(&mut self, n: usize) {
        if n > 0 {
            let _ = self.buf.split_to(n);
            self.stats.discarded_bytes += n as u64;
        }
    }

    fn keep_tail(&mut self) {
        let excess = self.buf.len().saturating_sub(CARRY);
        self.discard(excess);
        self.cursor = 0;
    }

    fn reject_oversized(&mut self, bytes: u64) {
        self.stats.oversized += 1;
        self.stats.discarded_bytes += bytes;
        warn!(
            "Dropping frame larger than {} bytes",
            self.max_frame_bytes
        );
    }
}

fn find(haystack: &[u8], from: usize, marker: &[u8; 2]) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(marker.len())
        .position(|w| w == marker)
        .map(|p| p + from)
}
