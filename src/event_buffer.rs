//! Event Buffer (§4.1): a framed reader over a byte stream.
//!
//! Maintains a bounded buffer plus three cursors — `valid_end`,
//! `parsed_end` and `next_event_start` — and extracts one event per
//! line, resynchronising after truncation.

use crate::event::{self, Event};
use std::io;

/// Minimum buffer capacity (spec: "minimum capacity 64 KiB").
pub const MIN_CAPACITY: usize = 64 * 1024;
/// Event lines longer than this are truncated at the last key/value
/// boundary (spec: `MAX_EVENT_SIZE >= 8 KiB`).
pub const MAX_EVENT_SIZE: usize = 8 * 1024;
/// Below this much unparsed data, more bytes are read before giving up
/// for this cycle (spec: `MIN_EVENT_SIZE >= 64 B`).
pub const MIN_EVENT_SIZE: usize = 64;

/// Source of raw bytes the buffer reads from. Mirrors the spec's
/// `bytes_available()` / `read(dst, n) -> bytes_read | -1` contract;
/// `read` returning `Err(ErrorKind::Interrupted)` is treated as "no
/// progress this cycle", everything else is fatal to the reader.
pub trait ByteSource {
    fn bytes_available(&mut self) -> io::Result<usize>;
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Synced,
    Resyncing,
}

pub struct EventBuffer {
    buf: Vec<u8>,
    valid_end: usize,
    next_event_start: usize,
    sync: SyncState,
    capacity: usize,
    max_event: usize,
    min_event: usize,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::with_limits(MIN_CAPACITY, MAX_EVENT_SIZE, MIN_EVENT_SIZE)
    }

    pub fn with_limits(capacity: usize, max_event: usize, min_event: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        let max_event = max_event.max(MAX_EVENT_SIZE.min(capacity));
        let min_event = min_event.max(MIN_EVENT_SIZE);
        Self {
            // one extra byte kept permanently NUL for C-string-style scans
            buf: vec![0u8; capacity + 1],
            valid_end: 0,
            next_event_start: 0,
            sync: SyncState::Synced,
            capacity,
            max_event,
            min_event,
        }
    }

    fn unparsed_len(&self) -> usize {
        self.valid_end - self.next_event_start
    }

    /// Compact: if bytes already parsed sit before `next_event_start`,
    /// slide the unparsed tail down to offset 0.
    fn compact(&mut self) {
        if self.next_event_start == 0 {
            return;
        }
        let len = self.unparsed_len();
        self.buf.copy_within(self.next_event_start..self.valid_end, 0);
        self.next_event_start = 0;
        self.valid_end = len;
    }

    fn fill(&mut self, source: &mut dyn ByteSource) -> io::Result<bool> {
        self.compact();
        if self.valid_end >= self.capacity {
            // no room left at all; this only happens if a single line
            // already exceeds capacity, handled by the truncation path
            // in extract_event before we ever get here in practice.
            return Ok(false);
        }
        let space = &mut self.buf[self.valid_end..self.capacity];
        match source.read(space) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.valid_end += n;
                self.buf[self.valid_end] = 0;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pull bytes from `source` until at least `MIN_EVENT_SIZE` bytes of
    /// unparsed data are buffered, or no more data is currently
    /// available.
    fn ensure_min(&mut self, source: &mut dyn ByteSource) -> io::Result<()> {
        while self.unparsed_len() < self.min_event {
            let available = source.bytes_available()?;
            if available == 0 && self.unparsed_len() == 0 {
                return Ok(());
            }
            if !self.fill(source)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Resynchronise: discard bytes up to (and including) the next
    /// newline.
    fn resync(&mut self) {
        let region = &self.buf[self.next_event_start..self.valid_end];
        if let Some(pos) = region.iter().position(|&b| b == b'\n') {
            self.next_event_start += pos + 1;
            self.sync = SyncState::Synced;
        }
    }

    /// Truncate an over-long line at the last whitespace boundary before
    /// `max_event`, append a synthetic newline, and enter unsynchronised
    /// state. Returns the truncated line (without the synthetic
    /// newline).
    fn truncate_overlong(&mut self) -> Vec<u8> {
        let start = self.next_event_start;
        let limit = (start + self.max_event).min(self.valid_end);
        let region = &self.buf[start..limit];
        let cut = region
            .iter()
            .rposition(|&b| b == b' ' || b == b'\t')
            .unwrap_or(region.len());
        let line = region[..cut].to_vec();
        // drop everything up to the cut point; resync() will skip the
        // remainder of the real line on a later call once more data has
        // arrived and a newline is found.
        self.next_event_start = start + cut;
        self.sync = SyncState::Resyncing;
        line
    }

    /// Extract one event if a complete line is available, reading more
    /// data from `source` as needed. Returns `Ok(None)` if no complete
    /// event is currently available (not an error: the caller should
    /// retry after more I/O).
    pub fn extract_event(
        &mut self,
        source: &mut dyn ByteSource,
    ) -> io::Result<Option<Result<Event, crate::error::ParseError>>> {
        loop {
            if self.sync == SyncState::Resyncing {
                self.resync();
                if self.sync == SyncState::Resyncing {
                    self.ensure_min(source)?;
                    if self.unparsed_len() == 0 {
                        return Ok(None);
                    }
                    continue;
                }
            }

            self.ensure_min(source)?;
            let region = &self.buf[self.next_event_start..self.valid_end];
            if region.len() >= self.max_event && !region.contains(&b'\n') {
                let truncated = self.truncate_overlong();
                tracing::warn!(
                    "event exceeds MAX_EVENT_SIZE, truncating at whitespace boundary"
                );
                let mut line = String::from_utf8_lossy(&truncated).into_owned();
                line.push('\n');
                return Ok(Some(event::parse(&line, event::unix_now)));
            }

            match region.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let line_bytes = &self.buf[self.next_event_start..self.next_event_start + pos];
                    let line = String::from_utf8_lossy(line_bytes).into_owned();
                    self.next_event_start += pos + 1;
                    return Ok(Some(event::parse(&line, event::unix_now)));
                }
                None => {
                    if !self.fill(source)? {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FixedSource {
        chunks: VecDeque<Vec<u8>>,
    }

    impl FixedSource {
        fn new(data: &[u8]) -> Self {
            Self {
                chunks: VecDeque::from(vec![data.to_vec()]),
            }
        }
    }

    impl ByteSource for FixedSource {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.chunks.front().map(|c| c.len()).unwrap_or(0))
        }

        fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(dst.len());
                    dst[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        let mut remaining = chunk;
                        remaining.drain(..n);
                        self.chunks.push_front(remaining);
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    #[test]
    fn extracts_single_event() {
        let mut buf = EventBuffer::new();
        let mut src = FixedSource::new(b"!class=ereport.fs.zfs.io pool_guid=1 vdev_guid=2\n");
        let ev = buf.extract_event(&mut src).unwrap().unwrap().unwrap();
        assert_eq!(ev.get("pool_guid"), Some("1"));
    }

    #[test]
    fn extracts_two_events_in_order() {
        let mut buf = EventBuffer::new();
        let mut src =
            FixedSource::new(b"!class=a pool_guid=1 vdev_guid=1\n!class=b pool_guid=2 vdev_guid=2\n");
        let first = buf.extract_event(&mut src).unwrap().unwrap().unwrap();
        let second = buf.extract_event(&mut src).unwrap().unwrap().unwrap();
        assert_eq!(first.get("class"), Some("a"));
        assert_eq!(second.get("class"), Some("b"));
    }

    #[test]
    fn no_complete_line_returns_none() {
        let mut buf = EventBuffer::new();
        let mut src = FixedSource::new(b"!class=a pool_guid=1");
        assert!(buf.extract_event(&mut src).unwrap().is_none());
    }

    #[test]
    fn overlong_line_is_truncated_and_resyncs() {
        let mut buf = EventBuffer::with_limits(MIN_CAPACITY, 64, 8);
        let mut long_line = String::from("!class=ereport.fs.zfs.io ");
        while long_line.len() < 200 {
            long_line.push_str("pad=xxxxxxxx ");
        }
        long_line.push('\n');
        long_line.push_str("!class=next pool_guid=9 vdev_guid=9\n");
        let mut src = FixedSource::new(long_line.as_bytes());

        let truncated = buf.extract_event(&mut src).unwrap().unwrap().unwrap();
        assert_eq!(truncated.get("class"), Some("ereport.fs.zfs.io"));

        let next = buf.extract_event(&mut src).unwrap().unwrap().unwrap();
        assert_eq!(next.get("pool_guid"), Some("9"));
    }
}
