use std::collections::VecDeque;
use std::time::SystemTime;

pub const DEFAULT_RING_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub seq: u64,
    pub data: Vec<u8>,
    pub has_ansi: bool,
    pub timestamp: SystemTime,
}

/// Recent PTY output, bounded by total bytes. Oldest chunks are evicted
/// first; the newest chunk is always kept even if it alone exceeds the bound.
#[derive(Debug)]
pub struct RingBuffer {
    chunks: VecDeque<OutputChunk>,
    bytes: usize,
    max_bytes: usize,
}

impl RingBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            max_bytes: max_bytes.max(1),
        }
    }

    pub fn push(&mut self, seq: u64, data: Vec<u8>, has_ansi: bool) {
        self.bytes += data.len();
        self.chunks.push_back(OutputChunk {
            seq,
            data,
            has_ansi,
            timestamp: SystemTime::now(),
        });
        while self.bytes > self.max_bytes && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.bytes -= evicted.data.len();
            }
        }
    }

    pub fn replay_from(&self, last_seq_seen: Option<u64>) -> Vec<OutputChunk> {
        let start_after = last_seq_seen.unwrap_or(0);
        self.chunks
            .iter()
            .filter(|chunk| chunk.seq > start_after)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn oldest_seq(&self) -> Option<u64> {
        self.chunks.front().map(|c| c.seq)
    }

    #[cfg(test)]
    fn newest_seq(&self) -> Option<u64> {
        self.chunks.back().map(|c| c.seq)
    }
}

/// True if the chunk contains a CSI or OSC introducer.
pub fn has_ansi(data: &[u8]) -> bool {
    data.windows(2)
        .any(|w| w == b"\x1b[" || w == b"\x1b]")
}

/// Cursor position request (`ESC [ 6 n`).
pub const CURSOR_POSITION_REQUEST: &[u8] = b"\x1b[6n";

/// Reply written back for each cursor position request. The trailing CR makes
/// line-buffered readers see it immediately.
pub const CURSOR_POSITION_REPLY: &[u8] = b"\x1b[1;1R\r";

/// Remove cursor position requests from `data`, returning the cleaned bytes
/// and how many requests were found.
pub fn strip_cursor_requests(data: &[u8]) -> (Vec<u8>, usize) {
    let needle = CURSOR_POSITION_REQUEST;
    let mut out = Vec::with_capacity(data.len());
    let mut found = 0;
    let mut i = 0;
    while i < data.len() {
        if data[i..].starts_with(needle) {
            found += 1;
            i += needle.len();
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    (out, found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_is_bounded_by_bytes_and_ordered() {
        let mut ring = RingBuffer::new(8);
        ring.push(1, b"aaaa".to_vec(), false);
        ring.push(2, b"bbbb".to_vec(), false);
        ring.push(3, b"cccc".to_vec(), false);

        let all = ring.replay_from(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].seq, 2);
        assert_eq!(all[1].data, b"cccc");
        assert_eq!(ring.bytes, 8);

        let since = ring.replay_from(Some(2));
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].seq, 3);
        assert_eq!(ring.oldest_seq(), Some(2));
        assert_eq!(ring.newest_seq(), Some(3));
    }

    #[test]
    fn oversized_chunk_is_kept_alone() {
        let mut ring = RingBuffer::new(4);
        ring.push(1, b"ab".to_vec(), false);
        ring.push(2, b"0123456789".to_vec(), false);
        let all = ring.replay_from(None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].seq, 2);
    }

    #[test]
    fn detects_ansi_sequences() {
        assert!(has_ansi(b"\x1b[31mred"));
        assert!(has_ansi(b"\x1b]0;title\x07"));
        assert!(!has_ansi(b"plain text\n"));
        assert!(!has_ansi(b"\x1b"));
    }

    #[test]
    fn strips_cursor_position_requests() {
        let (clean, found) = strip_cursor_requests(b"ready\x1b[6n> \x1b[6n");
        assert_eq!(clean, b"ready> ");
        assert_eq!(found, 2);

        let (clean, found) = strip_cursor_requests(b"nothing here");
        assert_eq!(clean, b"nothing here");
        assert_eq!(found, 0);
    }
}
