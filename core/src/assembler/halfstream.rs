//! Per-direction half-stream reassembly: a growing byte buffer plus the three
//! parallel block-metadata arrays spec.md §3/§4.3 require.

use super::block::Block;
use chrono::{DateTime, Duration, Utc};

/// One direction's reassembly state within a flow.
#[derive(Debug, Default)]
pub struct HalfStream {
    buffer: Vec<u8>,
    blocks: Vec<Block>,
    /// Next expected sequence number, relative to the flow's initial sequence number
    /// (so it starts at 0). `None` until the first segment with a payload arrives.
    next_seq: Option<u32>,
    open_block: Option<usize>,
}

/// Outcome of delivering one segment's payload to a `HalfStream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub bytes_appended: usize,
    pub retransmitted: bool,
}

impl HalfStream {
    pub fn new() -> Self {
        HalfStream::default()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn total_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Delivers `payload`, captured at relative sequence number `seq`, seen at
    /// `timestamp`. `block_gap` is the configured `T_block` wall-clock threshold: a
    /// new block starts whenever the gap since the half-stream's last packet exceeds
    /// it, or whenever there is no currently open block.
    pub fn deliver(&mut self, seq: u32, payload: &[u8], timestamp: DateTime<Utc>, block_gap: Duration) -> DeliveryOutcome {
        if payload.is_empty() {
            return DeliveryOutcome { bytes_appended: 0, retransmitted: false };
        }

        let expected = *self.next_seq.get_or_insert(seq);
        let relative = seq.wrapping_sub(expected) as i64;

        // Bytes whose entire range was already delivered: pure retransmission, no new
        // bytes to append. `relative` is i64 so this comparison is exact even though
        // the underlying sequence arithmetic wraps at u32.
        let already_delivered_end = relative + payload.len() as i64;
        if already_delivered_end <= 0 {
            self.mark_current_block_lossy();
            return DeliveryOutcome { bytes_appended: 0, retransmitted: true };
        }

        // Partial overlap: some prefix of `payload` duplicates bytes we already have.
        let new_start = relative.max(0) as usize;
        let retransmitted = new_start > 0;
        let new_bytes = &payload[new_start..];

        let gap_exceeded = match self.blocks.last() {
            Some(last) if self.open_block.is_some() => timestamp.signed_duration_since(last.timestamp) > block_gap,
            _ => false,
        };
        if self.open_block.is_none() || gap_exceeded {
            self.blocks.push(Block {
                start_offset: self.buffer.len(),
                timestamp,
                loss: retransmitted,
            });
            self.open_block = Some(self.blocks.len() - 1);
        } else if retransmitted {
            self.mark_current_block_lossy();
        }

        self.buffer.extend_from_slice(new_bytes);
        self.next_seq = Some(expected.wrapping_add((relative.max(0) as u32).wrapping_add(new_bytes.len() as u32)));

        DeliveryOutcome { bytes_appended: new_bytes.len(), retransmitted }
    }

    fn mark_current_block_lossy(&mut self) {
        if let Some(idx) = self.open_block {
            self.blocks[idx].loss = true;
        }
    }

    /// Splits the accumulated buffer into block-preserving chunks of at most
    /// `max_chunk_bytes`, per spec.md §4.4. Each returned chunk's block array is
    /// re-based so `start_offset` is relative to that chunk's own payload.
    pub fn into_chunks(self, max_chunk_bytes: usize) -> Vec<HalfStreamChunk> {
        if self.buffer.is_empty() {
            return vec![];
        }
        let max_chunk_bytes = max_chunk_bytes.max(1);
        let total = self.buffer.len();
        let mut chunks = Vec::new();
        let mut chunk_start = 0usize;

        // A block's true extent runs from its own start to the next block's start (or
        // the end of the buffer). Any chunk it overlaps gets an entry for it, rebased
        // to that chunk's coordinates -- offset 0 if the block actually began in an
        // earlier chunk, so every chunk has a block covering its first byte.
        while chunk_start < total {
            let chunk_end = (chunk_start + max_chunk_bytes).min(total);
            let mut blocks = Vec::new();
            for (i, b) in self.blocks.iter().enumerate() {
                let block_end = self.blocks.get(i + 1).map(|n| n.start_offset).unwrap_or(total);
                if b.start_offset < chunk_end && block_end > chunk_start {
                    blocks.push(Block {
                        start_offset: b.start_offset.max(chunk_start) - chunk_start,
                        timestamp: b.timestamp,
                        loss: b.loss,
                    });
                }
            }
            chunks.push(HalfStreamChunk {
                payload: self.buffer[chunk_start..chunk_end].to_vec(),
                blocks,
            });
            chunk_start = chunk_end;
        }
        chunks
    }
}

/// One chunk of a terminated half-stream, ready for the Persister to write out as a
/// `ConnectionStream` document.
#[derive(Debug, Clone)]
pub struct HalfStreamChunk {
    pub payload: Vec<u8>,
    pub blocks: Vec<Block>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(0, 0).unwrap() + Duration::milliseconds(offset_ms)
    }

    #[test]
    fn in_order_delivery_appends_and_tracks_one_block() {
        let mut hs = HalfStream::new();
        hs.deliver(0, b"hello ", ts(0), Duration::milliseconds(100));
        hs.deliver(6, b"world", ts(10), Duration::milliseconds(100));
        assert_eq!(hs.buffer(), b"hello world");
        assert_eq!(hs.blocks().len(), 1);
        assert!(!hs.blocks()[0].loss);
    }

    #[test]
    fn gap_exceeding_threshold_starts_a_new_block() {
        let mut hs = HalfStream::new();
        hs.deliver(0, b"a", ts(0), Duration::milliseconds(50));
        hs.deliver(1, b"b", ts(1000), Duration::milliseconds(50));
        assert_eq!(hs.blocks().len(), 2);
        assert_eq!(hs.blocks()[1].start_offset, 1);
    }

    #[test]
    fn exact_retransmission_is_not_duplicated_but_flagged() {
        let mut hs = HalfStream::new();
        hs.deliver(0, b"payload", ts(0), Duration::milliseconds(100));
        let outcome = hs.deliver(0, b"payload", ts(5), Duration::milliseconds(100));
        assert_eq!(hs.buffer(), b"payload");
        assert!(outcome.retransmitted);
        assert!(hs.blocks()[0].loss);
    }

    #[test]
    fn chunking_preserves_bytes_and_relative_block_offsets() {
        let mut hs = HalfStream::new();
        let payload = vec![b'x'; 150 * 1024];
        hs.deliver(0, &payload, ts(0), Duration::milliseconds(100));
        let total = hs.total_bytes();
        let chunks = hs.into_chunks(64 * 1024);
        assert_eq!(chunks.len(), 3);
        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.payload.clone()).collect();
        assert_eq!(reassembled.len(), total);
        assert_eq!(chunks[0].blocks[0].start_offset, 0);
    }
}
