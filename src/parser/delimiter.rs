use super::{Packet, PacketCategory, PacketParser, PARSER_BUFFER_CAP};
use bytes::{Bytes, BytesMut};
use tracing::debug;

/// Splits the stream on any of a set of byte sequences, emitting one
/// `DelimBlock` per occurrence with the delimiter included. Partial trailing
/// data stays buffered until its delimiter (or more data) arrives.
///
/// When several delimiters match, the earliest occurrence wins; at the same
/// position the longest delimiter wins so `"\r\n"` beats `"\r"`.
pub struct DelimiterParser {
    port_id: String,
    delimiters: Vec<Vec<u8>>,
    buf: BytesMut,
    cap: usize,
}

impl DelimiterParser {
    pub fn new(port_id: &str, delimiters: Vec<Vec<u8>>) -> Self {
        Self::with_cap(port_id, delimiters, PARSER_BUFFER_CAP)
    }

    pub fn with_cap(port_id: &str, delimiters: Vec<Vec<u8>>, cap: usize) -> Self {
        debug_assert!(delimiters.iter().all(|d| !d.is_empty()));
        Self {
            port_id: port_id.to_string(),
            delimiters,
            buf: BytesMut::new(),
            cap,
        }
    }

    /// Earliest delimiter occurrence as `(start, len)`.
    fn find_next(&self) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for delim in &self.delimiters {
            if delim.len() > self.buf.len() {
                continue;
            }
            let hit = self
                .buf
                .windows(delim.len())
                .position(|w| w == delim.as_slice());
            if let Some(start) = hit {
                best = match best {
                    None => Some((start, delim.len())),
                    Some((bs, bl)) if start < bs || (start == bs && delim.len() > bl) => {
                        Some((start, delim.len()))
                    }
                    keep => keep,
                };
            }
        }
        best
    }
}

impl PacketParser for DelimiterParser {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            let _ = self.buf.split_to(excess);
            debug!(
                port_id = %self.port_id,
                dropped = excess,
                "delimiter parser buffer overflow, oldest bytes discarded"
            );
        }

        let mut packets = Vec::new();
        while let Some((start, len)) = self.find_next() {
            let block: Bytes = self.buf.split_to(start + len).freeze();
            packets.push(Packet::new(&self.port_id, block, PacketCategory::DelimBlock));
        }
        packets
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}
