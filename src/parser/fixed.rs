use super::{Packet, PacketCategory, PacketParser};
use bytes::BytesMut;

/// Emits one `FixedBlock` of exactly `length` bytes per boundary crossed.
/// The trailing partial block stays buffered, so memory is bounded by
/// `length` (validated to 1..=4096 at configuration time).
pub struct FixedLengthParser {
    port_id: String,
    length: usize,
    buf: BytesMut,
}

impl FixedLengthParser {
    pub fn new(port_id: &str, length: usize) -> Self {
        debug_assert!((1..=4096).contains(&length));
        Self {
            port_id: port_id.to_string(),
            length,
            buf: BytesMut::new(),
        }
    }
}

impl PacketParser for FixedLengthParser {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        self.buf.extend_from_slice(bytes);
        let mut packets = Vec::new();
        while self.buf.len() >= self.length {
            let block = self.buf.split_to(self.length).freeze();
            packets.push(Packet::new(&self.port_id, block, PacketCategory::FixedBlock));
        }
        packets
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_exactly_the_configured_length() {
        let mut parser = FixedLengthParser::new("p", 4);
        let packets = parser.feed(b"0123456789");
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0].bytes[..], b"0123");
        assert_eq!(&packets[1].bytes[..], b"4567");
        // "89" waits for two more bytes.
        let packets = parser.feed(b"ab");
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].bytes[..], b"89ab");
    }

    #[test]
    fn chunking_does_not_change_blocks() {
        let mut whole = FixedLengthParser::new("p", 3);
        let mut split = FixedLengthParser::new("p", 3);
        let all: Vec<_> = whole
            .feed(b"abcdefghi")
            .into_iter()
            .map(|p| p.bytes)
            .collect();
        let mut pieces = Vec::new();
        for chunk in [b"a".as_slice(), b"bcde", b"", b"fgh", b"i"] {
            pieces.extend(split.feed(chunk).into_iter().map(|p| p.bytes));
        }
        assert_eq!(all, pieces);
    }
}
