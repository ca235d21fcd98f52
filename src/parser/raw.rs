use super::{Packet, PacketCategory, PacketParser};
use bytes::Bytes;

/// Pass-through parser: every feed becomes one `RawPacket` with the exact
/// bytes. No internal buffering, so `reset` is a no-op.
pub struct RawParser {
    port_id: String,
}

impl RawParser {
    pub fn new(port_id: &str) -> Self {
        Self {
            port_id: port_id.to_string(),
        }
    }
}

impl PacketParser for RawParser {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        if bytes.is_empty() {
            return Vec::new();
        }
        vec![Packet::new(
            &self.port_id,
            Bytes::copy_from_slice(bytes),
            PacketCategory::RawPacket,
        )]
    }

    fn reset(&mut self) {}
}
