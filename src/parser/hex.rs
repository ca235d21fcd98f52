use super::{Packet, PacketCategory, PacketParser};
use crate::utils::hex_ascii_line;
use bytes::Bytes;

/// Raw-byte parser with a hex inspection view: emission is one raw packet
/// per feed, but the packet text pairs each 16-byte window with its ASCII
/// sidecar. A running offset continues across feeds so line addresses stay
/// meaningful for the whole session.
pub struct HexParser {
    port_id: String,
    offset: usize,
}

impl HexParser {
    pub fn new(port_id: &str) -> Self {
        Self {
            port_id: port_id.to_string(),
            offset: 0,
        }
    }
}

impl PacketParser for HexParser {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        if bytes.is_empty() {
            return Vec::new();
        }
        let mut view = String::new();
        for window in bytes.chunks(16) {
            view.push_str(&hex_ascii_line(self.offset, window));
            view.push('\n');
            self.offset += window.len();
        }
        let mut packet = Packet::new(
            &self.port_id,
            Bytes::copy_from_slice(bytes),
            PacketCategory::RawPacket,
        );
        packet.text = view;
        vec![packet]
    }

    fn reset(&mut self) {
        self.offset = 0;
    }
}
