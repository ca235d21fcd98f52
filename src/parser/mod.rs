//! # Packet Parser Family
//!
//! Streaming parsers that turn the receive byte stream into [`Packet`]
//! records. Parsers accumulate internal state between calls and emit zero or
//! more packets per `feed`; the packet sequence is identical for any
//! segmentation of the same input bytes.
//!
//! ## Implementations
//!
//! | Parser | Emission |
//! |---|---|
//! | [`RawParser`] | one `RawPacket` per feed, exact bytes, no buffering |
//! | [`DelimiterParser`] | one `DelimBlock` per delimiter occurrence, delimiter included |
//! | [`FixedLengthParser`] | one `FixedBlock` per `L`-byte boundary crossed |
//! | [`AtParser`] | grouped AT command responses, URCs, and prompts |
//! | [`HexParser`] | raw packets whose text is a 16-byte hex/ASCII view |
//!
//! ## Memory policy
//!
//! Every accumulating parser has a hard cap (default 1 MiB). On overflow the
//! oldest buffered bytes are discarded to fit, the event is logged, and no
//! caller-visible error is raised. Packets never borrow from the parser's
//! internal buffer; subscribers receive owned values.

use crate::config::ParserSelection;
use bytes::Bytes;
use std::collections::HashMap;

mod at;
mod delimiter;
mod fixed;
mod hex;
mod raw;

pub use at::AtParser;
pub use delimiter::DelimiterParser;
pub use fixed::FixedLengthParser;
pub use hex::HexParser;
pub use raw::RawParser;

/// Hard cap for accumulating parser buffers.
pub const PARSER_BUFFER_CAP: usize = 1024 * 1024;

/// Classification of an emitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketCategory {
    RawPacket,
    AtOk,
    AtError,
    AtCmeError,
    Urc,
    Prompt,
    DelimBlock,
    FixedBlock,
}

/// Structured record produced by parsing. Short-lived: consumed by listeners
/// and never retained by the parser that emitted it.
#[derive(Debug, Clone)]
pub struct Packet {
    pub port_id: String,
    pub timestamp_ns: u64,
    pub bytes: Bytes,
    /// Best-effort text decode of `bytes` (lossy UTF-8, or a formatted view
    /// for the hex parser).
    pub text: String,
    pub category: PacketCategory,
    pub metadata: HashMap<String, String>,
}

impl Packet {
    pub(crate) fn new(port_id: &str, bytes: Bytes, category: PacketCategory) -> Self {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Self {
            port_id: port_id.to_string(),
            timestamp_ns: crate::utils::current_timestamp_ns(),
            bytes,
            text,
            category,
            metadata: HashMap::new(),
        }
    }
}

/// Streaming parser interface. `feed` consumes any chunking of the input;
/// `reset` drops buffered state (used when a connection switches parsers).
pub trait PacketParser: Send {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Packet>;
    fn reset(&mut self);
}

/// Construct the parser selected by `config` for `port_id`.
pub fn make_parser(port_id: &str, selection: &ParserSelection) -> Box<dyn PacketParser> {
    match selection {
        ParserSelection::Raw => Box::new(RawParser::new(port_id)),
        ParserSelection::At => Box::new(AtParser::new(port_id)),
        ParserSelection::Delimiter { delimiters } => {
            Box::new(DelimiterParser::new(port_id, delimiters.clone()))
        }
        ParserSelection::FixedLength { length } => {
            Box::new(FixedLengthParser::new(port_id, *length))
        }
        ParserSelection::Hex => Box::new(HexParser::new(port_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParserSelection;

    #[test]
    fn factory_selects_by_config() {
        let mut parser = make_parser("p", &ParserSelection::Raw);
        let packets = parser.feed(b"xy");
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].category, PacketCategory::RawPacket);

        let mut parser = make_parser(
            "p",
            &ParserSelection::FixedLength { length: 2 },
        );
        let packets = parser.feed(b"abcd");
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].category, PacketCategory::FixedBlock);
    }
}
