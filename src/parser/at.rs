use super::{Packet, PacketCategory, PacketParser, PARSER_BUFFER_CAP};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// Streaming AT-command response parser.
///
/// Responses are grouped: informational lines accumulate until a terminating
/// line arrives, and the whole group is emitted as one packet whose category
/// comes from the terminator:
///
/// - a line ending in the word `OK` → `AtOk`
/// - a line ending in the word `ERROR` → `AtError`
/// - a line starting with `+CME ERROR:` → `AtCmeError` (the code text is
///   placed in packet metadata under `"cme"`)
///
/// A complete `+`-prefixed line arriving while nothing is pending is an
/// unsolicited result code and emits immediately as `Urc`. A `>` at line
/// start is the data prompt and emits immediately as `Prompt`.
///
/// The word check means an informational line that merely contains `ERROR`
/// (`"last ERROR was transient"`) is not misclassified; only a line whose
/// final word is the terminator ends the group.
///
/// Processing is byte-at-a-time, so the emitted packet sequence is identical
/// for any chunking of the same input.
pub struct AtParser {
    port_id: String,
    /// Current incomplete line.
    line: Vec<u8>,
    /// Completed informational lines awaiting a terminator.
    pending: BytesMut,
    cap: usize,
}

impl AtParser {
    pub fn new(port_id: &str) -> Self {
        Self::with_cap(port_id, PARSER_BUFFER_CAP)
    }

    pub fn with_cap(port_id: &str, cap: usize) -> Self {
        Self {
            port_id: port_id.to_string(),
            line: Vec::new(),
            pending: BytesMut::new(),
            cap,
        }
    }

    fn finish_line(&mut self, packets: &mut Vec<Packet>) {
        let line = std::mem::take(&mut self.line);
        let content_len = line
            .strip_suffix(b"\r\n")
            .or_else(|| line.strip_suffix(b"\n"))
            .map(|c| c.len())
            .unwrap_or(line.len());
        let content = String::from_utf8_lossy(&line[..content_len]).into_owned();

        if let Some(code) = content.strip_prefix("+CME ERROR:") {
            let mut packet = self.emit_group(&line, PacketCategory::AtCmeError);
            packet
                .metadata
                .insert("cme".to_string(), code.trim().to_string());
            packets.push(packet);
        } else if ends_with_word(&content, "OK") {
            packets.push(self.emit_group(&line, PacketCategory::AtOk));
        } else if ends_with_word(&content, "ERROR") {
            packets.push(self.emit_group(&line, PacketCategory::AtError));
        } else if content.starts_with('+') && self.pending.is_empty() {
            packets.push(Packet::new(
                &self.port_id,
                Bytes::copy_from_slice(&line),
                PacketCategory::Urc,
            ));
        } else {
            self.pending.put_slice(&line);
            if self.pending.len() > self.cap {
                let excess = self.pending.len() - self.cap;
                let _ = self.pending.split_to(excess);
                debug!(
                    port_id = %self.port_id,
                    dropped = excess,
                    "at parser buffer overflow, oldest bytes discarded"
                );
            }
        }
    }

    /// Emit pending informational lines plus the terminating line as one
    /// packet of the given category.
    fn emit_group(&mut self, terminator: &[u8], category: PacketCategory) -> Packet {
        let mut group = std::mem::take(&mut self.pending);
        group.put_slice(terminator);
        Packet::new(&self.port_id, group.freeze(), category)
    }
}

impl PacketParser for AtParser {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        let mut packets = Vec::new();
        for &b in bytes {
            if self.line.is_empty() && b == b'>' {
                packets.push(Packet::new(
                    &self.port_id,
                    Bytes::from_static(b">"),
                    PacketCategory::Prompt,
                ));
                continue;
            }
            self.line.push(b);
            if self.line.len() > self.cap {
                let excess = self.line.len() - self.cap;
                self.line.drain(..excess);
            }
            if b == b'\n' {
                self.finish_line(&mut packets);
            }
        }
        packets
    }

    fn reset(&mut self) {
        self.line.clear();
        self.pending.clear();
    }
}

/// True when `text` ends with `word` at a word boundary (the preceding
/// character, if any, is not alphanumeric or underscore).
fn ends_with_word(text: &str, word: &str) -> bool {
    let Some(head) = text.strip_suffix(word) else {
        return false;
    };
    match head.chars().last() {
        None => true,
        Some(c) => !(c.is_alphanumeric() || c == '_'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(packets: &[Packet]) -> Vec<PacketCategory> {
        packets.iter().map(|p| p.category).collect()
    }

    #[test]
    fn groups_multi_line_response_under_ok() {
        let mut parser = AtParser::new("p");
        let packets = parser.feed(b"AT+CSQ\r\n+CSQ: 23,0\r\nOK\r\n");
        assert_eq!(categories(&packets), vec![PacketCategory::AtOk]);
        assert_eq!(&packets[0].bytes[..], b"AT+CSQ\r\n+CSQ: 23,0\r\nOK\r\n");
        assert_eq!(packets[0].text, "AT+CSQ\r\n+CSQ: 23,0\r\nOK\r\n");
    }

    #[test]
    fn error_terminator_classifies_at_error() {
        let mut parser = AtParser::new("p");
        let packets = parser.feed(b"AT+BAD\r\nERROR\r\n");
        assert_eq!(categories(&packets), vec![PacketCategory::AtError]);
    }

    #[test]
    fn informational_error_text_is_not_a_terminator() {
        let mut parser = AtParser::new("p");
        // "ERROR" appears mid-line and is not the final word: keep grouping.
        let packets = parser.feed(b"AT\r\nlast ERROR was transient\r\nOK\r\n");
        assert_eq!(categories(&packets), vec![PacketCategory::AtOk]);
        assert!(packets[0].text.contains("transient"));
    }

    #[test]
    fn word_boundary_rejects_suffix_matches() {
        assert!(ends_with_word("OK", "OK"));
        assert!(ends_with_word("AT OK", "OK"));
        assert!(!ends_with_word("NOTOK", "OK"));
        assert!(!ends_with_word("9OK", "OK"));
        assert!(ends_with_word(",OK", "OK"));
    }

    #[test]
    fn cme_error_carries_code_metadata() {
        let mut parser = AtParser::new("p");
        let packets = parser.feed(b"AT+CPIN?\r\n+CME ERROR: 10\r\n");
        assert_eq!(categories(&packets), vec![PacketCategory::AtCmeError]);
        assert_eq!(packets[0].metadata.get("cme").unwrap(), "10");
    }

    #[test]
    fn unsolicited_plus_line_is_urc_only_when_idle() {
        let mut parser = AtParser::new("p");
        let packets = parser.feed(b"+RING\r\n");
        assert_eq!(categories(&packets), vec![PacketCategory::Urc]);

        // The same shape inside a pending response groups instead.
        let packets = parser.feed(b"AT+COPS?\r\n+COPS: 0\r\nOK\r\n");
        assert_eq!(categories(&packets), vec![PacketCategory::AtOk]);
    }

    #[test]
    fn prompt_at_line_start_emits_immediately() {
        let mut parser = AtParser::new("p");
        let packets = parser.feed(b"AT+CMGS=5\r\n> ");
        assert_eq!(categories(&packets), vec![PacketCategory::Prompt]);
        assert_eq!(&packets[0].bytes[..], b">");
    }

    #[test]
    fn chunking_invariance_over_random_segmentation() {
        use rand::{Rng, SeedableRng};
        let input: &[u8] =
            b"AT\r\nOK\r\n+RING\r\nAT+CSQ\r\n+CSQ: 9,0\r\nOK\r\nAT+X\r\n+CME ERROR: 4\r\n> AT\r\nERROR\r\n";
        let mut whole = AtParser::new("p");
        let reference: Vec<(PacketCategory, Bytes)> = whole
            .feed(input)
            .into_iter()
            .map(|p| (p.category, p.bytes))
            .collect();

        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let mut parser = AtParser::new("p");
            let mut produced = Vec::new();
            let mut rest = input;
            while !rest.is_empty() {
                let take = rng.gen_range(1..=rest.len().min(7));
                let (chunk, tail) = rest.split_at(take);
                produced.extend(
                    parser
                        .feed(chunk)
                        .into_iter()
                        .map(|p| (p.category, p.bytes)),
                );
                rest = tail;
            }
            assert_eq!(produced, reference);
        }
    }

    #[test]
    fn reset_drops_pending_group() {
        let mut parser = AtParser::new("p");
        parser.feed(b"AT\r\npartial");
        parser.reset();
        let packets = parser.feed(b"OK\r\n");
        assert_eq!(&packets[0].bytes[..], b"OK\r\n");
    }
}
