//! NMEA-0183 sentence framing and the XOR checksum codec.
//!
//! A sentence starts with `$` or `!`, carries comma-separated fields,
//! and ends `*HH` where HH is the XOR of every byte between the lead
//! character (exclusive) and the `*` (exclusive). On the wire it is
//! CR/LF terminated and at most 82 bytes long.

/// Longest framed sentence after CR/LF are stripped.
const MAX_SENTENCE: usize = 80;
/// Shortest line worth checksumming: `$X,*HH`.
const MIN_SENTENCE: usize = 6;
/// Unterminated garbage beyond this is discarded wholesale.
const MAX_PENDING: usize = 4096;

/// XOR checksum over a sentence body.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Frame a payload for the wire: prepend `$` if absent, append
/// `*HH\r\n`.
pub fn encode(payload: &str) -> String {
    let body = payload.strip_prefix('$').unwrap_or(payload);
    format!("${body}*{:02X}\r\n", checksum(body))
}

/// Validate the trailing `*HH` of a framed sentence (no CR/LF).
pub fn checksum_ok(line: &str) -> bool {
    if line.len() < MIN_SENTENCE {
        return false;
    }
    let Some((body, hex)) = line[1..].split_once('*') else {
        return false;
    };
    if hex.len() != 2 {
        return false;
    }
    match u8::from_str_radix(hex, 16) {
        Ok(expected) => checksum(body) == expected,
        Err(_) => false,
    }
}

/// Incremental framer from a non-blocking byte stream to complete,
/// checksum-valid sentences. Malformed lines are silently dropped.
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append raw bytes read from a socket or serial port.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete valid sentence, without CR/LF. `None` means no
    /// full line is buffered yet.
    pub fn next_sentence(&mut self) -> Option<String> {
        loop {
            let Some(nl) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_PENDING {
                    self.buf.clear();
                }
                return None;
            };
            let mut line: Vec<u8> = self.buf.drain(..=nl).collect();
            line.pop(); // LF
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let Ok(line) = std::str::from_utf8(&line) else {
                continue;
            };
            if line.len() < MIN_SENTENCE || line.len() > MAX_SENTENCE {
                continue;
            }
            if !line.starts_with('$') && !line.starts_with('!') {
                continue;
            }
            if !checksum_ok(line) {
                continue;
            }
            return Some(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_xor() {
        assert_eq!(checksum("PYPBS"), 0x48);
        assert_eq!(checksum(""), 0);
    }

    #[test]
    fn encode_frames_payload() {
        assert_eq!(encode("PYPBS"), "$PYPBS*48\r\n");
        // an existing `$` is not doubled
        assert_eq!(encode("$PYPBS"), "$PYPBS*48\r\n");
        let framed = encode("APHDM,182.300,M");
        assert!(framed.starts_with("$APHDM,"));
        assert!(framed.ends_with("\r\n"));
        assert!(checksum_ok(framed.trim_end()));
    }

    #[test]
    fn frames_across_chunks() {
        let mut b = LineBuffer::new();
        b.feed(b"$GPRMC,123519,A,4807.038,N,01131.000,E,");
        assert_eq!(b.next_sentence(), None);
        b.feed(b"022.4,084.4,230394,003.1,W*6A\r\n$PYP");
        assert_eq!(
            b.next_sentence().as_deref(),
            Some("$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A")
        );
        assert_eq!(b.next_sentence(), None);
        b.feed(b"BS*48\r\n");
        assert_eq!(b.next_sentence().as_deref(), Some("$PYPBS*48"));
    }

    #[test]
    fn bad_checksum_dropped() {
        let mut b = LineBuffer::new();
        b.feed(b"$PYPBS*FF\r\n$PYPBS*48\r\n");
        assert_eq!(b.next_sentence().as_deref(), Some("$PYPBS*48"));
        assert_eq!(b.next_sentence(), None);
    }

    #[test]
    fn junk_lines_dropped() {
        let mut b = LineBuffer::new();
        b.feed(b"GPRMC,no,lead,char*00\r\n");
        b.feed(b"$X*00\r\n"); // too short
        b.feed(b"$PY\xffPBS*48\r\n"); // not UTF-8
        assert_eq!(b.next_sentence(), None);
    }

    #[test]
    fn bang_lead_accepted() {
        let body = "AIVDM,1,1,,A,13u?etPv2;0n:dDPwUM1U1Cb069D,0";
        let mut b = LineBuffer::new();
        b.feed(format!("!{body}*{:02X}\r\n", checksum(body)).as_bytes());
        assert_eq!(b.next_sentence(), Some(format!("!{body}*{:02X}", checksum(body))));
    }

    #[test]
    fn oversized_line_dropped() {
        let body = format!("GPGGA,{}", "A".repeat(90));
        let mut b = LineBuffer::new();
        b.feed(encode(&body).as_bytes());
        assert_eq!(b.next_sentence(), None);

        // exactly at the cap still passes
        let body = format!("GPGGA,{}", "A".repeat(70));
        let framed = encode(&body);
        assert_eq!(framed.trim_end().len(), 80);
        b.feed(framed.as_bytes());
        assert!(b.next_sentence().is_some());
    }

    #[test]
    fn bare_lf_terminator_accepted() {
        let mut b = LineBuffer::new();
        b.feed(b"$PYPBS*48\n");
        assert_eq!(b.next_sentence().as_deref(), Some("$PYPBS*48"));
    }

    #[test]
    fn unterminated_backlog_discarded() {
        let mut b = LineBuffer::new();
        b.feed(&vec![b'x'; MAX_PENDING + 1]);
        assert_eq!(b.next_sentence(), None);
        b.feed(b"$PYPBS*48\r\n");
        assert_eq!(b.next_sentence().as_deref(), Some("$PYPBS*48"));
    }
}
