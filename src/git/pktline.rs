//! Git packet-line framing.
//!
//! The smart HTTP wire protocol frames every record as a 4-hex-digit length
//! (which includes the four prefix bytes themselves) followed by the payload;
//! a length of `0000` is a flush marker. This module emits that framing for
//! the info/refs advertisement header and walks it when sniffing upload-pack
//! request bodies for shallow-clone intent.

use bytes::BytesMut;

/// How much of an upload-pack request body is inspected for a `deepen`
/// directive before the stream is handed to the subprocess.
pub const SNIFF_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Append `payload` to `buf` as a single packet-line.
///
/// The encoded length is `payload.len() + 4`; it must fit in four hex digits.
/// Handing in a longer payload is a programmer error, not a runtime
/// condition, hence the assert.
pub fn pkt_line(buf: &mut BytesMut, payload: &[u8]) {
    let total = payload.len() + 4;
    assert!(total <= 0xffff, "packet-line payload too large ({total} bytes)");
    buf.extend_from_slice(format!("{total:04x}").as_bytes());
    buf.extend_from_slice(payload);
}

/// Append the flush packet (`0000`) to `buf`.
pub fn pkt_flush(buf: &mut BytesMut) {
    buf.extend_from_slice(b"0000");
}

// ---------------------------------------------------------------------------
// Shallow-clone sniffing
// ---------------------------------------------------------------------------

/// Scan a prefix of an upload-pack request body for a `deepen` directive.
///
/// Walks packet-line frames: a flush packet ends the scan (the negotiation
/// section a `deepen` line can appear in is flush-terminated), and a
/// truncated or malformed frame ends it too -- the sniff is a best-effort
/// hint, so garbage input simply means "no shallow clone detected". The
/// caller replays `data` into the subprocess afterwards; nothing here
/// consumes the underlying stream.
pub fn scan_deepen(data: &[u8]) -> bool {
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let len = match std::str::from_utf8(&data[pos..pos + 4])
            .ok()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
        {
            Some(len) => len,
            None => return false,
        };
        if len == 0 {
            // Flush packet: end of the request section we care about.
            return false;
        }
        if len < 4 || pos + len > data.len() {
            return false;
        }
        if data[pos + 4..pos + len].starts_with(b"deepen") {
            return true;
        }
        pos += len;
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn line(payload: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        pkt_line(&mut buf, payload.as_bytes());
        buf.to_vec()
    }

    #[test]
    fn pkt_line_encodes_length_prefix() {
        assert_eq!(line("# service=git-upload-pack\n"),
            b"001e# service=git-upload-pack\n");
    }

    #[test]
    fn pkt_line_empty_payload() {
        assert_eq!(line(""), b"0004");
    }

    #[test]
    fn pkt_flush_is_four_zeroes() {
        let mut buf = BytesMut::new();
        pkt_flush(&mut buf);
        assert_eq!(&buf[..], b"0000");
    }

    #[test]
    #[should_panic(expected = "packet-line payload too large")]
    fn pkt_line_oversized_payload_panics() {
        let mut buf = BytesMut::new();
        pkt_line(&mut buf, &vec![b'x'; 0x10000]);
    }

    #[test]
    fn scan_finds_deepen() {
        let mut body = line("want 0123456789012345678901234567890123456789\n");
        body.extend_from_slice(&line("deepen 1\n"));
        body.extend_from_slice(b"0000");
        assert!(scan_deepen(&body));
    }

    #[test]
    fn scan_without_deepen() {
        let mut body = line("want 0123456789012345678901234567890123456789\n");
        body.extend_from_slice(b"0000");
        assert!(!scan_deepen(&body));
    }

    #[test]
    fn scan_stops_at_flush() {
        // A deepen after the flush is outside the negotiation section.
        let mut body = line("want 0123456789012345678901234567890123456789\n");
        body.extend_from_slice(b"0000");
        body.extend_from_slice(&line("deepen 1\n"));
        assert!(!scan_deepen(&body));
    }

    #[test]
    fn scan_truncated_frame_is_false() {
        // Declares 0x30 bytes but the body ends early.
        assert!(!scan_deepen(b"0030want 1234"));
    }

    #[test]
    fn scan_malformed_length_is_false() {
        assert!(!scan_deepen(b"zzzzdeepen 1\n"));
        assert!(!scan_deepen(b"0002"));
    }

    #[test]
    fn scan_empty_input() {
        assert!(!scan_deepen(b""));
        assert!(!scan_deepen(b"001"));
    }

    #[test]
    fn scan_boundary_sized_bodies() {
        // Bodies of exactly 4095 and 4096 bytes, deepen directive within.
        for target in [SNIFF_LEN - 1, SNIFF_LEN] {
            let mut body = line("deepen 1\n");
            let padding = target - body.len();
            body.extend_from_slice(&line(&"x".repeat(padding - 4)));
            assert_eq!(body.len(), target);
            assert!(scan_deepen(&body));
        }
    }
}
