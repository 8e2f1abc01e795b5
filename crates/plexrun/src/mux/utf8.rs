//! Incremental UTF-8 decoding across chunk boundaries.
//!
//! A multi-byte character split between two chunks is withheld until the rest
//! of it arrives, so decoded text never contains a replacement character that
//! the full byte stream would not.

/// Number of trailing bytes of `bytes` that start a character not yet complete.
pub fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    let mut start = len;
    // At most three continuation bytes (10xxxxxx) can follow a lead byte.
    while start > 0 && len - start < 4 {
        start -= 1;
        let b = bytes[start];
        if b & 0b1100_0000 != 0b1000_0000 {
            let expected = match b {
                0x00..=0x7F => 1,
                0xC0..=0xDF => 2,
                0xE0..=0xEF => 3,
                0xF0..=0xF7 => 4,
                _ => return 0,
            };
            let have = len - start;
            return if have < expected { have } else { 0 };
        }
    }
    0
}

#[derive(Debug, Default)]
pub struct Utf8Carry {
    carry: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk` preceded by any carried bytes, carrying an incomplete tail forward.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let tail = incomplete_tail(&buf);
        self.carry = buf.split_off(buf.len() - tail);
        into_string(buf)
    }

    /// Flushes carried bytes. Anything left is malformed and decodes lossily.
    pub fn finish(&mut self) -> String {
        into_string(std::mem::take(&mut self.carry))
    }

    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

fn into_string(buf: Vec<u8>) -> String {
    match String::from_utf8(buf) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "a\u{e9}\u{20ac}\u{1F600}z \u{4e2d}\u{6587}";

    #[test]
    fn test_split_at_every_offset_decodes_identically() {
        let bytes = SAMPLE.as_bytes();
        for split in 0..=bytes.len() {
            let mut carry = Utf8Carry::new();
            let mut text = carry.decode(&bytes[..split]);
            assert!(!text.contains('\u{FFFD}'), "replacement at split {}", split);
            text.push_str(&carry.decode(&bytes[split..]));
            text.push_str(&carry.finish());
            assert_eq!(text, SAMPLE, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut carry = Utf8Carry::new();
        let mut text = String::new();
        for b in SAMPLE.as_bytes() {
            text.push_str(&carry.decode(std::slice::from_ref(b)));
        }
        assert_eq!(carry.pending(), 0);
        assert_eq!(text, SAMPLE);
    }

    #[test]
    fn test_incomplete_tail_lengths() {
        let emoji = "\u{1F600}".as_bytes();
        assert_eq!(incomplete_tail(&emoji[..1]), 1);
        assert_eq!(incomplete_tail(&emoji[..3]), 3);
        assert_eq!(incomplete_tail(emoji), 0);
        assert_eq!(incomplete_tail(b"abc"), 0);
        assert_eq!(incomplete_tail(&[0x80, 0x80, 0x80, 0x80]), 0);
    }

    #[test]
    fn test_dangling_bytes_flush_lossily() {
        let mut carry = Utf8Carry::new();
        assert_eq!(carry.decode(&[b'x', 0xE2, 0x82]), "x");
        assert_eq!(carry.finish(), "\u{FFFD}");
    }
}
