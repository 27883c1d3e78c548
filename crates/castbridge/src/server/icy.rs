//! In-band ICY metadata.
//!
//! Clients that send `Icy-MetaData: 1` get a metadata block after every
//! `icy-metaint` bytes of audio. A block is one length byte (in units of 16
//! bytes) followed by `StreamTitle='...';` padded with NULs. A lone zero byte
//! means "no change".

use bytes::{BufMut, Bytes, BytesMut};

const BLOCK_UNIT: usize = 16;
const MAX_BLOCK: usize = u8::MAX as usize * BLOCK_UNIT;

/// Encode a metadata block announcing `title`
pub fn metadata_block(title: &str) -> Bytes {
    let mut text = String::from("StreamTitle='");
    // Quotes would end the value early, the longest block caps the rest
    for c in title.chars().filter(|c| *c != '\'' && !c.is_control()) {
        if text.len() + c.len_utf8() + 2 > MAX_BLOCK {
            break;
        }
        text.push(c);
    }
    text.push_str("';");

    let units = text.len().div_ceil(BLOCK_UNIT);
    let mut block = BytesMut::with_capacity(1 + units * BLOCK_UNIT);
    block.put_u8(units as u8);
    block.put_slice(text.as_bytes());
    block.resize(1 + units * BLOCK_UNIT, 0);
    block.freeze()
}

/// Splices metadata blocks into one listener's audio byte stream
#[derive(Debug)]
pub struct MetadataInterleaver {
    interval: usize,
    /// Audio bytes left before the next block is due
    until_block: usize,
    /// Block announcing a title the client has not seen yet
    pending: Option<Bytes>,
}

impl MetadataInterleaver {
    pub fn new(interval: usize) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            until_block: interval,
            pending: None,
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Announce `title` at the next block boundary
    pub fn set_title(&mut self, title: &str) {
        self.pending = Some(metadata_block(title));
    }

    /// Append `audio` to `out` with blocks inserted at every boundary
    pub fn interleave(&mut self, mut audio: &[u8], out: &mut BytesMut) {
        out.reserve(audio.len() + 1);
        while !audio.is_empty() {
            let take = audio.len().min(self.until_block);
            out.put_slice(&audio[..take]);
            audio = &audio[take..];
            self.until_block -= take;

            if self.until_block == 0 {
                match self.pending.take() {
                    Some(block) => out.put_slice(&block),
                    None => out.put_u8(0),
                }
                self.until_block = self.interval;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_block_layout() {
        let block = metadata_block("Foo Fighters - Everlong");
        let text = b"StreamTitle='Foo Fighters - Everlong';";
        assert_eq!(block[0] as usize, text.len().div_ceil(16));
        assert_eq!(block.len(), 1 + block[0] as usize * 16);
        assert_eq!(&block[1..=text.len()], text);
        assert!(block[1 + text.len()..].iter().all(|b| *b == 0));

        let quoted = metadata_block("Guns N' Roses - Patience");
        assert!(quoted.windows(19).any(|w| w == b"Guns N Roses - Pati"));
    }

    #[test]
    fn test_long_titles_are_capped() {
        let block = metadata_block(&"x".repeat(10_000));
        assert_eq!(block[0], u8::MAX);
        assert_eq!(block.len(), 1 + MAX_BLOCK);
        assert!(block.ends_with(b"';"));
    }

    #[test]
    fn test_blocks_at_every_interval() {
        let mut icy = MetadataInterleaver::new(8);
        let mut out = BytesMut::new();
        icy.set_title("A - B");
        icy.interleave(&[1; 5], &mut out);
        assert_eq!(out.len(), 5);

        // Crosses the first boundary, which carries the title
        icy.interleave(&[2; 6], &mut out);
        let block = metadata_block("A - B");
        assert_eq!(&out[..5], &[1; 5]);
        assert_eq!(&out[5..8], &[2; 3]);
        assert_eq!(&out[8..8 + block.len()], &block[..]);
        assert_eq!(&out[8 + block.len()..], &[2; 3]);

        // Nothing new at the next boundary
        out.clear();
        icy.interleave(&[3; 5], &mut out);
        assert_eq!(&out[..], &[3, 3, 3, 3, 3, 0][..]);
        assert_eq!(icy.interval(), 8);
    }
}
