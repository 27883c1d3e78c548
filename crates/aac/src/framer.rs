use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};

use crate::{AdtsError, AdtsHeader, ADTS_HEADER_LEN};

/// One complete ADTS frame, header included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdtsFrame {
    /// Parsed header of the frame
    pub header: AdtsHeader,
    /// Raw frame bytes starting with the syncword
    pub data: Bytes,
}

impl AdtsFrame {
    /// Raw AAC payload after the header and optional CRC
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header.header_len()..]
    }

    /// Playback duration of the frame
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.header.samples() as f64 / self.header.sample_rate() as f64)
    }
}

/// Splits an ADTS byte stream into frames.
///
/// Input may arrive in arbitrary chunks. While locked onto the stream the
/// header's frame length is trusted. After corruption the framer only
/// accepts a candidate header once the bytes right after the announced frame
/// start with another syncword, so a stray `0xFFF` in garbage does not
/// produce a bogus frame.
///
/// Each loss of sync is reported once; the bytes skipped while hunting for
/// the next frame are not reported again.
#[derive(Debug, Default)]
pub struct AdtsFramer {
    buffer: BytesMut,
    locked: bool,
}

impl AdtsFramer {
    /// Create a framer that is not yet locked onto a stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the last frame was read without hunting for sync
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Number of bytes held back waiting for more input
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed bytes and collect the frames completed by them
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<AdtsFrame, AdtsError>> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            if self.buffer.len() < 2 {
                break;
            }
            if !AdtsHeader::has_syncword(&self.buffer) {
                let skipped = find_syncword(&self.buffer, 1).unwrap_or_else(|| {
                    // A trailing 0xFF may be the first half of the next syncword
                    self.buffer.len() - usize::from(self.buffer.last() == Some(&0xFF))
                });
                self.buffer.advance(skipped);
                self.lose_sync(AdtsError::LostSync { skipped }, &mut out);
                continue;
            }
            if self.buffer.len() < ADTS_HEADER_LEN {
                break;
            }

            let header = match AdtsHeader::parse(&self.buffer) {
                Ok(header) => header,
                Err(e) => {
                    self.buffer.advance(1);
                    self.lose_sync(e, &mut out);
                    continue;
                }
            };

            let frame_length = header.frame_length;
            if !self.locked {
                // Confirm the candidate by looking at what follows it
                if self.buffer.len() < frame_length + 2 {
                    break;
                }
                if !AdtsHeader::has_syncword(&self.buffer[frame_length..]) {
                    self.buffer.advance(1);
                    self.lose_sync(AdtsError::FrameBoundaryMismatch { frame_length }, &mut out);
                    continue;
                }
            } else if self.buffer.len() < frame_length {
                break;
            }

            self.locked = true;
            out.push(Ok(AdtsFrame {
                header,
                data: self.buffer.split_to(frame_length).freeze(),
            }));
        }

        out
    }

    /// Emit a complete frame still waiting for boundary confirmation and
    /// discard everything else
    pub fn flush(&mut self) -> Option<AdtsFrame> {
        let frame = AdtsHeader::parse(&self.buffer)
            .ok()
            .filter(|header| self.buffer.len() >= header.frame_length)
            .map(|header| AdtsFrame {
                header,
                data: self.buffer.split_to(header.frame_length).freeze(),
            });
        self.reset();
        frame
    }

    /// Drop buffered bytes and unlock
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.locked = false;
    }

    fn lose_sync(&mut self, error: AdtsError, out: &mut Vec<Result<AdtsFrame, AdtsError>>) {
        if self.locked {
            out.push(Err(error));
        }
        self.locked = false;
    }
}

fn find_syncword(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] & 0xF0 == 0xF0)
        .map(|pos| pos + from)
}
