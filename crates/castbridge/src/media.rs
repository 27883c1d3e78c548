use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Decryption material valid for a contiguous run of packets.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyEpoch {
    pub id: u64,
    pub key: [u8; 16],
    /// Explicit IV from the key tag, otherwise derived per packet
    pub iv: Option<[u8; 16]>,
    pub issued_at: DateTime<Utc>,
    pub valid_for: Option<Duration>,
}

impl KeyEpoch {
    pub fn new(id: u64, key: [u8; 16], iv: Option<[u8; 16]>) -> Self {
        Self {
            id,
            key,
            iv,
            issued_at: Utc::now(),
            valid_for: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_for
            .and_then(|valid_for| chrono::Duration::from_std(valid_for).ok())
            .is_some_and(|valid_for| now >= self.issued_at + valid_for)
    }
}

impl fmt::Debug for KeyEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEpoch")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("iv", &self.iv.map(hex::encode))
            .field("issued_at", &self.issued_at)
            .field("valid_for", &self.valid_for)
            .finish()
    }
}

/// One encrypted upstream unit (an HLS segment) in arrival order.
#[derive(Debug, Clone)]
pub struct EncryptedPacket {
    pub data: Bytes,
    /// Upstream media sequence number
    pub sequence: u64,
    pub epoch_id: u64,
    /// Set on the first packet produced under a new epoch
    pub epoch_change: Option<Arc<KeyEpoch>>,
}

/// A validated ADTS frame ready for listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// ADTS frame bytes, header included
    pub data: Bytes,
    pub sequence: u64,
    /// Presentation time relative to the start of the channel
    pub pts: Duration,
    pub duration: Duration,
    pub epoch_id: u64,
}

impl DecodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Track announced on the stream's metadata PID
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NowPlaying {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
}

impl NowPlaying {
    /// Parse a metadata PES payload.
    ///
    /// The payload is a run of NUL separated text fields, title first, then
    /// artist and album. Fields without any printable text are skipped.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut fields = payload
            .split(|b| *b == 0)
            .map(|field| {
                String::from_utf8_lossy(field)
                    .chars()
                    .filter(|c| !c.is_control() && *c != char::REPLACEMENT_CHARACTER)
                    .collect::<String>()
                    .trim()
                    .to_string()
            })
            .filter(|field| !field.is_empty());

        let title = fields.next()?;
        let artist = fields.next()?;
        Some(Self {
            artist,
            title,
            album: fields.next(),
        })
    }

    /// `Artist - Title`, as players show it
    pub fn stream_title(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}
