// Container demuxing strategies.

use aac::{AdtsFrame, AdtsFramer};
use tracing::debug;
use ts::{SYNC_BYTE, TsDemuxer};

use crate::BridgeError;
use crate::media::NowPlaying;

/// Extracts audio frames from decrypted container bytes.
///
/// Partial units are buffered until the remainder arrives. Any integrity
/// failure in the pushed bytes is reported as `DecodeValidation` and the
/// frames completed by that push are discarded.
pub trait ContainerDemuxer: Send {
    fn push(&mut self, data: &[u8]) -> Result<Vec<AdtsFrame>, BridgeError>;

    /// Drop all buffered container state
    fn reset(&mut self);

    /// Track announced since the last call, for containers that carry one
    fn take_now_playing(&mut self) -> Option<NowPlaying> {
        None
    }

    fn name(&self) -> &'static str;
}

/// MPEG-TS carrying ADTS audio in PES packets
#[derive(Debug, Default)]
pub struct TsAdtsDemuxer {
    ts: TsDemuxer,
    framer: AdtsFramer,
    configured_pid: Option<u16>,
    /// PID in use, fixed to the first audio stream when not configured
    audio_pid: Option<u16>,
    metadata_pid: Option<u16>,
    now_playing: Option<NowPlaying>,
}

impl TsAdtsDemuxer {
    pub fn new(audio_pid: Option<u16>) -> Self {
        Self {
            configured_pid: audio_pid,
            audio_pid,
            ..Default::default()
        }
    }

    /// Also read track metadata from `pid`
    pub fn with_metadata_pid(mut self, pid: Option<u16>) -> Self {
        self.metadata_pid = pid;
        self
    }

    pub fn audio_pid(&self) -> Option<u16> {
        self.audio_pid
    }
}

impl ContainerDemuxer for TsAdtsDemuxer {
    fn push(&mut self, data: &[u8]) -> Result<Vec<AdtsFrame>, BridgeError> {
        if self.ts.pending_len() == 0 && data.first().is_some_and(|b| *b != SYNC_BYTE) {
            return Err(BridgeError::DecodeValidation(format!(
                "Expected TS sync byte, found 0x{:02x}",
                data[0]
            )));
        }

        let mut frames = Vec::new();
        let mut first_error = None;

        for result in self.ts.push(data) {
            let pes = match result {
                Ok(pes) => pes,
                Err(e) => {
                    first_error.get_or_insert_with(|| e.to_string());
                    continue;
                }
            };

            if self.metadata_pid == Some(pes.pid) {
                match NowPlaying::parse(&pes.payload) {
                    Some(track) => self.now_playing = Some(track),
                    None => debug!(pid = pes.pid, bytes = pes.payload.len(), "Unreadable track metadata"),
                }
                continue;
            }

            match self.audio_pid {
                Some(pid) if pid != pes.pid => continue,
                Some(_) => {}
                None if pes.is_audio() => {
                    debug!(pid = pes.pid, stream_id = pes.stream_id, "Using audio stream");
                    self.audio_pid = Some(pes.pid);
                }
                None => continue,
            }

            for frame in self.framer.push(&pes.payload) {
                match frame {
                    Ok(frame) => frames.push(frame),
                    Err(e) => {
                        first_error.get_or_insert_with(|| e.to_string());
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(BridgeError::DecodeValidation(error)),
            None => Ok(frames),
        }
    }

    fn reset(&mut self) {
        self.ts.reset();
        self.framer.reset();
        self.audio_pid = self.configured_pid;
        self.now_playing = None;
    }

    fn take_now_playing(&mut self) -> Option<NowPlaying> {
        self.now_playing.take()
    }

    fn name(&self) -> &'static str {
        "mpegts/adts"
    }
}
