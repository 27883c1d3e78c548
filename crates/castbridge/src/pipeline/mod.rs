//! # Decrypt/Demux Pipeline
//!
//! Turns the fetcher's encrypted packets into validated ADTS frames. The
//! pipeline is a plain synchronous state machine owned by the channel task:
//! decryption and container handling are swappable strategies
//! ([`PacketCipher`], [`ContainerDemuxer`]) and the key epoch bookkeeping is
//! an explicit [`EpochState`].
//!
//! Sequence numbers and presentation timestamps of the emitted frames are
//! assigned here, so listeners never see gaps even when upstream units are
//! dropped, retransmitted or resynchronized.

mod cipher;
mod demux;
mod state;

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::media::{DecodedFrame, EncryptedPacket, NowPlaying};
use crate::{BridgeError, PipelineConfig};

pub use cipher::{
    CipherError, CipherKind, PacketCipher, Plaintext, PrefixedIvAes128Cbc, SequenceIvAes128Cbc,
};
pub use demux::{ContainerDemuxer, TsAdtsDemuxer};
pub use state::EpochState;

/// Result of processing one packet
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub frames: Vec<DecodedFrame>,
    /// The transport must be restarted and a fresh epoch announced
    pub resync: bool,
    /// Set when the stream announced a different track
    pub now_playing: Option<NowPlaying>,
}

pub struct Pipeline {
    channel_id: String,
    cipher: Box<dyn PacketCipher>,
    demuxer: Box<dyn ContainerDemuxer>,
    max_consecutive_failures: u32,
    state: EpochState,
    /// Epoch and upstream sequence of the last packet taken in
    last_packet: Option<(u64, u64)>,
    next_sequence: u64,
    position: Duration,
    now_playing: Option<NowPlaying>,
}

impl Pipeline {
    pub fn new(channel_id: impl Into<String>, config: &PipelineConfig) -> Self {
        Self::with_parts(
            channel_id,
            config.cipher.build(),
            Box::new(TsAdtsDemuxer::new(config.audio_pid).with_metadata_pid(config.metadata_pid)),
            config.max_consecutive_failures,
        )
    }

    pub fn with_parts(
        channel_id: impl Into<String>,
        cipher: Box<dyn PacketCipher>,
        demuxer: Box<dyn ContainerDemuxer>,
        max_consecutive_failures: u32,
    ) -> Self {
        let channel_id = channel_id.into();
        debug!(
            channel = %channel_id,
            cipher = cipher.name(),
            container = demuxer.name(),
            "Pipeline created"
        );
        Self {
            channel_id,
            cipher,
            demuxer,
            max_consecutive_failures: max_consecutive_failures.max(1),
            state: EpochState::AwaitingEpoch,
            last_packet: None,
            next_sequence: 0,
            position: Duration::ZERO,
            now_playing: None,
        }
    }

    pub fn state(&self) -> &EpochState {
        &self.state
    }

    /// Sequence number the next emitted frame will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn process(&mut self, packet: EncryptedPacket) -> PipelineOutput {
        if let Some(announced) = &packet.epoch_change {
            if self.state.accepts(announced) {
                info!(
                    channel = %self.channel_id,
                    epoch = announced.id,
                    previous = ?self.state.epoch_id(),
                    "Switching key epoch"
                );
                self.state = EpochState::Active {
                    epoch: announced.clone(),
                    consecutive_failures: 0,
                };
            } else {
                debug!(
                    channel = %self.channel_id,
                    epoch = announced.id,
                    "Ignoring stale epoch announcement"
                );
            }
        }

        let epoch = match &self.state {
            EpochState::Active { epoch, .. } => epoch.clone(),
            state => {
                debug!(
                    channel = %self.channel_id,
                    sequence = packet.sequence,
                    state = state.name(),
                    "Dropping packet without usable key epoch"
                );
                return PipelineOutput::default();
            }
        };

        if packet.epoch_id != epoch.id {
            debug!(
                channel = %self.channel_id,
                sequence = packet.sequence,
                packet_epoch = packet.epoch_id,
                epoch = epoch.id,
                "Dropping packet from another epoch"
            );
            return PipelineOutput::default();
        }
        if let Some((last_epoch, last_sequence)) = self.last_packet {
            if last_epoch == epoch.id && packet.sequence <= last_sequence {
                debug!(
                    channel = %self.channel_id,
                    sequence = packet.sequence,
                    last_sequence,
                    "Dropping retransmitted packet"
                );
                return PipelineOutput::default();
            }
        }
        self.last_packet = Some((epoch.id, packet.sequence));

        if epoch.is_expired_at(Utc::now()) {
            warn!(channel = %self.channel_id, epoch = epoch.id, "Key epoch expired");
            return self.enter_resync(epoch.id);
        }

        let result = self
            .cipher
            .decrypt(&epoch, &packet)
            .map_err(BridgeError::from)
            .and_then(|plain| self.demuxer.push(&plain));

        match result {
            Ok(frames) => {
                if let EpochState::Active {
                    consecutive_failures,
                    ..
                } = &mut self.state
                {
                    *consecutive_failures = 0;
                }
                let frames = frames
                    .into_iter()
                    .map(|frame| {
                        let duration = frame.duration();
                        let decoded = DecodedFrame {
                            data: frame.data,
                            sequence: self.next_sequence,
                            pts: self.position,
                            duration,
                            epoch_id: epoch.id,
                        };
                        self.next_sequence += 1;
                        self.position += duration;
                        decoded
                    })
                    .collect();
                PipelineOutput {
                    frames,
                    resync: false,
                    now_playing: self.track_change(),
                }
            }
            Err(e) => {
                // Partial container state around a bad unit cannot be trusted
                self.demuxer.reset();
                let failures = match &mut self.state {
                    EpochState::Active {
                        consecutive_failures,
                        ..
                    } => {
                        *consecutive_failures += 1;
                        *consecutive_failures
                    }
                    _ => 0,
                };
                warn!(
                    channel = %self.channel_id,
                    sequence = packet.sequence,
                    failures,
                    "Dropping packet that failed validation: {e}"
                );
                if failures >= self.max_consecutive_failures {
                    self.enter_resync(epoch.id)
                } else {
                    PipelineOutput::default()
                }
            }
        }
    }

    fn track_change(&mut self) -> Option<NowPlaying> {
        let track = self.demuxer.take_now_playing()?;
        if self.now_playing.as_ref() == Some(&track) {
            return None;
        }
        info!(channel = %self.channel_id, track = %track.stream_title(), "Now playing");
        self.now_playing = Some(track.clone());
        Some(track)
    }

    fn enter_resync(&mut self, last_epoch_id: u64) -> PipelineOutput {
        warn!(
            channel = %self.channel_id,
            epoch = last_epoch_id,
            "Pipeline lost the stream, requesting resync"
        );
        self.demuxer.reset();
        self.state = EpochState::Resyncing { last_epoch_id };
        PipelineOutput {
            resync: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::media::KeyEpoch;
    use crate::test_util::{
        PACKET_KEY, adts_frame, encrypt_prefixed, encrypted_segment, encrypted_segment_with_track,
    };

    fn packet(
        data: Bytes,
        sequence: u64,
        epoch_id: u64,
        announce: bool,
    ) -> EncryptedPacket {
        EncryptedPacket {
            data,
            sequence,
            epoch_id,
            epoch_change: announce.then(|| Arc::new(KeyEpoch::new(epoch_id, PACKET_KEY, None))),
        }
    }

    /// Decrypts fine but is not a transport stream
    fn corrupt() -> Bytes {
        encrypt_prefixed(&PACKET_KEY, [9; 16], &[0x12; 300])
    }

    fn pipeline() -> Pipeline {
        Pipeline::new("20", &PipelineConfig::default())
    }

    fn sequences(output: &PipelineOutput) -> Vec<u64> {
        output.frames.iter().map(|f| f.sequence).collect()
    }

    #[test]
    fn test_waits_for_epoch() {
        let mut pipeline = pipeline();
        let output = pipeline.process(packet(encrypted_segment(&[1, 2]), 100, 1, false));
        assert!(output.frames.is_empty());
        assert!(matches!(pipeline.state(), EpochState::AwaitingEpoch));

        let output = pipeline.process(packet(encrypted_segment(&[1, 2]), 101, 1, true));
        assert_eq!(sequences(&output), vec![0, 1]);
        assert_eq!(pipeline.state().epoch_id(), Some(1));
    }

    #[test]
    fn test_frames_carry_sequence_and_timing() {
        let mut pipeline = pipeline();
        let first = pipeline.process(packet(encrypted_segment(&[1, 2, 3]), 100, 1, true));
        let second = pipeline.process(packet(encrypted_segment(&[4, 5]), 101, 1, false));

        assert_eq!(sequences(&first), vec![0, 1, 2]);
        assert_eq!(sequences(&second), vec![3, 4]);
        assert_eq!(&second.frames[0].data[..], &adts_frame(4)[..]);

        // 1024 samples at 48 kHz
        let frame = Duration::from_secs_f64(1024.0 / 48_000.0);
        assert_eq!(first.frames[0].pts, Duration::ZERO);
        assert_eq!(first.frames[1].pts, frame);
        assert_eq!(second.frames[1].pts, frame * 4);
        assert!(second.frames.iter().all(|f| f.epoch_id == 1));
    }

    #[test]
    fn test_retransmission_is_dropped() {
        let mut pipeline = pipeline();
        pipeline.process(packet(encrypted_segment(&[1, 2]), 100, 1, true));
        let repeat = pipeline.process(packet(encrypted_segment(&[1, 2]), 100, 1, false));
        assert!(repeat.frames.is_empty());
        let older = pipeline.process(packet(encrypted_segment(&[1, 2]), 99, 1, false));
        assert!(older.frames.is_empty());

        let next = pipeline.process(packet(encrypted_segment(&[3]), 101, 1, false));
        assert_eq!(sequences(&next), vec![2]);
    }

    #[test]
    fn test_single_failure_is_skipped() {
        let mut pipeline = pipeline();
        pipeline.process(packet(encrypted_segment(&[1, 2]), 100, 1, true));

        let bad = pipeline.process(packet(corrupt(), 101, 1, false));
        assert!(bad.frames.is_empty());
        assert!(!bad.resync);

        // Container state was reset, the framer confirms the first frame again
        let good = pipeline.process(packet(encrypted_segment(&[3, 4]), 102, 1, false));
        assert_eq!(sequences(&good), vec![2, 3]);
        assert!(matches!(
            pipeline.state(),
            EpochState::Active {
                consecutive_failures: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_consecutive_failures_trigger_resync() {
        let mut pipeline = pipeline();
        let first = pipeline.process(packet(encrypted_segment(&[1, 2, 3]), 100, 1, true));
        assert_eq!(first.frames.len(), 3);

        assert!(!pipeline.process(packet(corrupt(), 101, 1, false)).resync);
        assert!(!pipeline.process(packet(corrupt(), 102, 1, false)).resync);
        let third = pipeline.process(packet(corrupt(), 103, 1, false));
        assert!(third.resync);
        assert!(matches!(
            pipeline.state(),
            EpochState::Resyncing { last_epoch_id: 1 }
        ));

        // Packets still in flight under the old epoch are dropped
        let stale = pipeline.process(packet(encrypted_segment(&[4, 5]), 104, 1, false));
        assert!(stale.frames.is_empty());
        assert!(!stale.resync);

        let resumed = pipeline.process(packet(encrypted_segment(&[6, 7]), 105, 2, true));
        assert_eq!(sequences(&resumed), vec![3, 4]);
        assert_eq!(resumed.frames[0].epoch_id, 2);
    }

    #[test]
    fn test_wrong_key_counts_as_failure() {
        let mut pipeline = pipeline();
        let wrong = EncryptedPacket {
            data: encrypt_prefixed(&[0x33; 16], [1; 16], &[0x47; 188]),
            sequence: 1,
            epoch_id: 1,
            epoch_change: Some(Arc::new(KeyEpoch::new(1, PACKET_KEY, None))),
        };
        assert!(pipeline.process(wrong).frames.is_empty());
        assert!(matches!(
            pipeline.state(),
            EpochState::Active {
                consecutive_failures: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_track_changes_are_reported_once() {
        let mut pipeline = pipeline();
        let first = pipeline.process(packet(
            encrypted_segment_with_track(&[1, 2], "Everlong", "Foo Fighters"),
            100,
            1,
            true,
        ));
        assert_eq!(first.frames.len(), 2);
        assert_eq!(
            first.now_playing.map(|track| track.stream_title()).as_deref(),
            Some("Foo Fighters - Everlong")
        );

        let repeat = pipeline.process(packet(
            encrypted_segment_with_track(&[3], "Everlong", "Foo Fighters"),
            101,
            1,
            false,
        ));
        assert!(repeat.now_playing.is_none());

        let next = pipeline.process(packet(
            encrypted_segment_with_track(&[4], "Monkey Wrench", "Foo Fighters"),
            102,
            1,
            false,
        ));
        assert_eq!(next.now_playing.unwrap().title, "Monkey Wrench");
    }

    #[test]
    fn test_stale_announcement_while_active_is_ignored() {
        let mut pipeline = pipeline();
        pipeline.process(packet(encrypted_segment(&[1, 2]), 100, 2, true));
        assert_eq!(pipeline.state().epoch_id(), Some(2));

        let stale = pipeline.process(packet(encrypted_segment(&[2]), 101, 1, true));
        assert!(stale.frames.is_empty());
        assert_eq!(pipeline.state().epoch_id(), Some(2));

        let current = pipeline.process(packet(encrypted_segment(&[3]), 102, 2, false));
        assert_eq!(current.frames.len(), 1);
    }

    #[test]
    fn test_expired_epoch_requests_resync() {
        let mut pipeline = pipeline();
        let mut epoch = KeyEpoch::new(1, PACKET_KEY, None);
        epoch.issued_at = Utc::now() - chrono::Duration::hours(1);
        epoch.valid_for = Some(Duration::from_secs(60));
        let output = pipeline.process(EncryptedPacket {
            data: encrypted_segment(&[1]),
            sequence: 1,
            epoch_id: 1,
            epoch_change: Some(Arc::new(epoch)),
        });
        assert!(output.resync);
    }
}
