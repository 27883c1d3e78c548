use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use memchr::memchr;

use crate::packet::{PID_NULL, SYNC_BYTE, TS_PACKET_SIZE, TsPacket};
use crate::pes::{PesHeader, PesPacket};
use crate::{Result, TsError};

/// A PES packet being collected across TS packets
#[derive(Debug)]
struct PesAssembly {
    header: PesHeader,
    data: BytesMut,
    last_cc: u8,
}

impl PesAssembly {
    fn is_complete(&self) -> bool {
        self.header
            .total_len()
            .is_some_and(|total| self.data.len() >= total)
    }

    fn finish(mut self, pid: u16) -> PesPacket {
        if let Some(total) = self.header.total_len() {
            self.data.truncate(total);
        }
        let payload = self.data.split_off(self.header.header_len.min(self.data.len()));
        PesPacket {
            pid,
            stream_id: self.header.stream_id,
            pts: self.header.pts,
            payload: payload.freeze(),
        }
    }
}

/// Incremental transport stream demuxer.
///
/// Bytes may be pushed in arbitrary chunks; partial TS packets and partial
/// PES packets are kept until the rest arrives. PIDs whose payload does not
/// start with a PES start code (PSI tables) are ignored.
#[derive(Debug, Default)]
pub struct TsDemuxer {
    pending: BytesMut,
    assemblies: HashMap<u16, PesAssembly>,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes that do not form a whole TS packet yet
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed bytes and collect every PES packet completed by them.
    ///
    /// Errors are reported in line with the packets so callers can count
    /// them; the demuxer always resynchronizes and keeps going.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<PesPacket>> {
        self.pending.extend_from_slice(data);
        let mut out = Vec::new();

        while self.pending.len() >= TS_PACKET_SIZE {
            if self.pending[0] != SYNC_BYTE {
                let skipped = memchr(SYNC_BYTE, &self.pending[1..])
                    .map(|pos| pos + 1)
                    .unwrap_or(self.pending.len());
                self.pending.advance(skipped);
                // Anything collected so far can no longer be trusted.
                self.assemblies.clear();
                out.push(Err(TsError::LostSync { skipped }));
                continue;
            }

            let chunk = self.pending.split_to(TS_PACKET_SIZE);
            match TsPacket::parse(&chunk) {
                Ok(packet) => self.on_packet(&packet, &mut out),
                Err(e) => {
                    self.assemblies.clear();
                    out.push(Err(e));
                }
            }
        }

        out
    }

    /// Complete every in-progress PES packet, e.g. at end of stream
    pub fn flush(&mut self) -> Vec<PesPacket> {
        let mut pids: Vec<u16> = self.assemblies.keys().copied().collect();
        pids.sort_unstable();
        pids.into_iter()
            .filter_map(|pid| self.assemblies.remove(&pid).map(|asm| asm.finish(pid)))
            .collect()
    }

    /// Drop all buffered state
    pub fn reset(&mut self) {
        self.pending.clear();
        self.assemblies.clear();
    }

    fn on_packet(&mut self, packet: &TsPacket<'_>, out: &mut Vec<Result<PesPacket>>) {
        let pid = packet.pid;
        if pid == PID_NULL {
            return;
        }
        if packet.transport_error_indicator {
            self.assemblies.remove(&pid);
            out.push(Err(TsError::TransportError(pid)));
            return;
        }
        let Some(payload) = packet.payload else {
            return;
        };

        if packet.payload_unit_start_indicator {
            if !payload.starts_with(&[0x00, 0x00, 0x01]) {
                // PSI section or private data, not ours
                return;
            }
            if let Some(previous) = self.assemblies.remove(&pid) {
                out.push(Ok(previous.finish(pid)));
            }
            match PesHeader::parse(payload) {
                Ok(header) => {
                    let assembly = PesAssembly {
                        header,
                        data: BytesMut::from(payload),
                        last_cc: packet.continuity_counter,
                    };
                    self.complete_or_keep(pid, assembly, out);
                }
                Err(e) => out.push(Err(e)),
            }
            return;
        }

        let Some(mut assembly) = self.assemblies.remove(&pid) else {
            return;
        };

        let expected = (assembly.last_cc + 1) & 0x0F;
        if packet.continuity_counter == assembly.last_cc && !packet.discontinuity_indicator() {
            // Duplicate packet, allowed once by the standard
            self.assemblies.insert(pid, assembly);
            return;
        }
        if packet.continuity_counter != expected && !packet.discontinuity_indicator() {
            out.push(Err(TsError::Continuity {
                pid,
                expected,
                actual: packet.continuity_counter,
            }));
            return;
        }

        assembly.last_cc = packet.continuity_counter;
        assembly.data.extend_from_slice(payload);
        self.complete_or_keep(pid, assembly, out);
    }

    fn complete_or_keep(
        &mut self,
        pid: u16,
        assembly: PesAssembly,
        out: &mut Vec<Result<PesPacket>>,
    ) {
        if assembly.is_complete() {
            out.push(Ok(assembly.finish(pid)));
        } else {
            self.assemblies.insert(pid, assembly);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::packetize_pes;

    const AUDIO_PID: u16 = 0x100;

    fn audio_stream(payloads: &[&[u8]]) -> Vec<u8> {
        let mut cc = 0u8;
        let mut out = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            out.extend(packetize_pes(
                AUDIO_PID,
                0xC0,
                Some(i as u64 * 1920),
                payload,
                &mut cc,
            ));
        }
        out
    }

    fn ok_packets(results: Vec<Result<PesPacket>>) -> Vec<PesPacket> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_bounded_pes_completes_without_next_start() {
        let payload = vec![0x5Au8; 400];
        let stream = audio_stream(&[&payload]);

        let mut demuxer = TsDemuxer::new();
        let packets = ok_packets(demuxer.push(&stream));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pid, AUDIO_PID);
        assert_eq!(packets[0].pts, Some(0));
        assert_eq!(&packets[0].payload[..], &payload[..]);
        assert!(demuxer.flush().is_empty());
    }

    #[test]
    fn test_arbitrary_chunking() {
        let first = vec![1u8; 1000];
        let second = vec![2u8; 10];
        let stream = audio_stream(&[&first, &second]);

        let mut demuxer = TsDemuxer::new();
        let mut packets = Vec::new();
        for chunk in stream.chunks(77) {
            packets.extend(ok_packets(demuxer.push(chunk)));
        }
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0].payload[..], &first[..]);
        assert_eq!(&packets[1].payload[..], &second[..]);
        assert_eq!(packets[1].pts, Some(1920));
        assert_eq!(demuxer.pending_len(), 0);
    }

    #[test]
    fn test_psi_packets_are_ignored() {
        let mut pat = vec![0xFFu8; TS_PACKET_SIZE];
        pat[..8].copy_from_slice(&[0x47, 0x40, 0x00, 0x10, 0x00, 0x00, 0xB0, 0x0D]);

        let mut stream = pat;
        stream.extend(audio_stream(&[&[7u8; 20]]));

        let mut demuxer = TsDemuxer::new();
        let packets = ok_packets(demuxer.push(&stream));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload.len(), 20);
    }

    #[test]
    fn test_garbage_reports_lost_sync_and_recovers() {
        let mut stream = vec![0x11u8; 50];
        stream.extend(audio_stream(&[&[9u8; 300]]));

        let mut demuxer = TsDemuxer::new();
        let results = demuxer.push(&stream);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Err(TsError::LostSync { skipped: 50 }));
        assert_eq!(results[1].as_ref().unwrap().payload.len(), 300);
    }

    #[test]
    fn test_continuity_gap_drops_packet() {
        let stream = audio_stream(&[&[3u8; 500]]);
        // Remove the second of three TS packets
        let mut damaged = stream[..TS_PACKET_SIZE].to_vec();
        damaged.extend_from_slice(&stream[2 * TS_PACKET_SIZE..]);

        let mut demuxer = TsDemuxer::new();
        let results = demuxer.push(&damaged);
        assert_eq!(
            results,
            vec![Err(TsError::Continuity {
                pid: AUDIO_PID,
                expected: 1,
                actual: 2
            })]
        );
        assert!(demuxer.flush().is_empty());
    }

    #[test]
    fn test_duplicate_packet_is_skipped() {
        let stream = audio_stream(&[&[4u8; 500]]);
        let mut duplicated = stream[..2 * TS_PACKET_SIZE].to_vec();
        duplicated.extend_from_slice(&stream[TS_PACKET_SIZE..2 * TS_PACKET_SIZE]);
        duplicated.extend_from_slice(&stream[2 * TS_PACKET_SIZE..]);

        let mut demuxer = TsDemuxer::new();
        let packets = ok_packets(demuxer.push(&duplicated));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload.len(), 500);
    }
}
