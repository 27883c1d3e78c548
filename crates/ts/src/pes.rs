use bytes::Bytes;

use crate::{Result, TsError};

const START_CODE_PREFIX: [u8; 3] = [0x00, 0x00, 0x01];

/// Fixed part of a PES header: start code, stream id and packet length
const FIXED_HEADER_LEN: usize = 6;

/// Parsed PES packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    /// Bytes following the length field, 0 when unbounded
    pub packet_length: u16,
    /// Presentation timestamp in 90 kHz units
    pub pts: Option<u64>,
    /// Offset of the first payload byte from the start of the PES packet
    pub header_len: usize,
}

impl PesHeader {
    /// Parse the header at the start of a PES packet
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(TsError::InsufficientData {
                expected: FIXED_HEADER_LEN,
                actual: data.len(),
            });
        }
        if data[..3] != START_CODE_PREFIX {
            return Err(TsError::InvalidPesStartCode);
        }

        let stream_id = data[3];
        let packet_length = u16::from_be_bytes([data[4], data[5]]);

        if !has_optional_header(stream_id) {
            return Ok(PesHeader {
                stream_id,
                packet_length,
                pts: None,
                header_len: FIXED_HEADER_LEN,
            });
        }

        if data.len() < FIXED_HEADER_LEN + 3 {
            return Err(TsError::InsufficientData {
                expected: FIXED_HEADER_LEN + 3,
                actual: data.len(),
            });
        }
        if data[6] & 0xC0 != 0x80 {
            return Err(TsError::InvalidPesHeader(format!(
                "marker bits 0x{:02x}",
                data[6] >> 6
            )));
        }

        let pts_dts_flags = data[7] >> 6;
        let header_data_length = data[8] as usize;
        let header_len = FIXED_HEADER_LEN + 3 + header_data_length;
        if data.len() < header_len {
            return Err(TsError::InsufficientData {
                expected: header_len,
                actual: data.len(),
            });
        }

        let pts = if pts_dts_flags & 0x02 != 0 {
            if header_data_length < 5 {
                return Err(TsError::InvalidPesHeader(format!(
                    "PTS flagged but header data is {header_data_length} bytes"
                )));
            }
            Some(decode_timestamp(&data[9..14]))
        } else {
            None
        };

        Ok(PesHeader {
            stream_id,
            packet_length,
            pts,
            header_len,
        })
    }

    /// MPEG audio stream ids (0xC0..=0xDF)
    pub fn is_audio(&self) -> bool {
        (0xC0..=0xDF).contains(&self.stream_id)
    }

    /// Total length of the packet when the length field is set
    pub fn total_len(&self) -> Option<usize> {
        (self.packet_length != 0).then(|| FIXED_HEADER_LEN + self.packet_length as usize)
    }
}

/// Stream ids that carry no optional PES header (ISO/IEC 13818-1 2.4.3.7)
fn has_optional_header(stream_id: u8) -> bool {
    !matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF)
}

fn decode_timestamp(bytes: &[u8]) -> u64 {
    (((bytes[0] as u64 >> 1) & 0x07) << 30)
        | ((bytes[1] as u64) << 22)
        | (((bytes[2] as u64) >> 1) << 15)
        | ((bytes[3] as u64) << 7)
        | ((bytes[4] as u64) >> 1)
}

pub(crate) fn encode_timestamp(pts: u64) -> [u8; 5] {
    [
        0x21 | (((pts >> 29) & 0x0E) as u8),
        (pts >> 22) as u8,
        (((pts >> 14) & 0xFE) as u8) | 0x01,
        (pts >> 7) as u8,
        (((pts << 1) & 0xFE) as u8) | 0x01,
    ]
}

/// A reassembled PES packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesPacket {
    /// PID the packet was carried on
    pub pid: u16,
    pub stream_id: u8,
    pub pts: Option<u64>,
    /// Elementary stream bytes
    pub payload: Bytes,
}

impl PesPacket {
    pub fn is_audio(&self) -> bool {
        (0xC0..=0xDF).contains(&self.stream_id)
    }
}
