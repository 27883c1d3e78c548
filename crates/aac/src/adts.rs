use crate::{AdtsError, AudioObjectType, SampleFrequencyIndex};

/// Header length when no CRC follows
pub const ADTS_HEADER_LEN: usize = 7;
/// Header length with the 16-bit CRC
pub const ADTS_HEADER_LEN_WITH_CRC: usize = 9;
/// PCM samples per channel decoded from one raw data block
pub const SAMPLES_PER_RAW_BLOCK: u32 = 1024;

/// Fixed and variable ADTS header fields
///
/// ISO/IEC 13818-7 6.2 (adts_fixed_header, adts_variable_header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// `true` for MPEG-2, `false` for MPEG-4
    pub mpeg2: bool,
    /// When `false` a 16-bit CRC follows the header
    pub protection_absent: bool,
    /// Audio object type from the profile bits
    pub object_type: AudioObjectType,
    /// Sampling frequency
    pub sampling_frequency_index: SampleFrequencyIndex,
    /// Channel configuration, 0 means defined in-band
    pub channel_configuration: u8,
    /// Frame length including the header
    pub frame_length: usize,
    /// Decoder buffer fullness, 0x7FF for VBR
    pub buffer_fullness: u16,
    /// Number of raw data blocks minus one
    pub raw_data_blocks: u8,
}

impl AdtsHeader {
    /// Check whether `data` starts with the 12-bit ADTS syncword
    pub fn has_syncword(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0
    }

    /// Parse and validate a header at the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self, AdtsError> {
        if data.len() < ADTS_HEADER_LEN {
            return Err(AdtsError::InsufficientData {
                expected: ADTS_HEADER_LEN,
                actual: data.len(),
            });
        }
        if !Self::has_syncword(data) {
            return Err(AdtsError::MissingSyncword);
        }

        let layer = (data[1] >> 1) & 0x03;
        if layer != 0 {
            return Err(AdtsError::InvalidLayer(layer));
        }

        let sfi = (data[2] >> 2) & 0x0F;
        let sampling_frequency_index = SampleFrequencyIndex::from_u8(sfi)
            .ok_or(AdtsError::InvalidSamplingFrequencyIndex(sfi))?;

        let protection_absent = data[1] & 0x01 == 1;
        let frame_length = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] >> 5) as usize);

        let header = AdtsHeader {
            mpeg2: data[1] & 0x08 != 0,
            protection_absent,
            object_type: AudioObjectType::from_adts_profile(data[2] >> 6),
            sampling_frequency_index,
            channel_configuration: ((data[2] & 0x01) << 2) | (data[3] >> 6),
            frame_length,
            buffer_fullness: (((data[5] & 0x1F) as u16) << 6) | ((data[6] >> 2) as u16),
            raw_data_blocks: data[6] & 0x03,
        };

        if frame_length <= header.header_len() {
            return Err(AdtsError::InvalidFrameLength(frame_length));
        }
        Ok(header)
    }

    /// Length of the header including the CRC when present
    pub fn header_len(&self) -> usize {
        if self.protection_absent {
            ADTS_HEADER_LEN
        } else {
            ADTS_HEADER_LEN_WITH_CRC
        }
    }

    /// Sampling rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sampling_frequency_index.to_freq()
    }

    /// PCM samples per channel carried by the frame
    pub fn samples(&self) -> u32 {
        SAMPLES_PER_RAW_BLOCK * (self.raw_data_blocks as u32 + 1)
    }

    /// Serialize the 7 byte header without CRC
    ///
    /// The CRC itself is never written, so `protection_absent` is always set
    /// in the output.
    pub fn write(&self) -> [u8; ADTS_HEADER_LEN] {
        let len = self.frame_length as u32;
        let fullness = self.buffer_fullness & 0x7FF;
        [
            0xFF,
            0xF1 | if self.mpeg2 { 0x08 } else { 0x00 },
            (self.object_type.adts_profile() << 6)
                | ((self.sampling_frequency_index as u8) << 2)
                | ((self.channel_configuration >> 2) & 0x01),
            ((self.channel_configuration & 0x03) << 6) | ((len >> 11) & 0x03) as u8,
            (len >> 3) as u8,
            (((len & 0x07) as u8) << 5) | (fullness >> 6) as u8,
            (((fullness & 0x3F) as u8) << 2) | (self.raw_data_blocks & 0x03),
        ]
    }
}
