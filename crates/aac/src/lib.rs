//! A crate for reading AAC audio carried in ADTS framing.
//!
//! ADTS (Audio Data Transport Stream) prefixes every raw AAC frame with a
//! small self-describing header. That makes ADTS streams easy to cut at
//! arbitrary points and resume, which is why it is the payload format of
//! choice for audio in MPEG transport streams and for ICY radio streams.
//!
//! `SPDX-License-Identifier: MIT OR Apache-2.0`
#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(unsafe_code)]

mod adts;
mod error;
mod framer;

pub use adts::{AdtsHeader, ADTS_HEADER_LEN, ADTS_HEADER_LEN_WITH_CRC, SAMPLES_PER_RAW_BLOCK};
pub use error::AdtsError;
pub use framer::{AdtsFrame, AdtsFramer};

/// Audio Object Type as signalled by the ADTS profile field
/// ISO/IEC 14496-3:2019(E) - 1.5.1.2.6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AudioObjectType {
    /// AAC main
    AacMain,
    /// AAC LC
    AacLowComplexity,
    /// AAC Scalable Sample Rate
    AacScalableSampleRate,
    /// AAC Long Term Prediction
    AacLongTermPrediction,
}

impl AudioObjectType {
    /// ADTS stores the object type minus one in two bits
    pub const fn from_adts_profile(profile: u8) -> Self {
        match profile & 0x03 {
            0 => AudioObjectType::AacMain,
            1 => AudioObjectType::AacLowComplexity,
            2 => AudioObjectType::AacScalableSampleRate,
            _ => AudioObjectType::AacLongTermPrediction,
        }
    }

    /// Inverse of [`AudioObjectType::from_adts_profile`]
    pub const fn adts_profile(&self) -> u8 {
        match self {
            AudioObjectType::AacMain => 0,
            AudioObjectType::AacLowComplexity => 1,
            AudioObjectType::AacScalableSampleRate => 2,
            AudioObjectType::AacLongTermPrediction => 3,
        }
    }
}

/// Sampling Frequency Index
///
/// The set of commonly used frequencies encoded in 4 bits.
///
/// ISO/IEC 14496-3:2019(E) - 1.6.2.4 (Table 1.22)
#[derive(Debug, Clone, PartialEq, Copy, Eq, PartialOrd, Ord)]
#[repr(u8)]
#[must_use]
pub enum SampleFrequencyIndex {
    /// 96000 Hz
    Freq96000 = 0x0,
    /// 88200 Hz
    Freq88200 = 0x1,
    /// 64000 Hz
    Freq64000 = 0x2,
    /// 48000 Hz
    Freq48000 = 0x3,
    /// 44100 Hz
    Freq44100 = 0x4,
    /// 32000 Hz
    Freq32000 = 0x5,
    /// 24000 Hz
    Freq24000 = 0x6,
    /// 22050 Hz
    Freq22050 = 0x7,
    /// 16000 Hz
    Freq16000 = 0x8,
    /// 12000 Hz
    Freq12000 = 0x9,
    /// 11025 Hz
    Freq11025 = 0xA,
    /// 8000 Hz
    Freq8000 = 0xB,
    /// 7350 Hz
    Freq7350 = 0xC,
}

impl SampleFrequencyIndex {
    /// Map the 4-bit index; reserved and escape values are not valid in ADTS
    pub const fn from_u8(index: u8) -> Option<Self> {
        Some(match index {
            0x0 => SampleFrequencyIndex::Freq96000,
            0x1 => SampleFrequencyIndex::Freq88200,
            0x2 => SampleFrequencyIndex::Freq64000,
            0x3 => SampleFrequencyIndex::Freq48000,
            0x4 => SampleFrequencyIndex::Freq44100,
            0x5 => SampleFrequencyIndex::Freq32000,
            0x6 => SampleFrequencyIndex::Freq24000,
            0x7 => SampleFrequencyIndex::Freq22050,
            0x8 => SampleFrequencyIndex::Freq16000,
            0x9 => SampleFrequencyIndex::Freq12000,
            0xA => SampleFrequencyIndex::Freq11025,
            0xB => SampleFrequencyIndex::Freq8000,
            0xC => SampleFrequencyIndex::Freq7350,
            _ => return None,
        })
    }

    /// Convert the index to the actual frequency in Hz
    pub const fn to_freq(&self) -> u32 {
        match self {
            SampleFrequencyIndex::Freq96000 => 96000,
            SampleFrequencyIndex::Freq88200 => 88200,
            SampleFrequencyIndex::Freq64000 => 64000,
            SampleFrequencyIndex::Freq48000 => 48000,
            SampleFrequencyIndex::Freq44100 => 44100,
            SampleFrequencyIndex::Freq32000 => 32000,
            SampleFrequencyIndex::Freq24000 => 24000,
            SampleFrequencyIndex::Freq22050 => 22050,
            SampleFrequencyIndex::Freq16000 => 16000,
            SampleFrequencyIndex::Freq12000 => 12000,
            SampleFrequencyIndex::Freq11025 => 11025,
            SampleFrequencyIndex::Freq8000 => 8000,
            SampleFrequencyIndex::Freq7350 => 7350,
        }
    }
}
