use thiserror::Error;

/// Errors raised while reading ADTS data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdtsError {
    /// Fewer bytes than a header needs
    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// The 12-bit syncword is missing
    #[error("Missing ADTS syncword")]
    MissingSyncword,

    /// The layer field must always be zero
    #[error("Invalid ADTS layer: {0}")]
    InvalidLayer(u8),

    /// Reserved or escape sampling frequency index
    #[error("Invalid sampling frequency index: {0}")]
    InvalidSamplingFrequencyIndex(u8),

    /// Frame length shorter than its own header
    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(usize),

    /// The bytes after a frame do not start a new frame
    #[error("Frame of {frame_length} bytes is not followed by a syncword")]
    FrameBoundaryMismatch {
        /// Length announced by the rejected header
        frame_length: usize,
    },

    /// Garbage was skipped while looking for the next frame
    #[error("Lost sync, skipped {skipped} bytes")]
    LostSync {
        /// Number of bytes discarded
        skipped: usize,
    },
}
