use thiserror::Error;

/// Errors that can occur during TS parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TsError {
    #[error("Invalid packet size: expected 188 bytes, got {0}")]
    InvalidPacketSize(usize),

    #[error("Invalid sync byte: expected 0x47, got 0x{0:02x}")]
    InvalidSyncByte(u8),

    #[error("Lost sync, skipped {skipped} bytes looking for the next packet")]
    LostSync { skipped: usize },

    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Invalid adaptation field length: {0}")]
    InvalidAdaptationField(usize),

    #[error("Transport error indicator set on PID {0}")]
    TransportError(u16),

    #[error("Continuity error on PID {pid}: expected {expected}, got {actual}")]
    Continuity { pid: u16, expected: u8, actual: u8 },

    #[error("Invalid PES start code prefix")]
    InvalidPesStartCode,

    #[error("Invalid PES header: {0}")]
    InvalidPesHeader(String),
}
