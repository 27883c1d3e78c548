//! Incremental MPEG transport stream (TS) handling
//!
//! This crate parses 188-byte TS packets, reassembles PES packets across
//! packet and buffer boundaries, and packetizes PES payloads back into TS.
//! It is built for live sources where data arrives in arbitrary chunks and a
//! single corrupt packet must not poison the rest of the stream.

pub mod demux;
pub mod error;
pub mod mux;
pub mod packet;
pub mod pes;

pub use demux::TsDemuxer;
pub use error::TsError;
pub use mux::packetize_pes;
pub use packet::{PID_NULL, PID_PAT, SYNC_BYTE, TS_PACKET_SIZE, TsPacket};
pub use pes::{PesHeader, PesPacket};

/// Result type for TS parsing operations
pub type Result<T> = std::result::Result<T, TsError>;
