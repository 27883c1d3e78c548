//! # Castbridge Engine
//!
//! Bridges an encrypted, session-authenticated HLS radio service to plain
//! ICY/HTTP listeners. Each channel runs a single upstream connection that is
//! shared by every listener tuned to it.
//!
//! ## Components
//!
//! - Session store: one authenticated upstream session per account
//! - Fetcher: polls the live playlist and downloads new segments in order
//! - Pipeline: decrypts segments and demuxes MPEG-TS into ADTS frames
//! - Hub: fans frames out to listeners with bounded per-listener buffers
//! - Lifecycle manager: starts channels on demand, stops them when idle
//! - Server: the HTTP front serving streams and the channel directory

pub mod channel;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod hub;
pub mod lifecycle;
pub mod media;
pub mod pacer;
pub mod pipeline;
pub mod provider;
pub mod server;
pub mod session;

#[cfg(test)]
mod test_util;

pub use config::{
    DEFAULT_PACKET_KEY, EngineConfig, FetcherConfig, HttpClientConfig, HubConfig,
    LifecycleConfig, PipelineConfig, ServerConfig, SessionConfig, UpstreamConfig,
};
pub use error::BridgeError;

pub use channel::{Channel, ChannelInfo, ChannelState};
pub use hub::{BufferCapacity, DetachReason, Hub, Subscription};
pub use lifecycle::ChannelManager;
pub use media::{DecodedFrame, EncryptedPacket, KeyEpoch, NowPlaying};
pub use pipeline::{CipherKind, Pipeline};
pub use provider::{HttpProvider, LineupEntry, UpstreamProvider};
pub use server::StreamServer;
pub use session::{Credentials, SessionStore};

// Re-export downloader utilities
pub use downloader::create_client;
