//! Access to the upstream service.
//!
//! The engine only talks to upstream through [`UpstreamProvider`], the HTTP
//! implementation lives in [`http`].

mod crypto;
pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::BridgeError;
use crate::session::{Credentials, Session};

pub use http::HttpProvider;

/// Result of a successful login
#[derive(Clone)]
pub struct AuthGrant {
    /// Upstream session id
    pub token: String,
    /// Login-derived key protecting stream tokens
    pub secret: Vec<u8>,
    /// Lifetime reported by upstream, if any
    pub expires_in: Option<Duration>,
}

impl std::fmt::Debug for AuthGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGrant")
            .field("token", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Where a channel's live playlist and segments are fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLocator {
    pub playlist_url: String,
    /// Base that relative segment and key URIs are resolved against
    pub base_url: String,
    /// Stream token appended to every request
    pub token: String,
}

/// A channel as listed by upstream
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LineupEntry {
    pub number: u32,
    pub key: String,
    pub name: String,
    pub genre: String,
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync + 'static {
    /// Log in, failing with [`BridgeError::CredentialsRejected`] when the
    /// password is wrong
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant, BridgeError>;

    async fn lineup(&self) -> Result<Vec<LineupEntry>, BridgeError>;

    /// Acquire a stream token for a channel
    async fn open_stream(
        &self,
        session: &Session,
        channel_key: &str,
    ) -> Result<StreamLocator, BridgeError>;

    /// Raw media playlist text
    async fn fetch_playlist(&self, locator: &StreamLocator) -> Result<Bytes, BridgeError>;

    async fn fetch_segment(&self, locator: &StreamLocator, uri: &str)
    -> Result<Bytes, BridgeError>;

    async fn fetch_key(&self, locator: &StreamLocator, uri: &str)
    -> Result<[u8; 16], BridgeError>;
}
