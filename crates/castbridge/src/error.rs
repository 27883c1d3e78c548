use std::sync::Arc;

#[derive(Debug, thiserror::Error, Clone)]
pub enum BridgeError {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Upstream rejected the credentials: {0}")]
    CredentialsRejected(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Stream token rejected (HTTP {status})")]
    TokenRejected { status: u16 },
    #[error("Decode validation failed: {0}")]
    DecodeValidation(String),
    #[error("Listener buffer overflow")]
    ListenerOverflow,
    #[error("Protocol handshake failed: {0}")]
    ProtocolHandshake(String),
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("Channel {channel} failed: {reason}")]
    ChannelFailed { channel: String, reason: String },
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Errors worth another attempt after a backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Network { source } => {
                // 4xx responses will not change on retry
                !source
                    .status()
                    .is_some_and(|status| status.is_client_error())
            }
            BridgeError::Transport(_)
            | BridgeError::Timeout(_)
            | BridgeError::Io { .. }
            | BridgeError::Auth(_)
            | BridgeError::TokenRejected { .. } => true,
            _ => false,
        }
    }
}

// Manual implementation of From<reqwest::Error> for BridgeError
// because of the Arc wrapping.
impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return BridgeError::Timeout(err.to_string());
        }
        BridgeError::Network {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            source: Arc::new(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Transport(format!("Malformed upstream response: {err}"))
    }
}
