use std::time::Duration;

use crate::BridgeError;
use crate::hub::BufferCapacity;
use crate::pipeline::CipherKind;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Key the upstream uses for per-packet "simple AES"
pub const DEFAULT_PACKET_KEY: &str = "D0DB1CA3B300831A301AF9144FC6986A";

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub upstream: UpstreamConfig,
    pub http: HttpClientConfig,
    pub session: SessionConfig,
    pub fetcher: FetcherConfig,
    pub pipeline: PipelineConfig,
    pub hub: HubConfig,
    pub lifecycle: LifecycleConfig,
    pub server: ServerConfig,
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), BridgeError> {
        self.upstream.packet_key_bytes()?;
        if self.fetcher.live_edge_segments == 0 {
            return Err(BridgeError::Config(
                "live_edge_segments must be at least 1".to_string(),
            ));
        }
        if self.fetcher.packet_buffer == 0 {
            return Err(BridgeError::Config(
                "packet_buffer must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_consecutive_failures == 0 {
            return Err(BridgeError::Config(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.hub.capacity_frames() == 0 {
            return Err(BridgeError::Config(
                "listener buffer must hold at least one frame".to_string(),
            ));
        }
        if self.server.max_request_head == 0 {
            return Err(BridgeError::Config(
                "max_request_head must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}

// --- Upstream Configuration ---
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Player page the service endpoints are discovered from
    pub player_url: String,
    /// Hex encoded AES-128 key for packets without an EXT-X-KEY URI
    pub packet_key: String,
    /// Stream variant path component, e.g. `64k`
    pub variant: String,
    pub hardware_id: String,
    pub ethernet_mac: String,
    pub consumer_type: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            player_url: "https://www.siriusxm.com/legacyplayer/".to_string(),
            packet_key: DEFAULT_PACKET_KEY.to_string(),
            variant: "64k".to_string(),
            hardware_id: "00000000".to_string(),
            ethernet_mac: "0000CAFEBABE".to_string(),
            consumer_type: "ump2".to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn packet_key_bytes(&self) -> Result<[u8; 16], BridgeError> {
        let bytes = hex::decode(&self.packet_key)
            .map_err(|e| BridgeError::Config(format!("packet_key is not hex: {e}")))?;
        bytes.try_into().map_err(|bytes: Vec<u8>| {
            BridgeError::Config(format!(
                "packet_key must be 16 bytes, got {}",
                bytes.len()
            ))
        })
    }
}

// --- HTTP Client Configuration ---
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Overall timeout for a single request
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub follow_redirects: bool,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 5,
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

// --- Session Configuration ---
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime assumed when upstream does not report one
    pub session_ttl: Duration,
    /// Sessions this close to expiry are refreshed before use
    pub refresh_margin: Duration,
    pub max_auth_retries: u32,
    pub auth_retry_delay_base: Duration, // Base for exponential backoff
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(30 * 60),
            refresh_margin: Duration::from_secs(60),
            max_auth_retries: 3,
            auth_retry_delay_base: Duration::from_millis(500),
        }
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Segments taken from the end of the playlist when joining
    pub live_edge_segments: usize,
    /// Minimum interval between playlist refreshes
    pub min_refresh_interval: Duration,
    /// Consecutive failed attempts tolerated before the fetch gives up
    pub max_retries: u32,
    pub retry_delay_base: Duration,
    pub max_retry_delay: Duration,
    /// Packets queued between the fetcher and the pipeline
    pub packet_buffer: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            live_edge_segments: 3,
            min_refresh_interval: Duration::from_secs(1),
            max_retries: 5,
            retry_delay_base: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(5),
            packet_buffer: 4,
        }
    }
}

// --- Pipeline Configuration ---
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cipher: CipherKind,
    /// PID carrying the audio PES, the first audio stream is used when unset
    pub audio_pid: Option<u16>,
    /// PID carrying track metadata
    pub metadata_pid: Option<u16>,
    /// Consecutive validation failures that trigger a resync
    pub max_consecutive_failures: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cipher: CipherKind::default(),
            audio_pid: None,
            metadata_pid: Some(1024),
            max_consecutive_failures: 3,
        }
    }
}

// --- Hub Configuration ---
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listener_buffer: BufferCapacity,
    /// Frame duration used to turn a buffer duration into a frame count
    pub nominal_frame_duration: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listener_buffer: BufferCapacity::Seconds(8.0),
            // 1024 samples at 22.05 kHz, the core rate of HE-AAC at 44.1 kHz
            nominal_frame_duration: Duration::from_micros(46_440),
        }
    }
}

impl HubConfig {
    pub fn capacity_frames(&self) -> usize {
        self.listener_buffer.frames(self.nominal_frame_duration)
    }
}

// --- Lifecycle Configuration ---
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Delay between the last listener leaving and teardown
    pub grace_period: Duration,
    /// How long an attach waits for the first frame
    pub start_timeout: Duration,
    /// Frames released ahead of real time to prime listener players
    pub pacer_lead: Duration,
    /// Lag after which the pacer stops catching up and rebases
    pub pacer_max_lag: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(15),
            start_timeout: Duration::from_secs(30),
            pacer_lead: Duration::from_secs(2),
            pacer_max_lag: Duration::from_secs(5),
        }
    }
}

// --- Server Configuration ---
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Host name advertised in stream URLs and `icy-url`
    pub public_hostname: String,
    pub max_request_head: usize,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    /// Answer streams with `ICY 200 OK` instead of `HTTP/1.0 200 OK`
    pub legacy_icy_status: bool,
    pub icy_bitrate: u32,
    /// Audio bytes between in-band metadata blocks for clients that ask for
    /// them, 0 disables metadata
    pub icy_metaint: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 30000,
            public_hostname: "localhost".to_string(),
            max_request_head: 8 * 1024,
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            legacy_icy_status: true,
            icy_bitrate: 64,
            icy_metaint: 32 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/", self.public_hostname, self.port)
    }
}
