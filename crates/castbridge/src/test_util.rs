//! In-memory upstream and stream fixtures for tests.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aac::{AdtsHeader, AudioObjectType, SampleFrequencyIndex};
use async_trait::async_trait;
use bytes::Bytes;
use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use parking_lot::Mutex;

use crate::BridgeError;
use crate::provider::{AuthGrant, LineupEntry, StreamLocator, UpstreamProvider};
use crate::session::{Credentials, Session};

pub(crate) const AUDIO_PID: u16 = 0x300;
pub(crate) const METADATA_PID: u16 = 0x400;
pub(crate) const PACKET_KEY: [u8; 16] = [
    0xD0, 0xDB, 0x1C, 0xA3, 0xB3, 0x00, 0x83, 0x1A, 0x30, 0x1A, 0xF9, 0x14, 0x4F, 0xC6, 0x98, 0x6A,
];
pub(crate) const FRAME_PAYLOAD: usize = 40;

/// One ADTS frame at 48 kHz whose payload is `fill` repeated
pub(crate) fn adts_frame(fill: u8) -> Vec<u8> {
    let header = AdtsHeader {
        mpeg2: false,
        protection_absent: true,
        object_type: AudioObjectType::AacLowComplexity,
        sampling_frequency_index: SampleFrequencyIndex::Freq48000,
        channel_configuration: 2,
        frame_length: aac::ADTS_HEADER_LEN + FRAME_PAYLOAD,
        buffer_fullness: 0x7FF,
        raw_data_blocks: 0,
    };
    let mut frame = header.write().to_vec();
    frame.resize(aac::ADTS_HEADER_LEN + FRAME_PAYLOAD, fill);
    frame
}

/// Transport stream with one audio PES per frame
pub(crate) fn ts_segment(fills: &[u8]) -> Vec<u8> {
    let mut cc = 0;
    let mut out = Vec::new();
    for (i, fill) in fills.iter().enumerate() {
        out.extend(ts::packetize_pes(
            AUDIO_PID,
            0xC0,
            Some(i as u64 * 1920),
            &adts_frame(*fill),
            &mut cc,
        ));
    }
    out
}

/// Transport stream announcing a track on the metadata PID ahead of the audio
pub(crate) fn ts_segment_with_track(fills: &[u8], title: &str, artist: &str) -> Vec<u8> {
    let mut payload = vec![0x01, 0x00];
    payload.extend_from_slice(title.as_bytes());
    payload.push(0);
    payload.extend_from_slice(artist.as_bytes());
    payload.extend_from_slice(b"\0Greatest Hits\0");

    let mut cc = 0;
    let mut out = ts::packetize_pes(METADATA_PID, 0xBD, None, &payload, &mut cc);
    out.extend(ts_segment(fills));
    out
}

/// `iv || AES-128-CBC(key, iv, data)` with PKCS#7 padding
pub(crate) fn encrypt_prefixed(key: &[u8; 16], iv: [u8; 16], data: &[u8]) -> Bytes {
    let mut buffer = data.to_vec();
    buffer.resize(data.len() + 16 - data.len() % 16, 0);
    let encrypted = cbc::Encryptor::<aes::Aes128>::new_from_slices(key, &iv)
        .expect("16 byte key and iv")
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, data.len())
        .expect("buffer has room for padding")
        .to_vec();

    let mut out = iv.to_vec();
    out.extend(encrypted);
    Bytes::from(out)
}

/// Encrypted upstream segment carrying one frame per fill byte
pub(crate) fn encrypted_segment(fills: &[u8]) -> Bytes {
    let iv = [fills.first().copied().unwrap_or(0); 16];
    encrypt_prefixed(&PACKET_KEY, iv, &ts_segment(fills))
}

pub(crate) fn encrypted_segment_with_track(fills: &[u8], title: &str, artist: &str) -> Bytes {
    let iv = [fills.first().copied().unwrap_or(0); 16];
    encrypt_prefixed(&PACKET_KEY, iv, &ts_segment_with_track(fills, title, artist))
}

struct MockSegment {
    sequence: u64,
    uri: String,
    data: Bytes,
    key: Option<String>,
}

struct MockFeed {
    segments: Vec<MockSegment>,
    next_sequence: u64,
    window: usize,
    target_duration: u64,
    key_uri: Option<String>,
    playlist_failures: u32,
    token_rejections: u32,
    segment_failures: u32,
    playlist_fetches: usize,
}

impl MockFeed {
    fn new() -> Self {
        Self {
            segments: Vec::new(),
            next_sequence: 100,
            window: 6,
            target_duration: 10,
            key_uri: None,
            playlist_failures: 0,
            token_rejections: 0,
            segment_failures: 0,
            playlist_fetches: 0,
        }
    }

    fn render(&self) -> String {
        let visible = &self.segments[self.segments.len().saturating_sub(self.window)..];
        let first = visible
            .first()
            .map(|s| s.sequence)
            .unwrap_or(self.next_sequence);

        let mut out = String::new();
        let _ = writeln!(out, "#EXTM3U");
        let _ = writeln!(out, "#EXT-X-VERSION:3");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration);
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{first}");
        let mut current_key: Option<&str> = None;
        for segment in visible {
            if segment.key.as_deref() != current_key {
                match &segment.key {
                    Some(uri) => {
                        let _ = writeln!(out, "#EXT-X-KEY:METHOD=AES-128,URI=\"{uri}\"");
                    }
                    None => {
                        let _ = writeln!(out, "#EXT-X-KEY:METHOD=NONE");
                    }
                }
                current_key = segment.key.as_deref();
            }
            let _ = writeln!(out, "#EXTINF:{}.0,", self.target_duration);
            let _ = writeln!(out, "{}", segment.uri);
        }
        out
    }
}

#[derive(Default)]
struct MockState {
    login_failures: u32,
    reject_credentials: bool,
    session_rejections: u32,
    feeds: HashMap<String, MockFeed>,
    keys: HashMap<String, [u8; 16]>,
}

/// Scriptable in-memory upstream
#[derive(Default)]
pub(crate) struct MockProvider {
    logins: AtomicUsize,
    opens: AtomicUsize,
    segment_fetches: AtomicUsize,
    session_lifetime: Option<Duration>,
    state: Mutex<MockState>,
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime = Some(lifetime);
        self
    }

    pub(crate) fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn segment_fetches(&self) -> usize {
        self.segment_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn playlist_fetches(&self, channel_key: &str) -> usize {
        self.state
            .lock()
            .feeds
            .get(channel_key)
            .map_or(0, |feed| feed.playlist_fetches)
    }

    pub(crate) fn fail_logins(&self, count: u32) {
        self.state.lock().login_failures = count;
    }

    pub(crate) fn reject_credentials(&self, reject: bool) {
        self.state.lock().reject_credentials = reject;
    }

    /// The next `count` stream opens report a dead session
    pub(crate) fn reject_sessions(&self, count: u32) {
        self.state.lock().session_rejections = count;
    }

    fn with_feed<R>(&self, channel_key: &str, f: impl FnOnce(&mut MockFeed) -> R) -> R {
        let mut state = self.state.lock();
        let feed = state
            .feeds
            .entry(channel_key.to_string())
            .or_insert_with(MockFeed::new);
        f(feed)
    }

    /// Publish a segment at the live edge, returns its media sequence
    pub(crate) fn push_segment(&self, channel_key: &str, data: Bytes) -> u64 {
        self.with_feed(channel_key, |feed| {
            let sequence = feed.next_sequence;
            feed.next_sequence += 1;
            feed.segments.push(MockSegment {
                sequence,
                uri: format!("seg{sequence}.aac"),
                data,
                key: feed.key_uri.clone(),
            });
            sequence
        })
    }

    /// Segments pushed from now on are announced under `uri`
    pub(crate) fn rotate_key(&self, channel_key: &str, uri: Option<&str>, key: [u8; 16]) {
        if let Some(uri) = uri {
            self.state.lock().keys.insert(uri.to_string(), key);
        }
        self.with_feed(channel_key, |feed| feed.key_uri = uri.map(str::to_string));
    }

    pub(crate) fn set_window(&self, channel_key: &str, window: usize) {
        self.with_feed(channel_key, |feed| feed.window = window);
    }

    pub(crate) fn fail_playlists(&self, channel_key: &str, count: u32) {
        self.with_feed(channel_key, |feed| feed.playlist_failures = count);
    }

    pub(crate) fn reject_tokens(&self, channel_key: &str, count: u32) {
        self.with_feed(channel_key, |feed| feed.token_rejections = count);
    }

    pub(crate) fn fail_segments(&self, channel_key: &str, count: u32) {
        self.with_feed(channel_key, |feed| feed.segment_failures = count);
    }
}

fn channel_key(locator: &StreamLocator) -> &str {
    locator
        .base_url
        .trim_start_matches("mock://")
        .trim_end_matches('/')
}

#[async_trait]
impl UpstreamProvider for MockProvider {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<AuthGrant, BridgeError> {
        let attempt = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock();
        if state.reject_credentials {
            return Err(BridgeError::CredentialsRejected("Invalid password".into()));
        }
        if state.login_failures > 0 {
            state.login_failures -= 1;
            return Err(BridgeError::Transport("auth endpoint unreachable".into()));
        }
        Ok(AuthGrant {
            token: format!("session-{attempt}"),
            secret: vec![0u8; 16],
            expires_in: self.session_lifetime,
        })
    }

    async fn lineup(&self) -> Result<Vec<LineupEntry>, BridgeError> {
        Ok(Vec::new())
    }

    async fn open_stream(
        &self,
        session: &Session,
        channel_key: &str,
    ) -> Result<StreamLocator, BridgeError> {
        let opened = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock();
        if state.session_rejections > 0 {
            state.session_rejections -= 1;
            return Err(BridgeError::Auth(format!(
                "Session {} rejected",
                session.token
            )));
        }
        Ok(StreamLocator {
            playlist_url: format!("mock://{channel_key}/playlist.m3u8"),
            base_url: format!("mock://{channel_key}/"),
            token: format!("token-{opened}"),
        })
    }

    async fn fetch_playlist(&self, locator: &StreamLocator) -> Result<Bytes, BridgeError> {
        self.with_feed(channel_key(locator), |feed| {
            feed.playlist_fetches += 1;
            if feed.token_rejections > 0 {
                feed.token_rejections -= 1;
                return Err(BridgeError::TokenRejected { status: 403 });
            }
            if feed.playlist_failures > 0 {
                feed.playlist_failures -= 1;
                return Err(BridgeError::Transport("connection reset".into()));
            }
            Ok(Bytes::from(feed.render()))
        })
    }

    async fn fetch_segment(
        &self,
        locator: &StreamLocator,
        uri: &str,
    ) -> Result<Bytes, BridgeError> {
        self.segment_fetches.fetch_add(1, Ordering::SeqCst);
        self.with_feed(channel_key(locator), |feed| {
            if feed.segment_failures > 0 {
                feed.segment_failures -= 1;
                return Err(BridgeError::Transport("segment download dropped".into()));
            }
            feed.segments
                .iter()
                .find(|s| s.uri == uri)
                .map(|s| s.data.clone())
                .ok_or_else(|| BridgeError::NotFound(uri.to_string()))
        })
    }

    async fn fetch_key(&self, _locator: &StreamLocator, uri: &str) -> Result<[u8; 16], BridgeError> {
        self.state
            .lock()
            .keys
            .get(uri)
            .copied()
            .ok_or_else(|| BridgeError::NotFound(uri.to_string()))
    }
}
