//! Per-channel upstream fetch loop.
//!
//! Polls the channel's live media playlist and forwards new segments in
//! media sequence order. Key tag changes (and forced resyncs) start a new
//! [`KeyEpoch`] which is announced on the next packet.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use m3u8_rs::{KeyMethod, MediaPlaylist};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::media::{EncryptedPacket, KeyEpoch};
use crate::provider::{StreamLocator, UpstreamProvider};
use crate::session::{Session, SessionStore};
use crate::{BridgeError, FetcherConfig};

/// Identity of the key tag in force for a segment, `None` for the
/// provider's fixed packet key
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyTag {
    uri: Option<String>,
    iv: Option<String>,
}

/// Control side of a running fetcher
pub struct FetcherHandle {
    channel_id: String,
    cancel: CancellationToken,
    resync_requested: AtomicBool,
    wake: Notify,
    task: Mutex<Option<JoinHandle<Result<(), BridgeError>>>>,
}

impl FetcherHandle {
    /// Cancel the fetch loop. Safe to call any number of times.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!(channel = %self.channel_id, "Stopping fetcher");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Re-authenticate, reopen the stream and announce a fresh key epoch
    /// before the next packet
    pub fn request_resync(&self) {
        self.resync_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Wait for the loop to end. Only the first caller observes its result.
    pub async fn join(&self) -> Result<(), BridgeError> {
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task.await.unwrap_or_else(|e| {
                Err(BridgeError::Transport(format!("Fetcher task panicked: {e}")))
            }),
            None => Ok(()),
        }
    }
}

/// Mutable state of one fetch loop
struct FetchState {
    session: Option<Arc<Session>>,
    locator: Option<StreamLocator>,
    last_sequence: Option<u64>,
    target_duration: u64,
    epoch: Option<(Option<KeyTag>, Arc<KeyEpoch>)>,
    next_epoch_id: u64,
    /// Start a new epoch even if the key tag is unchanged
    force_epoch: bool,
}

pub struct Fetcher {
    channel: Channel,
    sessions: Arc<SessionStore>,
    provider: Arc<dyn UpstreamProvider>,
    config: FetcherConfig,
    packet_key: [u8; 16],
}

impl Fetcher {
    pub fn new(
        channel: Channel,
        sessions: Arc<SessionStore>,
        provider: Arc<dyn UpstreamProvider>,
        config: FetcherConfig,
        packet_key: [u8; 16],
    ) -> Self {
        Self {
            channel,
            sessions,
            provider,
            config,
            packet_key,
        }
    }

    /// Spawn the fetch loop. Cancelling `parent` stops it as well.
    pub fn start(
        self,
        parent: &CancellationToken,
    ) -> (Arc<FetcherHandle>, mpsc::Receiver<EncryptedPacket>) {
        let (tx, rx) = mpsc::channel(self.config.packet_buffer.max(1));
        let handle = Arc::new(FetcherHandle {
            channel_id: self.channel.id.clone(),
            cancel: parent.child_token(),
            resync_requested: AtomicBool::new(false),
            wake: Notify::new(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn({
            let handle = handle.clone();
            async move { self.run(&handle, tx).await }
        });
        // The task slot is empty until now, nobody can hold the lock yet
        if let Ok(mut slot) = handle.task.try_lock() {
            *slot = Some(task);
        }
        (handle, rx)
    }

    async fn cancellable<T>(
        &self,
        handle: &FetcherHandle,
        fut: impl Future<Output = Result<T, BridgeError>>,
    ) -> Result<T, BridgeError> {
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => Err(BridgeError::Cancelled),
            result = fut => result,
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        (self.config.retry_delay_base * 2_u32.pow(exponent)).min(self.config.max_retry_delay)
    }

    async fn run(
        self,
        handle: &FetcherHandle,
        tx: mpsc::Sender<EncryptedPacket>,
    ) -> Result<(), BridgeError> {
        let channel = self.channel.id.clone();
        info!(channel = %channel, key = %self.channel.key, "Fetcher started");

        let mut state = FetchState {
            session: None,
            locator: None,
            last_sequence: None,
            target_duration: 0,
            epoch: None,
            next_epoch_id: 1,
            force_epoch: false,
        };
        let mut failures = 0;

        let result = loop {
            if handle.cancel.is_cancelled() {
                break Ok(());
            }

            if handle.resync_requested.swap(false, Ordering::SeqCst) {
                info!(channel = %channel, "Resync requested, reopening upstream stream");
                if let Some(session) = state.session.take() {
                    self.sessions.invalidate(&self.channel.account, &session).await;
                }
                state.locator = None;
                state.force_epoch = true;
            }

            // Opening the stream needs a session that is valid now, the
            // store hands back the cached one until it nears expiry.
            // Login retries happen inside the store, a failure here is final.
            if state.session.is_none() || state.locator.is_none() {
                match self
                    .cancellable(handle, self.sessions.acquire(&self.channel.account))
                    .await
                {
                    Ok(session) => state.session = Some(session),
                    Err(BridgeError::Cancelled) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }

            match self.poll(handle, &mut state, &tx).await {
                Ok(()) => failures = 0,
                Err(BridgeError::Cancelled) => break Ok(()),
                Err(e) => {
                    if !e.is_retryable() && !matches!(e, BridgeError::NotFound(_)) {
                        break Err(e);
                    }
                    match &e {
                        BridgeError::TokenRejected { .. } => state.locator = None,
                        BridgeError::Auth(_) => {
                            if let Some(session) = state.session.take() {
                                self.sessions.invalidate(&self.channel.account, &session).await;
                            }
                            state.locator = None;
                        }
                        _ => {}
                    }

                    failures += 1;
                    if failures > self.config.max_retries {
                        error!(
                            channel = %channel,
                            attempts = failures,
                            "Fetcher exceeded retry ceiling: {e}"
                        );
                        break Err(e);
                    }
                    let delay = self.backoff(failures);
                    warn!(
                        channel = %channel,
                        attempt = failures,
                        ?delay,
                        "Upstream fetch failed, retrying: {e}"
                    );
                    tokio::select! {
                        biased;
                        _ = handle.cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            }

            let refresh_delay = Duration::from_secs(state.target_duration / 2)
                .max(self.config.min_refresh_interval);
            tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => break Ok(()),
                _ = handle.wake.notified() => {}
                _ = tokio::time::sleep(refresh_delay) => {}
            }
        };

        match &result {
            Ok(()) => info!(channel = %channel, "Fetcher stopped"),
            Err(e) => error!(channel = %channel, "Fetcher failed: {e}"),
        }
        result
    }

    /// One playlist refresh plus the download of every new segment
    async fn poll(
        &self,
        handle: &FetcherHandle,
        state: &mut FetchState,
        tx: &mpsc::Sender<EncryptedPacket>,
    ) -> Result<(), BridgeError> {
        let locator = match &state.locator {
            Some(locator) => locator.clone(),
            None => {
                let session = state.session.clone().ok_or_else(|| {
                    BridgeError::Auth("No session to open the stream with".to_string())
                })?;
                let locator = self
                    .cancellable(
                        handle,
                        self.provider.open_stream(&session, &self.channel.key),
                    )
                    .await?;
                state.locator = Some(locator.clone());
                locator
            }
        };

        let bytes = self
            .cancellable(handle, self.provider.fetch_playlist(&locator))
            .await?;
        let playlist = m3u8_rs::parse_media_playlist_res(&bytes)
            .map_err(|e| BridgeError::Transport(format!("Failed to parse playlist: {e:?}")))?;
        state.target_duration = playlist.target_duration;

        for (sequence, uri, tag) in self.select_segments(&playlist, state.last_sequence) {
            if handle.cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }

            let epoch_change = self.epoch_for(handle, state, &locator, tag).await?;
            let epoch_id = state.epoch.as_ref().map_or(0, |(_, epoch)| epoch.id);

            let data = match self
                .cancellable(handle, self.provider.fetch_segment(&locator, &uri))
                .await
            {
                Ok(data) => data,
                Err(BridgeError::NotFound(_)) => {
                    // Rolled out of the window before we got to it
                    warn!(channel = %self.channel.id, sequence, "Segment vanished, skipping");
                    if epoch_change.is_some() {
                        state.force_epoch = true;
                    }
                    state.last_sequence = Some(sequence);
                    continue;
                }
                Err(e) => {
                    if epoch_change.is_some() {
                        state.force_epoch = true;
                    }
                    return Err(e);
                }
            };

            debug!(
                channel = %self.channel.id,
                sequence,
                bytes = data.len(),
                "Fetched segment"
            );
            let packet = EncryptedPacket {
                data,
                sequence,
                epoch_id,
                epoch_change,
            };
            tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => return Err(BridgeError::Cancelled),
                sent = tx.send(packet) => {
                    if sent.is_err() {
                        // Consumer is gone, nothing left to fetch for
                        return Err(BridgeError::Cancelled);
                    }
                }
            }
            state.last_sequence = Some(sequence);
        }
        Ok(())
    }

    /// Segments to fetch from this playlist, each with the key tag in force
    fn select_segments(
        &self,
        playlist: &MediaPlaylist,
        last_sequence: Option<u64>,
    ) -> Vec<(u64, String, Option<KeyTag>)> {
        let mut current: Option<KeyTag> = None;
        let entries: Vec<_> = playlist
            .segments
            .iter()
            .enumerate()
            .map(|(i, segment)| {
                if let Some(key) = &segment.key {
                    current = (key.method != KeyMethod::None).then(|| KeyTag {
                        uri: key.uri.clone(),
                        iv: key.iv.clone(),
                    });
                }
                (
                    playlist.media_sequence + i as u64,
                    segment.uri.clone(),
                    current.clone(),
                )
            })
            .collect();

        match last_sequence {
            None => {
                let skip = entries.len().saturating_sub(self.config.live_edge_segments);
                entries.into_iter().skip(skip).collect()
            }
            Some(last) => {
                let fresh: Vec<_> = entries.into_iter().filter(|(seq, ..)| *seq > last).collect();
                if let Some((first, ..)) = fresh.first() {
                    if *first > last + 1 {
                        warn!(
                            channel = %self.channel.id,
                            from = last + 1,
                            to = *first - 1,
                            "Playlist moved past unfetched segments"
                        );
                    }
                }
                fresh
            }
        }
    }

    /// Return the new epoch when `tag` differs from the active one
    async fn epoch_for(
        &self,
        handle: &FetcherHandle,
        state: &mut FetchState,
        locator: &StreamLocator,
        tag: Option<KeyTag>,
    ) -> Result<Option<Arc<KeyEpoch>>, BridgeError> {
        if let Some((active, _)) = &state.epoch {
            if *active == tag && !state.force_epoch {
                return Ok(None);
            }
        }

        let (key, iv) = match &tag {
            Some(KeyTag { uri: Some(uri), iv }) => {
                let key = self
                    .cancellable(handle, self.provider.fetch_key(locator, uri))
                    .await?;
                (key, iv.as_deref().map(parse_iv).transpose()?)
            }
            Some(KeyTag { uri: None, iv }) => {
                (self.packet_key, iv.as_deref().map(parse_iv).transpose()?)
            }
            None => (self.packet_key, None),
        };

        let epoch = Arc::new(KeyEpoch::new(state.next_epoch_id, key, iv));
        state.next_epoch_id += 1;
        state.force_epoch = false;
        info!(
            channel = %self.channel.id,
            epoch = epoch.id,
            key_uri = tag.as_ref().and_then(|t| t.uri.as_deref()).unwrap_or("<packet key>"),
            "New key epoch"
        );
        state.epoch = Some((tag, epoch.clone()));
        Ok(Some(epoch))
    }
}

/// Parse an `EXT-X-KEY` IV attribute (`0x` followed by 32 hex digits)
fn parse_iv(value: &str) -> Result<[u8; 16], BridgeError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let bytes = hex::decode(digits)
        .map_err(|e| BridgeError::Transport(format!("Invalid key IV {value}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| BridgeError::Transport(format!("Key IV {value} is not 16 bytes")))
}
