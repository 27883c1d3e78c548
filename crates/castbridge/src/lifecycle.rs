//! # Channel Lifecycle Manager
//!
//! Owns the per-channel runtime (fetcher, pipeline, pacer and hub). A channel
//! starts on its first listener and is torn down once the last listener has
//! been gone for the grace period:
//!
//! ```text
//! Idle -> Starting -> Live -> Stopping -> Idle
//!            |          |
//!            +-> Failed <+
//! ```
//!
//! The runtime of a channel lives in a slot guarded by an async mutex, which
//! together with the wait on `Stopping` keeps at most one upstream
//! connection per channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelInfo, ChannelState};
use crate::fetcher::{Fetcher, FetcherHandle};
use crate::hub::{DetachReason, Hub, Subscription};
use crate::media::{EncryptedPacket, NowPlaying};
use crate::pacer::Pacer;
use crate::pipeline::Pipeline;
use crate::provider::UpstreamProvider;
use crate::session::SessionStore;
use crate::{BridgeError, EngineConfig};

struct ChannelRuntime {
    generation: u64,
    hub: Hub,
    hub_task: JoinHandle<()>,
    fetcher: Arc<FetcherHandle>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ChannelRuntime {
    /// Stop everything and wait for the tasks to end
    async fn shutdown(self, reason: DetachReason) {
        self.fetcher.stop();
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(channel = %self.hub.channel_id(), "Channel task ended abnormally: {e}");
        }
        if let Err(e) = self.fetcher.join().await {
            debug!(channel = %self.hub.channel_id(), "Fetcher ended with: {e}");
        }
        self.hub.close(reason);
        let _ = self.hub_task.await;
    }
}

struct ChannelSlot {
    channel: Channel,
    state: watch::Sender<ChannelState>,
    runtime: Mutex<Option<ChannelRuntime>>,
    generation: AtomicU64,
    /// Hub of the running runtime, readable without the slot lock
    hub: parking_lot::Mutex<Option<Hub>>,
}

impl ChannelSlot {
    fn set_state(&self, next: ChannelState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            info!(channel = %self.channel.id, from = %previous, to = %next, "Channel state changed");
        }
    }

    fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    fn listener_count(&self) -> usize {
        self.hub.lock().as_ref().map_or(0, Hub::listener_count)
    }

    fn now_playing(&self) -> Option<NowPlaying> {
        self.hub
            .lock()
            .as_ref()
            .and_then(Hub::now_playing)
            .map(|track| (*track).clone())
    }

    /// `Starting -> Live` for the runtime of `generation`
    fn mark_live(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let changed = self.state.send_if_modified(|state| {
            if *state == ChannelState::Starting {
                *state = ChannelState::Live;
                true
            } else {
                false
            }
        });
        if changed {
            info!(channel = %self.channel.id, from = "starting", to = "live", "Channel state changed");
        }
    }

    /// Release the runtime of `generation` after an unrecoverable error.
    ///
    /// Called from the channel task itself, so that task is not awaited.
    async fn fail(&self, generation: u64, reason: String) {
        let runtime = {
            let mut guard = self.runtime.lock().await;
            if guard.as_ref().is_none_or(|rt| rt.generation != generation) {
                return;
            }
            error!(channel = %self.channel.id, "Channel failed: {reason}");
            self.set_state(ChannelState::Failed(reason.clone()));
            self.hub.lock().take();
            guard.take()
        };
        if let Some(runtime) = runtime {
            runtime.fetcher.stop();
            runtime.cancel.cancel();
            runtime.hub.close(DetachReason::ChannelFailed(reason));
        }
    }

    /// Tear the runtime down. With `idle_generation` set this is the grace
    /// timer firing, which only proceeds for that runtime and while nobody
    /// is listening.
    async fn teardown(&self, idle_generation: Option<u64>) -> bool {
        let runtime = {
            let mut guard = self.runtime.lock().await;
            let Some(runtime) = guard.as_ref() else {
                return false;
            };
            if let Some(generation) = idle_generation {
                if runtime.generation != generation || runtime.hub.listener_count() > 0 {
                    return false;
                }
            }
            self.set_state(ChannelState::Stopping);
            self.hub.lock().take();
            guard.take()
        };

        // The slot lock is released, attaches wait for Idle meanwhile
        let Some(runtime) = runtime else {
            return false;
        };
        runtime.shutdown(DetachReason::ChannelStopped).await;
        self.set_state(ChannelState::Idle);
        true
    }
}

struct ManagerInner {
    config: EngineConfig,
    provider: Arc<dyn UpstreamProvider>,
    sessions: Arc<SessionStore>,
    packet_key: [u8; 16],
    channels: BTreeMap<String, Arc<ChannelSlot>>,
    shutdown: CancellationToken,
}

/// Starts, shares and stops channel runtimes on behalf of listeners
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

impl ChannelManager {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn UpstreamProvider>,
        sessions: Arc<SessionStore>,
        channels: Vec<Channel>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let packet_key = config.upstream.packet_key_bytes()?;

        let channels = channels
            .into_iter()
            .map(|channel| {
                let (state, _) = watch::channel(ChannelState::Idle);
                let slot = ChannelSlot {
                    channel: channel.clone(),
                    state,
                    runtime: Mutex::new(None),
                    generation: AtomicU64::new(0),
                    hub: parking_lot::Mutex::new(None),
                };
                (channel.id, Arc::new(slot))
            })
            .collect::<BTreeMap<_, _>>();
        info!(channels = channels.len(), "Channel manager ready");

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                provider,
                sessions,
                packet_key,
                channels,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    fn slot(&self, id: &str) -> Result<&Arc<ChannelSlot>, BridgeError> {
        self.inner
            .channels
            .get(id)
            .ok_or_else(|| BridgeError::UnknownChannel(id.to_string()))
    }

    pub fn channel(&self, id: &str) -> Result<Channel, BridgeError> {
        self.slot(id).map(|slot| slot.channel.clone())
    }

    pub fn state(&self, id: &str) -> Result<ChannelState, BridgeError> {
        self.slot(id).map(|slot| slot.state())
    }

    pub fn subscribe_state(&self, id: &str) -> Result<watch::Receiver<ChannelState>, BridgeError> {
        self.slot(id).map(|slot| slot.state.subscribe())
    }

    pub fn stream_url(&self, id: &str) -> Result<String, BridgeError> {
        self.slot(id)?;
        Ok(format!("{}channel/{id}", self.inner.config.server.base_url()))
    }

    pub fn channel_info(&self, id: &str) -> Result<ChannelInfo, BridgeError> {
        let slot = self.slot(id)?;
        Ok(self.info(slot))
    }

    /// Every channel ordered by channel number
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        let mut channels: Vec<ChannelInfo> = self
            .inner
            .channels
            .values()
            .map(|slot| self.info(slot))
            .collect();
        channels.sort_by_key(|info| info.number);
        channels
    }

    fn info(&self, slot: &ChannelSlot) -> ChannelInfo {
        let channel = &slot.channel;
        ChannelInfo {
            id: channel.id.clone(),
            number: channel.number,
            name: channel.name.clone(),
            genre: channel.genre.clone(),
            stream_url: format!("{}channel/{}", self.inner.config.server.base_url(), channel.id),
            state: slot.state(),
            listeners: slot.listener_count(),
            now_playing: slot.now_playing(),
        }
    }

    /// Attach a listener, starting the channel when it is not running
    pub async fn attach(&self, id: &str) -> Result<Subscription, BridgeError> {
        let slot = self.slot(id)?.clone();
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }

            let mut guard = slot.runtime.lock().await;
            if slot.state() == ChannelState::Stopping {
                let mut state = slot.state.subscribe();
                drop(guard);
                debug!(channel = %id, "Waiting for teardown before restarting");
                state
                    .wait_for(|state| *state != ChannelState::Stopping)
                    .await
                    .map_err(|_| BridgeError::Cancelled)?;
                continue;
            }

            if guard.is_none() {
                *guard = Some(self.start(&slot).await?);
            }
            let Some(runtime) = guard.as_ref() else {
                continue;
            };
            return runtime.hub.attach().await;
        }
    }

    /// Wait until the channel is live, failing when it fails first or does
    /// not get there within `timeout`
    pub async fn wait_ready(&self, id: &str, timeout: Duration) -> Result<(), BridgeError> {
        let mut state = self.slot(id)?.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            state.wait_for(|state| {
                matches!(
                    state,
                    ChannelState::Live | ChannelState::Failed(_) | ChannelState::Idle
                )
            }),
        )
        .await
        .map_err(|_| BridgeError::Timeout(format!("Channel {id} did not start in time")))?
        .map_err(|_| BridgeError::Cancelled)?
        .clone();

        match settled {
            ChannelState::Live => Ok(()),
            ChannelState::Failed(reason) => Err(BridgeError::ChannelFailed {
                channel: id.to_string(),
                reason,
            }),
            other => Err(BridgeError::ChannelFailed {
                channel: id.to_string(),
                reason: format!("channel is {other}"),
            }),
        }
    }

    /// Stop every running channel
    pub async fn shutdown(&self) {
        info!("Shutting down channels");
        self.inner.shutdown.cancel();
        futures::future::join_all(
            self.inner
                .channels
                .values()
                .map(|slot| slot.teardown(None)),
        )
        .await;
        self.inner.sessions.shutdown();
    }

    /// Build the runtime of a channel. Runs under the slot lock.
    async fn start(&self, slot: &Arc<ChannelSlot>) -> Result<ChannelRuntime, BridgeError> {
        let channel = &slot.channel;
        slot.set_state(ChannelState::Starting);

        if let Err(e) = self.inner.sessions.acquire(&channel.account).await {
            slot.set_state(ChannelState::Failed(e.to_string()));
            return Err(e);
        }

        let config = &self.inner.config;
        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.inner.shutdown.child_token();

        let (hub, hub_task) = Hub::spawn(&channel.id, config.hub.capacity_frames());
        let (fetcher, packets) = Fetcher::new(
            channel.clone(),
            self.inner.sessions.clone(),
            self.inner.provider.clone(),
            config.fetcher.clone(),
            self.inner.packet_key,
        )
        .start(&cancel);

        let task = tokio::spawn(run_channel(
            slot.clone(),
            generation,
            packets,
            Pipeline::new(channel.id.clone(), &config.pipeline),
            Pacer::new(config.lifecycle.pacer_lead, config.lifecycle.pacer_max_lag),
            hub.clone(),
            fetcher.clone(),
            cancel.clone(),
        ));
        tokio::spawn(supervise(
            slot.clone(),
            generation,
            hub.subscribe_listeners(),
            config.lifecycle.grace_period,
            cancel.clone(),
        ));

        *slot.hub.lock() = Some(hub.clone());
        debug!(channel = %channel.id, generation, "Channel runtime started");

        Ok(ChannelRuntime {
            generation,
            hub,
            hub_task,
            fetcher,
            cancel,
            task,
        })
    }
}

/// Fetcher -> pipeline -> pacer -> hub, one packet at a time
#[allow(clippy::too_many_arguments)]
async fn run_channel(
    slot: Arc<ChannelSlot>,
    generation: u64,
    mut packets: mpsc::Receiver<EncryptedPacket>,
    mut pipeline: Pipeline,
    mut pacer: Pacer,
    hub: Hub,
    fetcher: Arc<FetcherHandle>,
    cancel: CancellationToken,
) {
    let channel = slot.channel.id.clone();
    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            packet = packets.recv() => packet,
        };
        let Some(packet) = packet else {
            break;
        };

        let output = pipeline.process(packet);
        if output.resync {
            fetcher.request_resync();
        }
        if let Some(track) = output.now_playing {
            hub.set_now_playing(track);
        }
        for frame in output.frames {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = pacer.wait(frame.pts) => {}
            }
            slot.mark_live(generation);
            if !hub.publish(Arc::new(frame)) {
                debug!(channel = %channel, "Hub closed, stopping channel task");
                return;
            }
        }
    }

    if cancel.is_cancelled() {
        return;
    }
    let reason = match fetcher.join().await {
        Ok(()) if cancel.is_cancelled() => return,
        Ok(()) => "upstream fetch ended".to_string(),
        Err(e) => e.to_string(),
    };
    slot.fail(generation, reason).await;
}

/// Grace timer: tear the runtime down once nobody listened for `grace`
async fn supervise(
    slot: Arc<ChannelSlot>,
    generation: u64,
    mut listeners: watch::Receiver<usize>,
    grace: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            idle = listeners.wait_for(|count| *count == 0) => {
                if idle.is_err() {
                    return;
                }
            }
        }
        debug!(channel = %slot.channel.id, ?grace, "No listeners left, grace period started");

        let expired = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            joined = listeners.wait_for(|count| *count > 0) => {
                if joined.is_err() {
                    return;
                }
                false
            }
            _ = tokio::time::sleep(grace) => true,
        };

        if !expired {
            debug!(channel = %slot.channel.id, "Listener returned, teardown cancelled");
            continue;
        }
        if slot.teardown(Some(generation)).await {
            return;
        }
    }
}
