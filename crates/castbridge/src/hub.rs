//! # Channel Broadcast Hub
//!
//! One actor task per channel owns the listener set. Publish, attach, detach
//! and close are commands on a single unbounded queue, so publishing never
//! waits on listeners and every listener sees frames in production order.
//!
//! Each listener gets a bounded queue. A listener whose queue is full when a
//! frame arrives is detached with [`DetachReason::Overflow`]; nobody else
//! notices.
//!
//! The hub also holds the channel's now-playing track. It is kept on a watch
//! beside the frame queues, so a listener only ever sees the latest title.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::BridgeError;
use crate::media::{DecodedFrame, NowPlaying};

pub type ListenerId = u64;

/// Size of a listener queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BufferCapacity {
    Frames(usize),
    /// Playback time, converted with the nominal frame duration
    Seconds(f64),
}

impl BufferCapacity {
    pub fn frames(&self, frame_duration: Duration) -> usize {
        match *self {
            BufferCapacity::Frames(frames) => frames,
            BufferCapacity::Seconds(seconds) => {
                if frame_duration.is_zero() || seconds <= 0.0 {
                    return 0;
                }
                (seconds / frame_duration.as_secs_f64()).ceil() as usize
            }
        }
    }
}

/// Why a subscription stopped receiving frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachReason {
    Requested,
    Overflow,
    ChannelFailed(String),
    ChannelStopped,
}

impl DetachReason {
    /// The error a listener connection ends with, if any
    pub fn error(&self, channel_id: &str) -> Option<BridgeError> {
        match self {
            DetachReason::Requested | DetachReason::ChannelStopped => None,
            DetachReason::Overflow => Some(BridgeError::ListenerOverflow),
            DetachReason::ChannelFailed(reason) => Some(BridgeError::ChannelFailed {
                channel: channel_id.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetachReason::Requested => write!(f, "detached"),
            DetachReason::Overflow => write!(f, "listener buffer overflow"),
            DetachReason::ChannelFailed(reason) => write!(f, "channel failed: {reason}"),
            DetachReason::ChannelStopped => write!(f, "channel stopped"),
        }
    }
}

type ReasonSlot = Arc<Mutex<Option<DetachReason>>>;
type NowPlayingWatch = watch::Receiver<Option<Arc<NowPlaying>>>;

enum HubCommand {
    Publish(Arc<DecodedFrame>),
    Attach {
        reply: oneshot::Sender<Subscription>,
    },
    Detach(ListenerId),
    Close(DetachReason),
}

struct Listener {
    tx: mpsc::Sender<Arc<DecodedFrame>>,
    reason: ReasonSlot,
    joined_at: DateTime<Utc>,
    /// Sequence of the last frame queued for this listener
    cursor: Option<u64>,
}

impl Listener {
    fn end(self, reason: DetachReason) {
        *self.reason.lock() = Some(reason);
    }
}

/// Receiving side of one attached listener. Dropping it detaches.
pub struct Subscription {
    id: ListenerId,
    rx: mpsc::Receiver<Arc<DecodedFrame>>,
    reason: ReasonSlot,
    commands: mpsc::UnboundedSender<HubCommand>,
    now_playing: NowPlayingWatch,
    joined_at: DateTime<Utc>,
    detached: bool,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    /// Next frame, or the reason this listener was detached
    pub async fn recv(&mut self) -> Result<Arc<DecodedFrame>, DetachReason> {
        if let Some(reason) = self.reason.lock().clone() {
            return Err(reason);
        }
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(self
                .reason
                .lock()
                .clone()
                .unwrap_or(DetachReason::ChannelStopped)),
        }
    }

    /// The now-playing track if it changed since the last call. A fresh
    /// subscription reports the current track once.
    pub fn now_playing_changed(&mut self) -> Option<Arc<NowPlaying>> {
        if !self.now_playing.has_changed().unwrap_or(false) {
            return None;
        }
        self.now_playing.borrow_and_update().clone()
    }

    /// Leave the hub. Safe to call more than once.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.reason
            .lock()
            .get_or_insert(DetachReason::Requested);
        // The hub may already be gone
        let _ = self.commands.send(HubCommand::Detach(self.id));
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("joined_at", &self.joined_at)
            .field("detached", &self.detached)
            .finish()
    }
}

/// Handle to a channel's hub actor
#[derive(Clone)]
pub struct Hub {
    channel_id: Arc<str>,
    commands: mpsc::UnboundedSender<HubCommand>,
    listeners: watch::Receiver<usize>,
    now_playing: Arc<watch::Sender<Option<Arc<NowPlaying>>>>,
}

impl Hub {
    /// Spawn the actor with `capacity` frames per listener queue
    pub fn spawn(channel_id: &str, capacity: usize) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (count_tx, listeners) = watch::channel(0);
        let (now_playing, now_playing_rx) = watch::channel(None);
        let actor = HubActor {
            channel_id: channel_id.to_string(),
            capacity: capacity.max(1),
            commands: commands.downgrade(),
            listeners: BTreeMap::new(),
            next_id: 1,
            count: count_tx,
            now_playing: now_playing_rx,
        };
        let task = tokio::spawn(actor.run(rx));
        (
            Self {
                channel_id: Arc::from(channel_id),
                commands,
                listeners,
                now_playing: Arc::new(now_playing),
            },
            task,
        )
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Queue a frame for every attached listener. Returns false once the hub
    /// is closed.
    pub fn publish(&self, frame: Arc<DecodedFrame>) -> bool {
        self.commands.send(HubCommand::Publish(frame)).is_ok()
    }

    /// Attach a listener. It receives frames published after this call.
    pub async fn attach(&self) -> Result<Subscription, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Attach { reply })
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())
    }

    pub fn detach(&self, id: ListenerId) {
        let _ = self.commands.send(HubCommand::Detach(id));
    }

    /// Detach everyone with `reason` and stop the actor
    pub fn close(&self, reason: DetachReason) {
        let _ = self.commands.send(HubCommand::Close(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn listener_count(&self) -> usize {
        *self.listeners.borrow()
    }

    pub fn subscribe_listeners(&self) -> watch::Receiver<usize> {
        self.listeners.clone()
    }

    /// Replace the now-playing track. Returns false when it is unchanged.
    pub fn set_now_playing(&self, track: NowPlaying) -> bool {
        self.now_playing.send_if_modified(|current| {
            if current.as_deref() == Some(&track) {
                return false;
            }
            *current = Some(Arc::new(track));
            true
        })
    }

    pub fn now_playing(&self) -> Option<Arc<NowPlaying>> {
        self.now_playing.borrow().clone()
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::ChannelFailed {
            channel: self.channel_id.to_string(),
            reason: "hub closed".to_string(),
        }
    }
}

struct HubActor {
    channel_id: String,
    capacity: usize,
    /// Handed to subscriptions so they can detach themselves
    commands: mpsc::WeakUnboundedSender<HubCommand>,
    listeners: BTreeMap<ListenerId, Listener>,
    next_id: ListenerId,
    count: watch::Sender<usize>,
    /// Never marked seen, clones start out unseen
    now_playing: NowPlayingWatch,
}

impl HubActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        debug!(channel = %self.channel_id, capacity = self.capacity, "Hub started");
        let reason = loop {
            let Some(command) = rx.recv().await else {
                break DetachReason::ChannelStopped;
            };
            match command {
                HubCommand::Publish(frame) => self.publish(frame),
                HubCommand::Attach { reply } => self.attach(reply),
                HubCommand::Detach(id) => self.detach(id, DetachReason::Requested),
                HubCommand::Close(reason) => break reason,
            }
        };

        let count = self.listeners.len();
        for (_, listener) in std::mem::take(&mut self.listeners) {
            listener.end(reason.clone());
        }
        self.count.send_replace(0);
        info!(
            channel = %self.channel_id,
            listeners = count,
            reason = %reason,
            "Hub closed"
        );
    }

    fn publish(&mut self, frame: Arc<DecodedFrame>) {
        let mut overflowed = Vec::new();
        for (id, listener) in self.listeners.iter_mut() {
            if listener.cursor.is_some_and(|cursor| frame.sequence <= cursor) {
                continue;
            }
            match listener.tx.try_send(frame.clone()) {
                Ok(()) => listener.cursor = Some(frame.sequence),
                Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*id),
                // Receiver dropped, its detach command is on the way
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        for id in overflowed {
            warn!(
                channel = %self.channel_id,
                listener = id,
                capacity = self.capacity,
                "Listener fell behind, disconnecting"
            );
            self.detach(id, DetachReason::Overflow);
        }
    }

    fn attach(&mut self, reply: oneshot::Sender<Subscription>) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::channel(self.capacity);
        let reason: ReasonSlot = Arc::new(Mutex::new(None));
        let joined_at = Utc::now();
        let subscription = Subscription {
            id,
            rx,
            reason: reason.clone(),
            commands,
            now_playing: self.now_playing.clone(),
            joined_at,
            detached: false,
        };

        // The count must include this listener before the attacher can
        // observe the subscription
        self.listeners.insert(
            id,
            Listener {
                tx,
                reason,
                joined_at,
                cursor: None,
            },
        );
        self.count.send_replace(self.listeners.len());

        if let Err(mut subscription) = reply.send(subscription) {
            // Attacher gave up waiting
            subscription.detached = true;
            self.listeners.remove(&id);
            self.count.send_replace(self.listeners.len());
            debug!(channel = %self.channel_id, listener = id, "Attach abandoned");
            return;
        }
        info!(
            channel = %self.channel_id,
            listener = id,
            listeners = self.listeners.len(),
            "Listener attached"
        );
    }

    fn detach(&mut self, id: ListenerId, reason: DetachReason) {
        let Some(listener) = self.listeners.remove(&id) else {
            return;
        };
        let connected_for = Utc::now() - listener.joined_at;
        let delivered = listener.cursor;
        listener.end(reason.clone());
        self.count.send_replace(self.listeners.len());
        info!(
            channel = %self.channel_id,
            listener = id,
            listeners = self.listeners.len(),
            reason = %reason,
            last_sequence = ?delivered,
            connected_secs = connected_for.num_seconds(),
            "Listener detached"
        );
    }
}
