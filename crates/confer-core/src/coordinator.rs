//! Per-room coordinator.
//!
//! Each room is owned by exactly one `RoomCoordinator`: a single-writer
//! state machine over the room's durable storage and its set of open
//! channels. All mutations for a room run holding the room lock, so
//! handlers never interleave mid-mutation; separate rooms share nothing
//! and run fully concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use confer_protocol::close_codes;
use confer_protocol::{ClientMessage, RoomState, ServerMessage, User};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::lifecycle::{LifecycleApi, ReportStatus};
use crate::storage::{keys, Storage, StorageError};

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The lifecycle service does not recognize the room.
    #[error("Room {0} is not valid")]
    RoomInvalid(String),

    /// Durable storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A stored record could not be (de)serialized.
    #[error("Corrupt stored record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Liveness sweep interval; doubles as the heartbeat timeout.
    pub sweep_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(15),
        }
    }
}

/// An instruction queued for delivery on one channel's transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Send a serialized message.
    Frame(ServerMessage),
    /// Send a close frame with the given code and stop the transport.
    Close(u16),
}

impl Outbound {
    /// Whether this item carries an application message rather than a
    /// close instruction.
    #[must_use]
    pub fn is_frame(&self) -> bool {
        matches!(self, Outbound::Frame(_))
    }
}

/// Handle to one open bidirectional channel.
///
/// The transport side drains the queue in order, so messages to a single
/// channel are delivered in send order. A failed send means the transport
/// is gone.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelHandle {
    /// Create a handle for the channel with the given stable identifier.
    #[must_use]
    pub fn new(id: impl Into<String>, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id: id.into(), tx }
    }

    /// The channel's stable identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a message; returns `false` if the transport is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Frame(message)).is_ok()
    }

    /// Queue a close instruction with the given code.
    pub fn close(&self, code: u16) {
        let _ = self.tx.send(Outbound::Close(code));
    }
}

/// Result of one liveness sweep.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// Channel ids evicted for stale heartbeats.
    pub evicted: Vec<String>,
    /// User records remaining after the sweep.
    pub remaining: usize,
}

/// Mutable room state behind the single-writer lock.
struct RoomInner {
    /// Currently open channels by id.
    channels: HashMap<String, ChannelHandle>,
    /// Whether the external service reports a terminal status.
    meeting_ended: bool,
}

/// Single-writer coordinator for one room.
pub struct RoomCoordinator {
    room_id: String,
    storage: Arc<dyn Storage>,
    lifecycle: Arc<dyn LifecycleApi>,
    config: CoordinatorConfig,
    inner: Mutex<RoomInner>,
    // Only mutated while holding `inner`; see ensure_sweeper/run_sweeper.
    sweeper_armed: AtomicBool,
}

impl RoomCoordinator {
    /// Create a coordinator for `room_id` over the given storage and
    /// lifecycle client.
    #[must_use]
    pub fn new(
        room_id: impl Into<String>,
        storage: Arc<dyn Storage>,
        lifecycle: Arc<dyn LifecycleApi>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            storage,
            lifecycle,
            config,
            inner: Mutex::new(RoomInner {
                channels: HashMap::new(),
                meeting_ended: false,
            }),
            sweeper_armed: AtomicBool::new(false),
        }
    }

    /// The room's registry id (the room code from the request path).
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Register a newly opened channel.
    ///
    /// Validates the room, resolves the meeting, persists the user record
    /// and a fresh heartbeat, updates peak bookkeeping, and broadcasts the
    /// updated roster. On an invalid room the channel receives an error
    /// message and a close instruction with code 4004, and nothing is
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns `RoomInvalid` when the lifecycle service rejects the room,
    /// or a storage/serialization error.
    pub async fn connect(
        self: &Arc<Self>,
        handle: ChannelHandle,
        room_code: &str,
        name: &str,
    ) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().await;

        // First connector's code becomes authoritative for the room's lifetime.
        let code = match self.storage.get(keys::ROOM_CODE).await? {
            Some(v) => v.as_str().unwrap_or(room_code).to_string(),
            None => {
                self.storage
                    .put(keys::ROOM_CODE, Value::String(room_code.to_string()))
                    .await?;
                room_code.to_string()
            }
        };

        // Fail fast on an invalid room, no retry.
        let validation = self.lifecycle.validate_room(&code).await;
        if !validation.valid {
            warn!(
                room = %self.room_id,
                channel = %handle.id(),
                "Rejecting connection to invalid room"
            );
            handle.send(ServerMessage::error("room not valid"));
            handle.close(close_codes::ROOM_INVALID);
            return Err(CoordinatorError::RoomInvalid(code));
        }
        inner.meeting_ended = validation.status.is_ended();

        // First successful connection to a valid room starts the meeting.
        let meeting_created = match self.storage.get(keys::MEETING_ID).await? {
            Some(_) => false,
            None => {
                let meeting_id = Uuid::new_v4().to_string();
                self.storage
                    .put(keys::MEETING_ID, Value::String(meeting_id.clone()))
                    .await?;
                info!(room = %self.room_id, meeting = %meeting_id, "Meeting started");
                true
            }
        };

        self.ensure_sweeper(&inner);

        // Reconnecting with the same channel id recovers prior state.
        let session_key = keys::session(handle.id());
        let user = match self.storage.get(&session_key).await? {
            Some(v) => serde_json::from_value(v)?,
            None => User::new(handle.id(), name),
        };
        self.storage
            .put(&session_key, serde_json::to_value(&user)?)
            .await?;
        self.storage
            .put(&keys::heartbeat(handle.id()), Value::from(now_ms()))
            .await?;

        debug!(
            room = %self.room_id,
            channel = %handle.id(),
            name = %user.name,
            "Channel registered"
        );
        inner.channels.insert(handle.id().to_string(), handle);

        self.track_peak_user_count(&mut inner, meeting_created)
            .await?;
        self.broadcast_room_state(&mut inner).await?;

        Ok(())
    }

    /// Handle one application message from a channel.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error; the caller logs it and
    /// surfaces an error payload to the sender without closing the channel.
    pub async fn handle_message(
        self: &Arc<Self>,
        channel_id: &str,
        message: ClientMessage,
    ) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().await;

        match message {
            ClientMessage::UserLeft => self.user_left(&mut inner, channel_id).await,

            ClientMessage::UserUpdate { user } => {
                // Stored verbatim; the roster broadcast echoes it back.
                self.storage
                    .put(&keys::session(channel_id), serde_json::to_value(&user)?)
                    .await?;
                self.broadcast_room_state(&mut inner).await
            }

            ClientMessage::NegotiationRecordLog { entry, session_id } => {
                info!(
                    room = %self.room_id,
                    channel = %channel_id,
                    session = %session_id,
                    entry = %entry,
                    "Negotiation record"
                );
                Ok(())
            }

            ClientMessage::DirectMessage { to, message } => {
                self.direct_message(&inner, channel_id, &to, message).await
            }

            ClientMessage::MuteUser { id } => self.mute_user(&mut inner, channel_id, &id).await,

            ClientMessage::Heartbeat => {
                self.storage
                    .put(&keys::heartbeat(channel_id), Value::from(now_ms()))
                    .await?;
                Ok(())
            }

            ClientMessage::Ping => {
                // Reserved tag; clients should never send it. Answer anyway
                // so the match stays total without dropping the channel.
                warn!(room = %self.room_id, channel = %channel_id, "Reserved ping tag received");
                if let Some(handle) = inner.channels.get(channel_id) {
                    handle.send(ServerMessage::Pong);
                }
                Ok(())
            }
        }
    }

    /// Detach a channel whose transport closed.
    ///
    /// Removal of the user record is deliberate here: it happens via
    /// `userLeft` or the sweep, never implicitly on close.
    pub async fn disconnect(&self, channel_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.channels.remove(channel_id).is_some() {
            debug!(room = %self.room_id, channel = %channel_id, "Channel detached");
        }
    }

    /// Run one liveness sweep immediately.
    ///
    /// Evicts users whose heartbeat is missing or older than the sweep
    /// interval; ends the meeting if the room is empty afterwards.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error.
    pub async fn sweep_now(&self) -> Result<SweepOutcome, CoordinatorError> {
        let mut inner = self.inner.lock().await;
        let outcome = self.sweep_locked(&mut inner).await?;

        if outcome.remaining == 0 {
            if self.storage.get(keys::MEETING_ID).await?.is_some() {
                self.end_meeting(&mut inner).await?;
            }
        } else if !outcome.evicted.is_empty() {
            self.broadcast_room_state(&mut inner).await?;
        }

        Ok(outcome)
    }

    /// The current broadcastable snapshot: meeting id plus full roster.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn room_state(&self) -> Result<RoomState, CoordinatorError> {
        let meeting_id = self
            .storage
            .get(keys::MEETING_ID)
            .await?
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();

        let users = self
            .storage
            .list_prefix(keys::SESSION_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect();

        Ok(RoomState { meeting_id, users })
    }

    /// Number of currently open channels.
    pub async fn channel_count(&self) -> usize {
        self.inner.lock().await.channels.len()
    }

    /// Whether this coordinator holds no channels and no meeting state.
    pub async fn is_idle(&self) -> bool {
        let inner = self.inner.lock().await;
        if !inner.channels.is_empty() {
            return false;
        }
        matches!(self.storage.get(keys::MEETING_ID).await, Ok(None))
    }

    async fn user_left(
        &self,
        inner: &mut RoomInner,
        channel_id: &str,
    ) -> Result<(), CoordinatorError> {
        if let Some(handle) = inner.channels.remove(channel_id) {
            handle.close(close_codes::NORMAL);
        }

        let note = ServerMessage::user_left_notification(channel_id);
        self.broadcast(inner, &note, Some(channel_id)).await?;

        self.storage.delete(&keys::session(channel_id)).await?;
        self.storage.delete(&keys::heartbeat(channel_id)).await?;
        info!(room = %self.room_id, channel = %channel_id, "User left");

        let remaining = self.storage.list_prefix(keys::SESSION_PREFIX).await?.len();
        if remaining == 0 {
            return self.end_meeting(inner).await;
        }
        self.broadcast_room_state(inner).await
    }

    async fn direct_message(
        &self,
        inner: &RoomInner,
        sender_id: &str,
        to: &str,
        message: String,
    ) -> Result<(), CoordinatorError> {
        let from = self
            .storage
            .get(&keys::session(sender_id))
            .await?
            .and_then(|v| serde_json::from_value::<User>(v).ok())
            .map(|u| u.name)
            .unwrap_or_else(|| sender_id.to_string());

        let mut found = false;
        if let Some(target) = inner.channels.get(to) {
            target.send(ServerMessage::direct_message(from, message));
            found = true;
        }
        if !found {
            warn!(
                room = %self.room_id,
                from = %sender_id,
                to = %to,
                "Direct message target not connected"
            );
        }
        Ok(())
    }

    async fn mute_user(
        &self,
        inner: &mut RoomInner,
        sender_id: &str,
        target_id: &str,
    ) -> Result<(), CoordinatorError> {
        if !inner.channels.contains_key(target_id) {
            warn!(
                room = %self.room_id,
                requested_by = %sender_id,
                target = %target_id,
                "Mute target not connected"
            );
            return Ok(());
        }

        let session_key = keys::session(target_id);
        if let Some(v) = self.storage.get(&session_key).await? {
            let mut user: User = serde_json::from_value(v)?;
            user.tracks.audio_enabled = false;
            self.storage
                .put(&session_key, serde_json::to_value(&user)?)
                .await?;
        }

        if let Some(target) = inner.channels.get(target_id) {
            target.send(ServerMessage::MuteMic);
        }
        info!(
            room = %self.room_id,
            requested_by = %sender_id,
            target = %target_id,
            "User muted"
        );
        self.broadcast_room_state(inner).await
    }

    /// Fan out a message to every open channel except `exclude`.
    ///
    /// A channel whose transport is gone is force-closed, its records are
    /// deleted, and `true` is returned so the caller can rebroadcast the
    /// roster.
    async fn broadcast(
        &self,
        inner: &mut RoomInner,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<bool, CoordinatorError> {
        let mut failed: Vec<String> = Vec::new();
        for (id, handle) in &inner.channels {
            if Some(id.as_str()) == exclude {
                continue;
            }
            if !handle.send(message.clone()) {
                failed.push(id.clone());
            }
        }

        for id in &failed {
            warn!(room = %self.room_id, channel = %id, "Dropping unreachable channel");
            if let Some(handle) = inner.channels.remove(id) {
                handle.close(close_codes::INTERNAL_ERROR);
            }
            self.storage.delete(&keys::session(id)).await?;
            self.storage.delete(&keys::heartbeat(id)).await?;
        }

        Ok(!failed.is_empty())
    }

    /// Broadcast the current roster; if any channel failed, broadcast once
    /// more so everyone sees the removal.
    async fn broadcast_room_state(&self, inner: &mut RoomInner) -> Result<(), CoordinatorError> {
        let message = ServerMessage::room_state(self.room_state().await?);
        if self.broadcast(inner, &message, None).await? {
            let repaired = ServerMessage::room_state(self.room_state().await?);
            self.broadcast(inner, &repaired, None).await?;
        }
        Ok(())
    }

    async fn sweep_locked(&self, inner: &mut RoomInner) -> Result<SweepOutcome, CoordinatorError> {
        let interval_ms = self.config.sweep_interval.as_millis() as u64;
        let now = now_ms();

        let sessions = self.storage.list_prefix(keys::SESSION_PREFIX).await?;
        let mut evicted = Vec::new();

        for (key, _) in &sessions {
            let channel_id = key
                .strip_prefix(keys::SESSION_PREFIX)
                .unwrap_or(key)
                .to_string();
            let last_seen = self
                .storage
                .get(&keys::heartbeat(&channel_id))
                .await?
                .and_then(|v| v.as_u64());
            let dead = match last_seen {
                Some(ts) => now.saturating_sub(ts) > interval_ms,
                None => true,
            };
            if !dead {
                continue;
            }

            info!(
                room = %self.room_id,
                channel = %channel_id,
                "Evicting user with stale heartbeat"
            );
            let note = ServerMessage::user_left_notification(&channel_id);
            self.broadcast(inner, &note, None).await?;
            self.storage.delete(key).await?;
            self.storage.delete(&keys::heartbeat(&channel_id)).await?;
            if let Some(handle) = inner.channels.remove(&channel_id) {
                handle.close(close_codes::INTERNAL_ERROR);
            }
            evicted.push(channel_id);
        }

        // Recount from storage: the eviction broadcasts above can drop
        // further sessions whose transports turned out to be dead.
        let remaining = self.storage.list_prefix(keys::SESSION_PREFIX).await?.len();

        Ok(SweepOutcome { evicted, remaining })
    }

    /// Update peak-occupancy bookkeeping after a connect.
    ///
    /// Sweeps first so stale users are not counted, then reports the new
    /// maximum when it grew, when the meeting was just created, or when
    /// the meeting is already flagged ended.
    async fn track_peak_user_count(
        &self,
        inner: &mut RoomInner,
        meeting_created: bool,
    ) -> Result<(), CoordinatorError> {
        self.sweep_locked(inner).await?;

        let count = self.storage.list_prefix(keys::SESSION_PREFIX).await?.len() as u64;
        let previous = self
            .storage
            .get(keys::PEAK_USERS)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let peak = previous.max(count);

        if peak > previous || meeting_created || inner.meeting_ended {
            self.storage.put(keys::PEAK_USERS, Value::from(peak)).await?;
            let acknowledged = self
                .lifecycle
                .report_stats(&self.room_id, peak as u32, ReportStatus::Started)
                .await;
            if !acknowledged {
                warn!(room = %self.room_id, peak, "Peak occupancy report not acknowledged");
            }
        }

        Ok(())
    }

    /// Tear the room down and report the terminal status.
    ///
    /// State is deleted first; the report is best-effort and never retried.
    async fn end_meeting(&self, inner: &mut RoomInner) -> Result<(), CoordinatorError> {
        let meeting_id = self
            .storage
            .get(keys::MEETING_ID)
            .await?
            .and_then(|v| v.as_str().map(String::from));
        let peak = self
            .storage
            .get(keys::PEAK_USERS)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        self.storage.delete_all().await?;
        inner.meeting_ended = true;
        info!(
            room = %self.room_id,
            meeting = ?meeting_id,
            peak,
            "Meeting ended"
        );

        let acknowledged = self
            .lifecycle
            .report_stats(&self.room_id, peak as u32, ReportStatus::Done)
            .await;
        if !acknowledged {
            warn!(room = %self.room_id, "End-of-meeting report not acknowledged");
        }

        Ok(())
    }

    /// Arm the periodic sweep timer if it is not already running.
    ///
    /// Must be called while holding the room lock: the armed flag only
    /// changes under it, so a timer exiting and a connect arming a new one
    /// cannot miss each other.
    fn ensure_sweeper(self: &Arc<Self>, _inner: &RoomInner) {
        if self.sweeper_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_sweeper().await;
        });
    }

    /// Timer task: sweep on a fixed interval, rearm only from its own
    /// completion, exit once the room is empty.
    async fn run_sweeper(self: Arc<Self>) {
        let interval = self.config.sweep_interval;
        debug!(room = %self.room_id, ?interval, "Sweep timer armed");

        loop {
            tokio::time::sleep(interval).await;
            let mut inner = self.inner.lock().await;

            let outcome = match self.sweep_locked(&mut inner).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(room = %self.room_id, error = %e, "Sweep failed");
                    continue;
                }
            };

            if outcome.remaining == 0 {
                // The meeting may already have ended via an explicit leave.
                match self.storage.get(keys::MEETING_ID).await {
                    Ok(Some(_)) => {
                        if let Err(e) = self.end_meeting(&mut inner).await {
                            error!(room = %self.room_id, error = %e, "Failed to end meeting");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(room = %self.room_id, error = %e, "Failed to read meeting id");
                    }
                }
                self.sweeper_armed.store(false, Ordering::SeqCst);
                break;
            }

            if !outcome.evicted.is_empty() {
                if let Err(e) = self.broadcast_room_state(&mut inner).await {
                    error!(room = %self.room_id, error = %e, "Roster broadcast failed");
                }
            }
        }

        debug!(room = %self.room_id, "Sweep timer disarmed");
    }
}

/// Current wall-clock time in milliseconds.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
