mod conflict;
mod error;
mod mutations;
mod policy;
mod queries;
mod queue;
mod transition;
mod tx;

pub use conflict::{confirmed_conflicts, find_conflicting};
pub use error::{EngineError, Entity, PolicyRejection, StateError};
pub use policy::{check_policy, SettingsError, SettingsProvider, SettingsStore};
pub use queue::{pending_queue, position_for_new, position_of, QueuePosition};
pub use transition::check_transition;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// One booking request: a room, a window, and the dates it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub room_id: Ulid,
    pub dates: Vec<NaiveDate>,
    pub window: TimeWindow,
    pub kind: BookingType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedRequest {
    /// One pending row per distinct requested date, date order.
    pub bookings: Vec<Booking>,
    /// Dates where the new row overlaps an active booking. Free dates are absent.
    pub queue_positions: BTreeMap<NaiveDate, QueuePosition>,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result; a failed batch is rolled back.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

/// All or nothing: on any error the whole batch is rolled back off disk, so
/// no sender told `Err` can have its event come back on replay.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let written = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = written {
        if let Err(rollback_err) = wal.rollback() {
            tracing::error!("WAL rollback after failed batch also failed: {rollback_err}");
        }
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedRoomState>,
    pub(super) users: DashMap<Ulid, User>,
    /// Login name → user id.
    pub(super) user_names: DashMap<String, Ulid>,
    /// Reverse lookup: booking id → room id
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    pub(super) settings: Arc<SettingsStore>,
    pub(super) settings_provider: Arc<dyn SettingsProvider>,
    pub(super) config: EngineConfig,
    /// Serializes room, user and settings writes. Bookings use the room lock.
    pub(super) catalog_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a room-scoped event to a RoomState (no locking; caller holds the lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingsInserted { room_id, bookings } => {
            for booking in bookings {
                booking_index.insert(booking.id, *room_id);
                rs.insert_booking(booking.clone());
            }
        }
        Event::BookingStatusChanged { id, status, reason, .. } => {
            if let Some(b) = rs.get_booking_mut(id) {
                b.status = *status;
                if reason.is_some() {
                    b.cancellation_reason = reason.clone();
                }
            }
        }
        Event::RoomUpdated { name, .. } => rs.name = name.clone(),
        // Handled at the map level, not here
        Event::RoomCreated { .. }
        | Event::RoomDeleted { .. }
        | Event::UserCreated { .. }
        | Event::UserRoleChanged { .. }
        | Event::SettingsUpdated { .. } => {}
    }
}

/// The room an event applies to, for room-scoped events.
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingsInserted { room_id, .. } | Event::BookingStatusChanged { room_id, .. } => {
            Some(*room_id)
        }
        Event::RoomUpdated { id, .. } => Some(*id),
        Event::RoomCreated { .. }
        | Event::RoomDeleted { .. }
        | Event::UserCreated { .. }
        | Event::UserRoleChanged { .. }
        | Event::SettingsUpdated { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_config(wal_path, notify, EngineConfig::default())
    }

    pub fn with_config(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open_at(&wal_path, replay.valid_len)?;

        // Rebuild into plain maps first; nothing else can see this state yet.
        let booking_to_room = DashMap::new();
        let mut rooms: HashMap<Ulid, RoomState> = HashMap::new();
        let mut users: HashMap<Ulid, User> = HashMap::new();
        let mut settings = Settings::default();

        for event in &replay.events {
            match event {
                Event::RoomCreated { id, name } => {
                    rooms.insert(*id, RoomState::new(*id, name.clone()));
                }
                Event::RoomDeleted { id } => {
                    if let Some(rs) = rooms.remove(id) {
                        for booking_id in rs.booking_ids() {
                            booking_to_room.remove(booking_id);
                        }
                    }
                }
                Event::UserCreated { id, name, email, role } => {
                    users.insert(
                        *id,
                        User {
                            id: *id,
                            name: name.clone(),
                            email: email.clone(),
                            role: *role,
                        },
                    );
                }
                Event::UserRoleChanged { id, role } => {
                    if let Some(user) = users.get_mut(id) {
                        user.role = *role;
                    }
                }
                Event::SettingsUpdated { settings: s } => settings = s.clone(),
                other => {
                    if let Some(room_id) = event_room_id(other)
                        && let Some(rs) = rooms.get_mut(&room_id)
                    {
                        apply_to_room(rs, other, &booking_to_room);
                    }
                }
            }
        }

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let settings = Arc::new(SettingsStore::new(settings));
        let engine = Self {
            state: rooms
                .into_iter()
                .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
                .collect(),
            user_names: users.values().map(|u| (u.name.clone(), u.id)).collect(),
            users: users.into_iter().collect(),
            booking_to_room,
            settings_provider: settings.clone(),
            settings,
            config,
            catalog_lock: Mutex::new(()),
            wal_tx,
            notify,
        };
        tracing::debug!(
            "replayed {} events: {} rooms, {} users, {} bookings",
            replay.events.len(),
            engine.state.len(),
            engine.users.len(),
            engine.booking_to_room.len()
        );
        Ok(engine)
    }

    /// Consult `provider` instead of the stored settings for the policy gate.
    pub fn with_settings_provider(mut self, provider: Arc<dyn SettingsProvider>) -> Self {
        self.settings_provider = provider;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(&self, rs: &mut RoomState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.booking_to_room);
        Ok(())
    }

    /// Lookup booking → room, get room, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .get_room_for_booking(booking_id)
            .ok_or(EngineError::NotFound(Entity::Booking, *booking_id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(Entity::Room, room_id))?;
        let guard = rs.write_owned().await;
        // The room and its bookings may have been deleted while we waited.
        if !self.state.contains_key(&room_id) {
            return Err(EngineError::NotFound(Entity::Booking, *booking_id));
        }
        Ok((room_id, guard))
    }
}
