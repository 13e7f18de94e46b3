mod error;
mod mutations;
mod queries;
mod reservations;
pub mod schedule;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;
use crate::wal::Wal;

/// One slot row. Holding its write guard is the row lock.
pub type SharedSlotState = Arc<RwLock<SlotState>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then commits the whole batch with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before compaction touches the file.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL commit of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller in the batch is told it failed, so none of its bytes
        // may be left for replay to find.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback after failed commit failed: {e}");
        }
    }
    result
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// In-memory booking store backed by the WAL.
///
/// Slots are individually locked rows. Everything else is an index kept
/// consistent by applying the same events that are written to the log.
pub struct Engine {
    slots: DashMap<Ulid, SharedSlotState>,
    items: DashMap<Ulid, ItemInfo>,
    /// Item → its slot ids.
    item_slots: DashMap<Ulid, Vec<Ulid>>,
    users: DashMap<Ulid, UserInfo>,
    logins: DashMap<String, Ulid>,
    /// Booking id → slot id.
    booking_to_slot: DashMap<Ulid, Ulid>,
    /// User id → active booking ids.
    user_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// Serializes quota check + insert per user. Always taken after a slot lock.
    user_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serializes item, user and slot creation/deletion and compaction.
    /// Taken before any slot row lock.
    catalog_lock: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    config: EngineConfig,
}

/// Apply a slot-scoped event to a locked slot row.
fn apply_to_slot(slot: &mut SlotState, event: &Event) {
    match event {
        Event::SlotAvailabilitySet { available, .. } => {
            slot.available = *available;
        }
        Event::BookingCreated {
            id,
            user_id,
            created_at,
            ..
        } => {
            slot.booking = Some(BookingRecord {
                id: *id,
                user_id: *user_id,
                created_at: *created_at,
            });
            slot.available = false;
        }
        Event::BookingCancelled { .. } => {
            slot.booking = None;
            slot.available = true;
        }
        Event::SlotDeleted { .. } => {
            slot.deleted = true;
        }
        Event::ItemCreated { .. }
        | Event::ItemDeleted { .. }
        | Event::UserCreated { .. }
        | Event::UserDeleted { .. }
        | Event::SlotCreated { .. } => {}
    }
}

/// The slot an event touches, if it is slot-scoped.
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotAvailabilitySet { id, .. } | Event::SlotDeleted { id, .. } => Some(*id),
        Event::BookingCreated { slot_id, .. } | Event::BookingCancelled { slot_id, .. } => {
            Some(*slot_id)
        }
        Event::ItemCreated { .. }
        | Event::ItemDeleted { .. }
        | Event::UserCreated { .. }
        | Event::UserDeleted { .. }
        | Event::SlotCreated { .. } => None,
    }
}

/// Range-check a caller-supplied day and return its midnight.
fn validate_day(day: Ms) -> Result<Ms, EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&day) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(day_of(day))
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let recovered = Wal::recover(&wal_path)?;
        let wal = Wal::open_at(&wal_path, recovered.valid_len)?;
        let events = recovered.events;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            items: DashMap::new(),
            item_slots: DashMap::new(),
            users: DashMap::new(),
            logins: DashMap::new(),
            booking_to_slot: DashMap::new(),
            user_bookings: DashMap::new(),
            user_locks: DashMap::new(),
            catalog_lock: Mutex::new(()),
            wal_tx,
            config,
        };

        // We're the sole owner of every slot Arc during replay, so try_write
        // never contends. Never block here: this may run inside a runtime.
        for event in &events {
            if let Some(slot_id) = event_slot_id(event)
                && let Some(slot) = engine.get_slot(&slot_id)
            {
                let mut guard = slot
                    .try_write()
                    .map_err(|_| io::Error::other("replay: slot row contended"))?;
                apply_to_slot(&mut guard, event);
            }
            engine.apply_index(event);
        }
        tracing::info!(
            "replayed {} events: {} items, {} users, {} slots, {} bookings",
            events.len(),
            engine.items.len(),
            engine.users.len(),
            engine.slots.len(),
            engine.booking_to_slot.len()
        );

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Keep the lookup indexes in step with an event.
    fn apply_index(&self, event: &Event) {
        match event {
            Event::ItemCreated { id, name } => {
                self.items.insert(*id, ItemInfo { id: *id, name: name.clone() });
                self.item_slots.entry(*id).or_default();
            }
            Event::ItemDeleted { id } => {
                self.items.remove(id);
                self.item_slots.remove(id);
            }
            Event::UserCreated {
                id,
                login,
                full_name,
                birth_date,
                gender,
                role,
            } => {
                self.users.insert(
                    *id,
                    UserInfo {
                        id: *id,
                        login: login.clone(),
                        full_name: full_name.clone(),
                        birth_date: birth_date.clone(),
                        gender: gender.clone(),
                        role: *role,
                    },
                );
                self.logins.insert(login.clone(), *id);
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.logins.remove(&user.login);
                }
                self.user_bookings.remove(id);
            }
            Event::SlotCreated { id, item_id, span } => {
                let slot = SlotState::new(*id, *item_id, *span);
                self.slots.insert(*id, Arc::new(RwLock::new(slot)));
                self.item_slots.entry(*item_id).or_default().push(*id);
            }
            Event::SlotDeleted { id, item_id } => {
                self.slots.remove(id);
                if let Some(mut ids) = self.item_slots.get_mut(item_id) {
                    ids.retain(|s| s != id);
                }
            }
            Event::SlotAvailabilitySet { .. } => {}
            Event::BookingCreated {
                id,
                slot_id,
                user_id,
                ..
            } => {
                self.booking_to_slot.insert(*id, *slot_id);
                self.user_bookings.entry(*user_id).or_default().push(*id);
            }
            Event::BookingCancelled { id, user_id, .. } => {
                self.booking_to_slot.remove(id);
                if let Some(mut ids) = self.user_bookings.get_mut(user_id) {
                    ids.retain(|b| b != id);
                }
            }
        }
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
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("WAL append failed: {e}")))
    }

    /// Commit a slot-scoped event while the caller holds the slot's row lock.
    /// The WAL append is the commit point: if it fails nothing is applied.
    async fn commit_slot_event(
        &self,
        slot: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(slot, event);
        self.apply_index(event);
        Ok(())
    }

    /// Commit an event that only touches the indexes.
    async fn commit_index_event(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_index(event);
        Ok(())
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of every slot row. Map guards must not be held across an
    /// await, so callers lock rows from this list instead.
    fn slot_rows(&self) -> Vec<(Ulid, SharedSlotState)> {
        self.slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    fn user_lock(&self, user_id: Ulid) -> Arc<Mutex<()>> {
        self.user_locks.entry(user_id).or_default().clone()
    }

    /// Acquire the row lock of a live slot. Deleted rows read as missing.
    async fn lock_slot(
        &self,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let guard = slot.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }
}
