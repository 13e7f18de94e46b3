use std::collections::{HashMap, HashSet};

use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::schedule::day_slots;
use super::{validate_day, Engine, EngineError, WalCommand};

fn validate_slot_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end <= start {
        return Err(EngineError::LimitExceeded("slot must end after it starts"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() < MIN_SLOT_DURATION_MS || span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot duration out of range"));
    }
    Ok(span)
}

fn validate_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::LimitExceeded(what));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    // ── Items ───────────────────────────────────────────────

    pub async fn create_item(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        validate_text(&name, MAX_NAME_LEN, "item name empty or too long")?;
        let _catalog = self.catalog_lock.lock().await;
        if self.items.len() >= MAX_ITEMS {
            return Err(EngineError::LimitExceeded("too many items"));
        }
        if self.items.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.commit_index_event(&Event::ItemCreated { id, name }).await?;
        info!("item {id} created");
        Ok(())
    }

    /// Delete an item together with its slots and any bookings on them.
    pub async fn delete_item(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.items.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let mut slot_ids = self
            .item_slots
            .get(&id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        slot_ids.sort();
        for slot_id in slot_ids {
            let mut slot = match self.lock_slot(slot_id).await {
                Ok(slot) => slot,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            self.remove_locked_slot(&mut slot).await?;
        }
        self.commit_index_event(&Event::ItemDeleted { id }).await?;
        info!("item {id} deleted");
        Ok(())
    }

    // ── Users ───────────────────────────────────────────────

    pub async fn create_user(
        &self,
        id: Ulid,
        login: String,
        full_name: String,
        birth_date: Option<String>,
        gender: Option<String>,
        role: Role,
    ) -> Result<(), EngineError> {
        validate_text(&login, MAX_LOGIN_LEN, "login empty or too long")?;
        validate_text(&full_name, MAX_PROFILE_FIELD_LEN, "full name empty or too long")?;
        for field in [&birth_date, &gender].into_iter().flatten() {
            if field.len() > MAX_PROFILE_FIELD_LEN {
                return Err(EngineError::LimitExceeded("profile field too long"));
            }
        }

        let _catalog = self.catalog_lock.lock().await;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.logins.contains_key(&login) {
            return Err(EngineError::DuplicateLogin(login));
        }
        let event = Event::UserCreated {
            id,
            login,
            full_name,
            birth_date,
            gender,
            role,
        };
        self.commit_index_event(&event).await?;
        info!("user {id} created with role {role}");
        Ok(())
    }

    /// Delete a user, cancelling their bookings.
    ///
    /// With `role` set, only a user of that role matches; anything else is
    /// `NotFound`. Managers pass `Some(Role::User)`.
    pub async fn delete_user(&self, id: Ulid, role: Option<Role>) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        match self.users.get(&id) {
            Some(user) if role.is_none_or(|r| r == user.role) => {}
            _ => return Err(EngineError::NotFound(id)),
        }

        // Lock order is slot rows, then the user. A booking may slip in between
        // the snapshot and taking the user lock; start over if it did.
        loop {
            let snapshot = self.user_booking_ids(id);
            let mut slot_ids: Vec<Ulid> = snapshot
                .iter()
                .filter_map(|b| self.booking_to_slot.get(b).map(|e| *e.value()))
                .collect();
            slot_ids.sort();
            slot_ids.dedup();

            let mut guards: HashMap<Ulid, OwnedRwLockWriteGuard<SlotState>> = HashMap::new();
            for slot_id in &slot_ids {
                guards.insert(*slot_id, self.lock_slot(*slot_id).await?);
            }
            let user_lock = self.user_lock(id);
            let _quota_guard = user_lock.lock().await;

            let current = self.user_booking_ids(id);
            let unchanged = current.len() == snapshot.len()
                && current.iter().all(|b| snapshot.contains(b));
            if !unchanged {
                debug!("user {id} bookings changed during delete, retrying");
                continue;
            }

            for (slot_id, slot) in guards.iter_mut() {
                if let Some(booking) = slot.booking.clone()
                    && booking.user_id == id
                {
                    let event = Event::BookingCancelled {
                        id: booking.id,
                        slot_id: *slot_id,
                        user_id: id,
                    };
                    self.commit_slot_event(slot, &event).await?;
                }
            }
            self.commit_index_event(&Event::UserDeleted { id }).await?;
            info!("user {id} deleted, {} bookings released", current.len());
            return Ok(());
        }
    }

    pub(super) fn user_booking_ids(&self, user_id: Ulid) -> Vec<Ulid> {
        self.user_bookings
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Slots ───────────────────────────────────────────────

    pub async fn create_slot(
        &self,
        id: Ulid,
        item_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<(), EngineError> {
        let span = validate_slot_span(start, end)?;
        let _catalog = self.catalog_lock.lock().await;
        self.check_slot_capacity(item_id, 1)?;
        if self.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.commit_index_event(&Event::SlotCreated { id, item_id, span }).await
    }

    /// Create the configured day's worth of slots for an item. Start times that
    /// already have a slot are skipped, so calling twice is harmless.
    pub async fn generate_slots(&self, item_id: Ulid, day: Ms) -> Result<Vec<Ulid>, EngineError> {
        let day = validate_day(day)?;
        let spans = day_slots(day, &self.config.schedule);
        for span in &spans {
            validate_slot_span(span.start, span.end)?;
        }
        let _catalog = self.catalog_lock.lock().await;
        if !self.items.contains_key(&item_id) {
            return Err(EngineError::NotFound(item_id));
        }

        let mut taken = HashSet::new();
        for slot_id in self.item_slot_ids(item_id) {
            if let Some(slot) = self.get_slot(&slot_id) {
                taken.insert(slot.read().await.span.start);
            }
        }
        let fresh: Vec<Span> = spans.into_iter().filter(|s| !taken.contains(&s.start)).collect();
        self.check_slot_capacity(item_id, fresh.len())?;

        let mut created = Vec::with_capacity(fresh.len());
        for span in fresh {
            let id = Ulid::new();
            self.commit_index_event(&Event::SlotCreated { id, item_id, span }).await?;
            created.push(id);
        }
        info!("generated {} slots for item {item_id} on day {day}", created.len());
        Ok(created)
    }

    /// Delete a slot. A booking on it is deleted as well.
    pub async fn delete_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut slot = self.lock_slot(id).await?;
        self.remove_locked_slot(&mut slot).await
    }

    async fn remove_locked_slot(&self, slot: &mut SlotState) -> Result<(), EngineError> {
        if let Some(booking) = slot.booking.clone() {
            let event = Event::BookingCancelled {
                id: booking.id,
                slot_id: slot.id,
                user_id: booking.user_id,
            };
            self.commit_slot_event(slot, &event).await?;
        }
        let event = Event::SlotDeleted {
            id: slot.id,
            item_id: slot.item_id,
        };
        self.commit_slot_event(slot, &event).await
    }

    pub(super) fn item_slot_ids(&self, item_id: Ulid) -> Vec<Ulid> {
        self.item_slots
            .get(&item_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn check_slot_capacity(&self, item_id: Ulid, adding: usize) -> Result<(), EngineError> {
        let existing = self
            .item_slots
            .get(&item_id)
            .map(|e| e.value().len())
            .ok_or(EngineError::NotFound(item_id))?;
        if existing + adding > MAX_SLOTS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many slots for item"));
        }
        Ok(())
    }

    // ── WAL maintenance ─────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Holds the catalog lock and a read lock on every slot row until the new
    /// file is in place, so no commit can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut events = Vec::new();

        for entry in self.items.iter() {
            events.push(Event::ItemCreated {
                id: entry.id,
                name: entry.name.clone(),
            });
        }
        for entry in self.users.iter() {
            let u = entry.value();
            events.push(Event::UserCreated {
                id: u.id,
                login: u.login.clone(),
                full_name: u.full_name.clone(),
                birth_date: u.birth_date.clone(),
                gender: u.gender.clone(),
                role: u.role,
            });
        }

        let mut rows = self.slot_rows();
        rows.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(rows.len());
        for (_, slot) in rows {
            guards.push(slot.read_owned().await);
        }
        for slot in &guards {
            events.push(Event::SlotCreated {
                id: slot.id,
                item_id: slot.item_id,
                span: slot.span,
            });
            match &slot.booking {
                Some(b) => events.push(Event::BookingCreated {
                    id: b.id,
                    slot_id: slot.id,
                    user_id: b.user_id,
                    created_at: b.created_at,
                }),
                None if !slot.available => events.push(Event::SlotAvailabilitySet {
                    id: slot.id,
                    available: false,
                }),
                None => {}
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("WAL compaction failed: {e}")))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
