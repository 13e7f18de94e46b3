use std::collections::BTreeSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{validate_day, Engine, EngineError};

impl Engine {
    /// Active bookings held by a user.
    pub fn booking_count(&self, user_id: Ulid) -> usize {
        self.user_bookings
            .get(&user_id)
            .map_or(0, |e| e.value().len())
    }

    pub fn list_items(&self) -> Vec<ItemInfo> {
        let mut items: Vec<ItemInfo> = self.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        items
    }

    pub fn get_user(&self, id: &Ulid) -> Option<UserInfo> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn list_users(&self, role: Role) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self
            .users
            .iter()
            .filter(|e| e.role == role)
            .map(|e| e.value().clone())
            .collect();
        users.sort_by(|a, b| a.login.cmp(&b.login));
        users
    }

    pub async fn slot_info(&self, id: Ulid) -> Result<SlotInfo, EngineError> {
        let slot = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let guard = slot.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(SlotInfo {
            id,
            item_id: guard.item_id,
            start: guard.span.start,
            end: guard.span.end,
            available: guard.available,
        })
    }

    /// Available slots of an item on one day, ordered by start.
    pub async fn available_slots(&self, item_id: Ulid, day: Ms) -> Result<Vec<SlotInfo>, EngineError> {
        let day = validate_day(day)?;
        let mut slots = Vec::new();
        for slot_id in self.item_slot_ids(item_id) {
            let Some(slot) = self.get_slot(&slot_id) else {
                continue;
            };
            let guard = slot.read().await;
            if guard.available && !guard.deleted && guard.span.day() == day {
                slots.push(SlotInfo {
                    id: guard.id,
                    item_id,
                    start: guard.span.start,
                    end: guard.span.end,
                    available: true,
                });
            }
        }
        slots.sort_by_key(|s| (s.start, s.id));
        Ok(slots)
    }

    /// Days in `[from, to]` with at least one available slot, ascending.
    pub async fn available_days(&self, from: Ms, to: Ms) -> Result<Vec<Ms>, EngineError> {
        let (from, to) = (validate_day(from)?, validate_day(to)?);
        if to < from {
            return Ok(Vec::new());
        }
        if to - from > MAX_DAY_RANGE {
            return Err(EngineError::LimitExceeded("day range too wide"));
        }
        let mut days = BTreeSet::new();
        for (_, slot) in self.slot_rows() {
            let guard = slot.read().await;
            let day = guard.span.day();
            if guard.available && !guard.deleted && (from..=to).contains(&day) {
                days.insert(day);
            }
        }
        Ok(days.into_iter().collect())
    }

    /// A user's bookings joined with slot and item, ordered by slot start.
    pub async fn user_bookings(&self, user_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let mut bookings = Vec::new();
        for booking_id in self.user_booking_ids(user_id) {
            let Some(slot_id) = self.booking_to_slot.get(&booking_id).map(|e| *e.value()) else {
                continue;
            };
            let Some(slot) = self.get_slot(&slot_id) else {
                continue;
            };
            let guard = slot.read().await;
            let Some(record) = guard.booking.as_ref().filter(|b| b.id == booking_id) else {
                continue;
            };
            let item_name = self
                .items
                .get(&guard.item_id)
                .map(|e| e.name.clone())
                .unwrap_or_default();
            bookings.push(BookingInfo {
                id: booking_id,
                user_id,
                slot_id,
                item_id: guard.item_id,
                item_name,
                start: guard.span.start,
                end: guard.span.end,
                created_at: record.created_at,
            });
        }
        bookings.sort_by_key(|b| (b.start, b.id));
        Ok(bookings)
    }
}
