use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::observability::{BOOKINGS_CANCELLED_TOTAL, BOOKINGS_CREATED_TOTAL, BOOKINGS_REJECTED_TOTAL};

use super::{now_ms, validate_day, Engine, EngineError};

impl Engine {
    /// Book a slot for a user. Returns the new booking id.
    ///
    /// The slot's row lock is held from the availability read through commit,
    /// so concurrent bookings of one slot serialize and all but the first see
    /// `Conflict`. Bookings of different slots never wait on each other unless
    /// they come from the same user, whose quota check is serialized too.
    pub async fn book(&self, slot_id: Ulid, user_id: Ulid) -> Result<Ulid, EngineError> {
        let result = self.book_locked(slot_id, user_id).await;
        match &result {
            Ok(id) => {
                metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
                debug!("booking {id} created: slot {slot_id}, user {user_id}");
            }
            Err(e) => {
                metrics::counter!(BOOKINGS_REJECTED_TOTAL, "reason" => e.kind()).increment(1);
                debug!("booking of slot {slot_id} by {user_id} rejected: {e}");
            }
        }
        result
    }

    async fn book_locked(&self, slot_id: Ulid, user_id: Ulid) -> Result<Ulid, EngineError> {
        let mut slot = self.lock_slot(slot_id).await?;
        if !slot.available {
            return Err(EngineError::Conflict(slot_id));
        }

        let user_lock = self.user_lock(user_id);
        let _quota_guard = user_lock.lock().await;
        let quota = self.config.booking_quota;
        if self.booking_count(user_id) >= quota as usize {
            return Err(EngineError::QuotaExceeded(quota));
        }

        let id = Ulid::new();
        let event = Event::BookingCreated {
            id,
            slot_id,
            user_id,
            created_at: now_ms(),
        };
        self.commit_slot_event(&mut slot, &event).await?;
        Ok(id)
    }

    /// Cancel a booking owned by `user_id`.
    ///
    /// Ownership is part of the lookup: a booking that exists but belongs to
    /// someone else is reported exactly like one that doesn't exist.
    pub async fn cancel(&self, booking_id: Ulid, user_id: Ulid) -> Result<(), EngineError> {
        let not_found = || EngineError::NotFound(booking_id);
        let slot_id = self
            .booking_to_slot
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or_else(not_found)?;
        let mut slot = self.lock_slot(slot_id).await.map_err(|_| not_found())?;

        // Re-check under the lock: the booking may have been cancelled or the
        // slot re-booked while we waited.
        match &slot.booking {
            Some(b) if b.id == booking_id && b.user_id == user_id => {}
            _ => return Err(not_found()),
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
            user_id,
        };
        self.commit_slot_event(&mut slot, &event).await?;
        metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
        debug!("booking {booking_id} cancelled: slot {slot_id} available again");
        Ok(())
    }

    /// Withdraw a slot from circulation without creating a booking.
    /// A booked slot is left as is; it is already unavailable.
    pub async fn block_slot(&self, slot_id: Ulid) -> Result<(), EngineError> {
        let mut slot = self.lock_slot(slot_id).await?;
        if !slot.available {
            return Ok(());
        }
        let event = Event::SlotAvailabilitySet {
            id: slot_id,
            available: false,
        };
        self.commit_slot_event(&mut slot, &event).await?;
        debug!("slot {slot_id} blocked");
        Ok(())
    }

    /// Put a blocked slot back into circulation. A booked slot can only be
    /// freed by cancelling its booking.
    pub async fn unblock_slot(&self, slot_id: Ulid) -> Result<(), EngineError> {
        let mut slot = self.lock_slot(slot_id).await?;
        if slot.booking.is_some() {
            return Err(EngineError::Conflict(slot_id));
        }
        if slot.available {
            return Ok(());
        }
        let event = Event::SlotAvailabilitySet {
            id: slot_id,
            available: true,
        };
        self.commit_slot_event(&mut slot, &event).await?;
        debug!("slot {slot_id} unblocked");
        Ok(())
    }

    /// Block or unblock every slot on a calendar day. Booked slots are never
    /// touched. Returns how many slots changed.
    pub async fn set_day_availability(&self, day: Ms, available: bool) -> Result<usize, EngineError> {
        let day = validate_day(day)?;
        let mut ids = Vec::new();
        for (id, slot) in self.slot_rows() {
            if slot.read().await.span.day() == day {
                ids.push(id);
            }
        }
        ids.sort();

        let mut changed = 0;
        for id in ids {
            let mut slot = match self.lock_slot(id).await {
                Ok(slot) => slot,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if slot.booking.is_some() || slot.available == available {
                continue;
            }
            let event = Event::SlotAvailabilitySet { id, available };
            self.commit_slot_event(&mut slot, &event).await?;
            changed += 1;
        }
        debug!("day {day}: {changed} slots set available={available}");
        Ok(changed)
    }
}
