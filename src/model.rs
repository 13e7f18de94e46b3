use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Calendar day as the UTC midnight of that day, in ms.
pub fn day_of(t: Ms) -> Ms {
    t - t.rem_euclid(DAY_MS)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn day(&self) -> Ms {
        day_of(self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Manager,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "user" => Some(Role::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The booking that currently owns a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: Ulid,
    pub user_id: Ulid,
    pub created_at: Ms,
}

/// One bookable slot. `available` is false iff the slot is booked or blocked.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub item_id: Ulid,
    pub span: Span,
    pub available: bool,
    pub booking: Option<BookingRecord>,
    /// Set once the slot has been removed; lock holders that raced the delete
    /// must treat the slot as gone.
    pub deleted: bool,
}

impl SlotState {
    pub fn new(id: Ulid, item_id: Ulid, span: Span) -> Self {
        Self {
            id,
            item_id,
            span,
            available: true,
            booking: None,
            deleted: false,
        }
    }

    /// Unavailable with no owning booking.
    pub fn is_blocked(&self) -> bool {
        !self.available && self.booking.is_none()
    }
}

/// WAL record format. Cascades are written as sequences of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ItemCreated {
        id: Ulid,
        name: String,
    },
    ItemDeleted {
        id: Ulid,
    },
    UserCreated {
        id: Ulid,
        login: String,
        full_name: String,
        birth_date: Option<String>,
        gender: Option<String>,
        role: Role,
    },
    UserDeleted {
        id: Ulid,
    },
    SlotCreated {
        id: Ulid,
        item_id: Ulid,
        span: Span,
    },
    SlotDeleted {
        id: Ulid,
        item_id: Ulid,
    },
    /// Block (`available: false`) or unblock a slot that has no booking.
    SlotAvailabilitySet {
        id: Ulid,
        available: bool,
    },
    BookingCreated {
        id: Ulid,
        slot_id: Ulid,
        user_id: Ulid,
        created_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        user_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub login: String,
    pub full_name: String,
    pub birth_date: Option<String>,
    pub gender: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub item_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub user_id: Ulid,
    pub slot_id: Ulid,
    pub item_id: Ulid,
    pub item_name: String,
    pub start: Ms,
    pub end: Ms,
    pub created_at: Ms,
}
