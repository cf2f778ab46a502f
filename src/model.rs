use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for `created_at` stamps.
pub type Ms = i64;

/// Half-open time-of-day window `[start, end)` on a single date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "window start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted windows.
    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

/// Accepts ISO `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingType {
    /// Claims an exclusive slot; blocked by confirmed conflicts.
    Booking,
    /// Queues behind whatever already holds the slot.
    Reservation,
}

impl BookingType {
    /// Unknown values fall back to `Booking`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "reservation" => BookingType::Reservation,
            _ => BookingType::Booking,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingType::Booking => "booking",
            BookingType::Reservation => "reservation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "rejected" => Some(BookingStatus::Rejected),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Only pending and confirmed rows take part in conflict detection.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            "super_admin" => Some(Role::SuperAdmin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }
}

/// Who is performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

/// One room, one date, one window. Multi-date requests become several rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub kind: BookingType,
    pub status: BookingStatus,
    pub cancellation_reason: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: String,
    /// Rows per date, in commit order.
    bookings: BTreeMap<NaiveDate, Vec<Booking>>,
    dates_by_id: HashMap<Ulid, NaiveDate>,
    /// Highest `created_at` handed out on this room.
    pub last_created_at: Ms,
}

impl RoomState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            bookings: BTreeMap::new(),
            dates_by_id: HashMap::new(),
            last_created_at: 0,
        }
    }

    /// Append a row to its date. Appending keeps rows of equal `created_at`
    /// in the order they were committed.
    pub fn insert_booking(&mut self, booking: Booking) {
        self.last_created_at = self.last_created_at.max(booking.created_at);
        self.dates_by_id.insert(booking.id, booking.date);
        self.bookings.entry(booking.date).or_default().push(booking);
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<&Booking> {
        let date = self.dates_by_id.get(id)?;
        self.bookings.get(date)?.iter().find(|b| b.id == *id)
    }

    pub fn get_booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        let date = self.dates_by_id.get(id)?;
        self.bookings.get_mut(date)?.iter_mut().find(|b| b.id == *id)
    }

    /// All rows on `date`, any status, commit order.
    pub fn on_date(&self, date: NaiveDate) -> &[Booking] {
        self.bookings.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Rows on `date` whose window overlaps `window`, any status.
    pub fn overlapping(&self, date: NaiveDate, window: TimeWindow) -> impl Iterator<Item = &Booking> {
        self.on_date(date)
            .iter()
            .filter(move |b| b.window.overlaps(&window))
    }

    pub fn booking_count(&self) -> usize {
        self.dates_by_id.len()
    }

    /// Every row, ordered by date then commit order.
    pub fn bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.values().flatten()
    }

    pub fn booking_ids(&self) -> impl Iterator<Item = &Ulid> {
        self.dates_by_id.keys()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    /// Login name; unique per tenant.
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// Wall-clock window in which non-admins may submit requests.
/// An `end` before `start` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingHours {
    pub fn within(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= now && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }

    pub fn message(&self) -> String {
        format!(
            "Bookings can only be submitted between {} and {}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

pub const DEFAULT_MAINTENANCE_MESSAGE: &str =
    "The system is under maintenance. New bookings are temporarily disabled.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub maintenance_mode: bool,
    pub maintenance_message: Option<String>,
    /// `None` = no restriction.
    pub working_hours: Option<WorkingHours>,
}

impl Settings {
    pub fn maintenance_message(&self) -> &str {
        self.maintenance_message
            .as_deref()
            .unwrap_or(DEFAULT_MAINTENANCE_MESSAGE)
    }

    /// Merge a partial update. Returns `None` if the result would carry
    /// only one end of the working-hours window.
    pub fn apply_patch(&self, patch: &SettingsPatch) -> Option<Settings> {
        let mut next = self.clone();
        if let Some(on) = patch.maintenance_mode {
            next.maintenance_mode = on;
        }
        if let Some(message) = &patch.maintenance_message {
            next.maintenance_message = message.clone();
        }

        let enabled = patch
            .working_hours_enabled
            .unwrap_or(self.working_hours.is_some() || patch.touches_hours());
        if !enabled {
            next.working_hours = None;
            return Some(next);
        }
        let start = patch
            .working_hours_start
            .or(self.working_hours.map(|w| w.start))?;
        let end = patch.working_hours_end.or(self.working_hours.map(|w| w.end))?;
        next.working_hours = Some(WorkingHours { start, end });
        Some(next)
    }
}

/// Partial settings update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub maintenance_mode: Option<bool>,
    /// `Some(None)` resets to the default message.
    pub maintenance_message: Option<Option<String>>,
    pub working_hours_start: Option<NaiveTime>,
    pub working_hours_end: Option<NaiveTime>,
    pub working_hours_enabled: Option<bool>,
}

impl SettingsPatch {
    fn touches_hours(&self) -> bool {
        self.working_hours_start.is_some() || self.working_hours_end.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        name: String,
    },
    RoomUpdated {
        id: Ulid,
        name: String,
    },
    /// Cascades to every booking on the room.
    RoomDeleted {
        id: Ulid,
    },
    UserCreated {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    },
    UserRoleChanged {
        id: Ulid,
        role: Role,
    },
    SettingsUpdated {
        settings: Settings,
    },
    /// One committed booking transaction. A single record, so replay sees
    /// either every row of the request or none.
    BookingsInserted {
        room_id: Ulid,
        bookings: Vec<Booking>,
    },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub booking_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn w(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeWindow {
        TimeWindow::new(t(h1, m1), t(h2, m2))
    }

    fn booking_on(date: NaiveDate, window: TimeWindow, created_at: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id: Ulid::new(),
            date,
            window,
            kind: BookingType::Booking,
            status: BookingStatus::Pending,
            cancellation_reason: None,
            created_at,
        }
    }

    #[test]
    fn window_overlap() {
        let a = w(9, 0, 10, 0);
        assert!(a.overlaps(&w(9, 30, 10, 30)));
        assert!(a.overlaps(&w(8, 0, 11, 0)));
        assert!(a.overlaps(&w(9, 15, 9, 45)));
        assert!(!a.overlaps(&w(10, 0, 11, 0))); // adjacent, not overlapping
        assert!(!a.overlaps(&w(8, 0, 9, 0)));
    }

    #[test]
    fn window_overlap_is_symmetric_and_reflexive() {
        let windows = [
            w(8, 0, 9, 0),
            w(8, 30, 9, 30),
            w(9, 0, 10, 0),
            w(9, 15, 9, 45),
            w(7, 0, 12, 0),
            w(10, 0, 10, 1),
        ];
        for a in &windows {
            assert!(a.overlaps(a));
            for b in &windows {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn window_try_new_rejects_empty_and_inverted() {
        assert!(TimeWindow::try_new(t(9, 0), t(9, 0)).is_none());
        assert!(TimeWindow::try_new(t(10, 0), t(9, 0)).is_none());
        assert!(TimeWindow::try_new(t(9, 0), t(9, 1)).is_some());
    }

    #[test]
    fn parse_times_and_dates() {
        assert_eq!(parse_time_of_day("09:30"), Some(t(9, 30)));
        assert_eq!(parse_time_of_day("09:30:00"), Some(t(9, 30)));
        assert_eq!(parse_time_of_day("9h30"), None);
        assert_eq!(
            parse_date("2025-03-10"),
            NaiveDate::from_ymd_opt(2025, 3, 10)
        );
        assert_eq!(parse_date("2025-02-30"), None);
    }

    #[test]
    fn booking_type_defaults_to_booking() {
        assert_eq!(BookingType::parse_lenient("reservation"), BookingType::Reservation);
        assert_eq!(BookingType::parse_lenient("RESERVATION"), BookingType::Reservation);
        assert_eq!(BookingType::parse_lenient("booking"), BookingType::Booking);
        assert_eq!(BookingType::parse_lenient("whatever"), BookingType::Booking);
        assert_eq!(BookingType::parse_lenient(""), BookingType::Booking);
    }

    #[test]
    fn status_activity() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Confirmed.is_active());
        assert!(!BookingStatus::Rejected.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
    }

    #[test]
    fn role_admin_flags() {
        assert!(!Role::User.is_admin());
        assert!(Role::Admin.is_admin());
        assert!(Role::SuperAdmin.is_admin());
        assert_eq!(Role::parse("super_admin"), Some(Role::SuperAdmin));
        assert_eq!(Role::parse("root"), None);
    }

    #[test]
    fn room_keeps_commit_order_on_equal_timestamps() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let mut room = RoomState::new(Ulid::new(), "Room 5".into());
        let ids: Vec<Ulid> = (0..3)
            .map(|_| {
                let b = booking_on(date, w(9, 0, 10, 0), 1000);
                let id = b.id;
                room.insert_booking(b);
                id
            })
            .collect();
        let stored: Vec<Ulid> = room.on_date(date).iter().map(|b| b.id).collect();
        assert_eq!(stored, ids);
        assert_eq!(room.booking_count(), 3);
        assert_eq!(room.last_created_at, 1000);
    }

    #[test]
    fn room_overlapping_is_scoped_to_date() {
        let d1 = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2025, 3, 11).unwrap();
        let mut room = RoomState::new(Ulid::new(), "Room".into());
        room.insert_booking(booking_on(d1, w(9, 0, 10, 0), 1));
        room.insert_booking(booking_on(d2, w(9, 0, 10, 0), 2));
        room.insert_booking(booking_on(d1, w(10, 0, 11, 0), 3));

        let hits: Vec<_> = room.overlapping(d1, w(9, 30, 9, 45)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].date, d1);
        assert!(room.overlapping(NaiveDate::from_ymd_opt(2025, 3, 12).unwrap(), w(9, 0, 10, 0)).next().is_none());
    }

    #[test]
    fn room_lookup_and_mutate_by_id() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let mut room = RoomState::new(Ulid::new(), "Room".into());
        let b = booking_on(date, w(9, 0, 10, 0), 1);
        let id = b.id;
        room.insert_booking(b);

        room.get_booking_mut(&id).unwrap().status = BookingStatus::Confirmed;
        assert_eq!(room.get_booking(&id).unwrap().status, BookingStatus::Confirmed);
        assert!(room.get_booking(&Ulid::new()).is_none());
    }

    #[test]
    fn working_hours_window() {
        let wh = WorkingHours { start: t(8, 0), end: t(18, 0) };
        assert!(wh.within(t(8, 0)));
        assert!(wh.within(t(17, 59)));
        assert!(!wh.within(t(18, 0))); // half-open
        assert!(!wh.within(t(7, 59)));
        assert_eq!(wh.message(), "Bookings can only be submitted between 08:00 and 18:00");
    }

    #[test]
    fn working_hours_wrap_midnight() {
        let wh = WorkingHours { start: t(22, 0), end: t(6, 0) };
        assert!(wh.within(t(23, 0)));
        assert!(wh.within(t(5, 59)));
        assert!(!wh.within(t(6, 0)));
        assert!(!wh.within(t(12, 0)));
    }

    #[test]
    fn settings_patch_merges() {
        let base = Settings::default();
        let patched = base
            .apply_patch(&SettingsPatch {
                working_hours_start: Some(t(8, 0)),
                working_hours_end: Some(t(18, 0)),
                ..SettingsPatch::default()
            })
            .unwrap();
        assert_eq!(patched.working_hours, Some(WorkingHours { start: t(8, 0), end: t(18, 0) }));

        // Moving one end keeps the other.
        let moved = patched
            .apply_patch(&SettingsPatch {
                working_hours_end: Some(t(20, 0)),
                maintenance_mode: Some(true),
                ..SettingsPatch::default()
            })
            .unwrap();
        assert_eq!(moved.working_hours, Some(WorkingHours { start: t(8, 0), end: t(20, 0) }));
        assert!(moved.maintenance_mode);

        let disabled = moved
            .apply_patch(&SettingsPatch {
                working_hours_enabled: Some(false),
                ..SettingsPatch::default()
            })
            .unwrap();
        assert_eq!(disabled.working_hours, None);
    }

    #[test]
    fn settings_patch_needs_both_ends() {
        let base = Settings::default();
        assert!(base
            .apply_patch(&SettingsPatch {
                working_hours_start: Some(t(8, 0)),
                ..SettingsPatch::default()
            })
            .is_none());
        assert!(base
            .apply_patch(&SettingsPatch {
                working_hours_enabled: Some(true),
                ..SettingsPatch::default()
            })
            .is_none());
    }

    #[test]
    fn settings_patch_resets_message() {
        let base = Settings {
            maintenance_message: Some("Back soon".into()),
            ..Settings::default()
        };
        let reset = base
            .apply_patch(&SettingsPatch {
                maintenance_message: Some(None),
                ..SettingsPatch::default()
            })
            .unwrap();
        assert_eq!(reset.maintenance_message(), DEFAULT_MAINTENANCE_MESSAGE);
        assert!(SettingsPatch::default().is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let room_id = Ulid::new();
        let event = Event::BookingsInserted {
            room_id,
            bookings: vec![booking_on(date, w(9, 0, 10, 0), 42)],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
