use std::collections::BTreeSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_window(window: &TimeWindow) -> Result<(), EngineError> {
    if window.end <= window.start {
        return Err(EngineError::Validation(format!(
            "end time must be after start time ({window})"
        )));
    }
    Ok(())
}

/// Deduplicate and sort requested dates.
pub(crate) fn normalize_dates(dates: &[NaiveDate]) -> Result<Vec<NaiveDate>, EngineError> {
    let unique: BTreeSet<NaiveDate> = dates.iter().copied().collect();
    if unique.is_empty() {
        return Err(EngineError::Validation("at least one date is required".into()));
    }
    if unique.len() > MAX_DATES_PER_REQUEST {
        return Err(EngineError::LimitExceeded("too many dates in one request"));
    }
    Ok(unique.into_iter().collect())
}

pub(crate) fn validate_reason(reason: Option<&str>) -> Result<String, EngineError> {
    let reason = reason.map(str::trim).unwrap_or_default();
    if reason.is_empty() {
        return Err(EngineError::Validation("a cancellation reason is required".into()));
    }
    if reason.chars().count() > MAX_REASON_LEN {
        return Err(EngineError::Validation(format!(
            "cancellation reason exceeds {MAX_REASON_LEN} characters"
        )));
    }
    Ok(reason.to_string())
}

/// Every pending or confirmed row on `date` whose window overlaps `window`.
/// Rejected and cancelled rows never conflict. No ordering guarantee.
pub fn find_conflicting<'a>(
    room: &'a RoomState,
    date: NaiveDate,
    window: TimeWindow,
) -> Vec<&'a Booking> {
    room.overlapping(date, window)
        .filter(|b| b.status.is_active())
        .collect()
}

/// Confirmed rows overlapping `window`, optionally ignoring one booking.
pub fn confirmed_conflicts<'a>(
    room: &'a RoomState,
    date: NaiveDate,
    window: TimeWindow,
    exclude: Option<Ulid>,
) -> Vec<&'a Booking> {
    room.overlapping(date, window)
        .filter(|b| b.status == BookingStatus::Confirmed && Some(b.id) != exclude)
        .collect()
}
