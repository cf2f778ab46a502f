use chrono::NaiveDate;
use serde::Serialize;

use crate::model::*;

/// Where a request sits among pending requests for the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueuePosition {
    /// Earlier pending requests overlapping the same window.
    pub ahead: usize,
}

impl QueuePosition {
    /// 1-based rank.
    pub fn position(&self) -> usize {
        self.ahead + 1
    }
}

/// Pending rows on `date` overlapping `window`, oldest first.
///
/// Never stored: recomputed from current rows, so a position advances on its
/// own as earlier entries are confirmed, rejected or cancelled. The sort is
/// stable and rows are kept in commit order, so equal `created_at` values
/// never swap places.
pub fn pending_queue<'a>(room: &'a RoomState, date: NaiveDate, window: TimeWindow) -> Vec<&'a Booking> {
    let mut queue: Vec<&Booking> = room
        .overlapping(date, window)
        .filter(|b| b.status == BookingStatus::Pending)
        .collect();
    queue.sort_by_key(|b| b.created_at);
    queue
}

/// Position a new request would take: always the back of the queue,
/// whatever its type.
pub fn position_for_new(room: &RoomState, date: NaiveDate, window: TimeWindow) -> QueuePosition {
    QueuePosition {
        ahead: pending_queue(room, date, window).len(),
    }
}

/// Position of an existing pending row, counting only earlier pending rows
/// that overlap it. `None` if the row is not pending.
pub fn position_of(room: &RoomState, booking: &Booking) -> Option<QueuePosition> {
    if booking.status != BookingStatus::Pending {
        return None;
    }
    let queue = pending_queue(room, booking.date, booking.window);
    queue
        .iter()
        .position(|b| b.id == booking.id)
        .map(|ahead| QueuePosition { ahead })
}
