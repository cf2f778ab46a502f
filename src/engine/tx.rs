use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Staged rows for one booking request against one room.
///
/// Rows are checked as they are staged; nothing touches the room until the
/// caller turns the transaction into a single `BookingsInserted` event and
/// commits it. Dropping a `BookingTx` discards everything staged.
pub(crate) struct BookingTx<'a> {
    room: &'a RoomState,
    staged: Vec<Booking>,
    ids: HashSet<Ulid>,
    max_rows: usize,
}

impl<'a> BookingTx<'a> {
    pub fn begin(room: &'a RoomState, max_rows: usize) -> Self {
        Self {
            room,
            staged: Vec::new(),
            ids: HashSet::new(),
            max_rows,
        }
    }

    pub fn insert(&mut self, booking: Booking) -> Result<(), EngineError> {
        if booking.room_id != self.room.id {
            return Err(EngineError::TransactionFailed(format!(
                "row {} targets room {} inside a transaction on room {}",
                booking.id, booking.room_id, self.room.id
            )));
        }
        if self.room.booking_count() + self.staged.len() >= self.max_rows {
            return Err(EngineError::TransactionFailed(format!(
                "room {} is full ({} bookings)",
                self.room.id, self.max_rows
            )));
        }
        if self.room.get_booking(&booking.id).is_some() || !self.ids.insert(booking.id) {
            return Err(EngineError::TransactionFailed(format!(
                "duplicate booking id {}",
                booking.id
            )));
        }
        self.staged.push(booking);
        Ok(())
    }

    pub fn staged(&self) -> &[Booking] {
        &self.staged
    }

    /// The WAL record that commits every staged row at once.
    pub fn into_event(self) -> Event {
        Event::BookingsInserted {
            room_id: self.room.id,
            bookings: self.staged,
        }
    }
}
