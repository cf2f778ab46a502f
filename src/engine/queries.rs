use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_window;
use super::queue::{pending_queue, position_for_new, position_of, QueuePosition};
use super::{Engine, EngineError, Entity};

impl Engine {
    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn user_by_name(&self, name: &str) -> Option<User> {
        let id = *self.user_names.get(name)?.value();
        self.user(&id)
    }

    /// The actor for a login name, if it belongs to a registered user.
    pub fn actor_for(&self, name: &str) -> Option<Actor> {
        self.user_by_name(name).map(|u| Actor {
            user_id: u.id,
            role: u.role,
        })
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    pub async fn room(&self, id: &Ulid) -> Option<RoomInfo> {
        let rs = self.get_room(id)?;
        let guard = rs.read().await;
        Some(RoomInfo {
            id: guard.id,
            name: guard.name.clone(),
            booking_count: guard.booking_count(),
        })
    }

    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(rooms.len());
        for rs in rooms {
            let guard = rs.read().await;
            out.push(RoomInfo {
                id: guard.id,
                name: guard.name.clone(),
                booking_count: guard.booking_count(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn settings(&self) -> Settings {
        self.settings.get().await
    }

    /// Pending and confirmed rows overlapping `window` on `date`.
    pub async fn find_conflicting(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
    ) -> Result<Vec<Booking>, EngineError> {
        validate_window(&window)?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(Entity::Room, room_id))?;
        let guard = rs.read().await;
        Ok(super::find_conflicting(&guard, date, window)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Pending rows overlapping `window` on `date`, oldest first.
    pub async fn get_queue(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
    ) -> Result<Vec<Booking>, EngineError> {
        validate_window(&window)?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(Entity::Room, room_id))?;
        let guard = rs.read().await;
        Ok(pending_queue(&guard, date, window).into_iter().cloned().collect())
    }

    /// 1-based position a new request for this slot would take.
    pub async fn next_queue_position(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
    ) -> Result<usize, EngineError> {
        validate_window(&window)?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(Entity::Room, room_id))?;
        let guard = rs.read().await;
        Ok(position_for_new(&guard, date, window).position())
    }

    /// Current position of a booking; `None` once it is no longer pending.
    pub async fn queue_position(&self, booking_id: Ulid) -> Result<Option<QueuePosition>, EngineError> {
        let booking = self.get_booking(booking_id).await?;
        let rs = self
            .get_room(&booking.room_id)
            .ok_or(EngineError::NotFound(Entity::Room, booking.room_id))?;
        let guard = rs.read().await;
        Ok(position_of(&guard, &booking))
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self
            .get_room_for_booking(&id)
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        let guard = rs.read().await;
        guard
            .get_booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, id))
    }

    /// Rows on a room, optionally limited to one date. Date order, then commit order.
    pub async fn get_bookings(&self, room_id: Ulid, date: Option<NaiveDate>) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(Entity::Room, room_id))?;
        let guard = rs.read().await;
        Ok(match date {
            Some(d) => guard.on_date(d).to_vec(),
            None => guard.bookings().cloned().collect(),
        })
    }

    pub async fn bookings_for_user(&self, user_id: Ulid) -> Vec<Booking> {
        let rooms: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            out.extend(guard.bookings().filter(|b| b.user_id == user_id).cloned());
        }
        out.sort_by_key(|b| (b.date, b.window.start, b.created_at));
        out
    }
}
