use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveTime;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability::{
    BOOKINGS_CREATED_TOTAL, BOOKING_CONFLICTS_TOTAL, POLICY_REJECTIONS_TOTAL, STATUS_CHANGES_TOTAL,
};

use super::conflict::{
    confirmed_conflicts, find_conflicting, normalize_dates, now_ms, validate_reason, validate_window,
};
use super::policy::check_policy;
use super::queue::position_for_new;
use super::transition::check_transition;
use super::tx::BookingTx;
use super::{apply_to_room, BookingRequest, CreatedRequest, Engine, EngineError, Entity, WalCommand};

fn validate_name(what: &str, name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(name.to_string())
}

impl Engine {
    /// Submit a request using the server's local time for the policy gate.
    pub async fn create_booking_request(
        &self,
        actor: &Actor,
        req: BookingRequest,
    ) -> Result<CreatedRequest, EngineError> {
        self.create_booking_request_at(actor, req, chrono::Local::now().time())
            .await
    }

    /// Create one pending row per requested date, all or nothing.
    ///
    /// A `Booking` request is refused outright if any date already has a
    /// confirmed overlapping row. A `Reservation` is always admitted and
    /// joins the back of the queue. The room's write lock is held from the
    /// conflict scan until the rows are committed.
    pub async fn create_booking_request_at(
        &self,
        actor: &Actor,
        req: BookingRequest,
        now: NaiveTime,
    ) -> Result<CreatedRequest, EngineError> {
        validate_window(&req.window)?;
        let dates = normalize_dates(&req.dates)?;

        if let Err(rejection) = check_policy(self.settings_provider.as_ref(), actor.role, now).await {
            metrics::counter!(POLICY_REJECTIONS_TOTAL, "code" => rejection.code()).increment(1);
            return Err(rejection.into());
        }

        let user = self
            .user(&actor.user_id)
            .ok_or(EngineError::NotFound(Entity::User, actor.user_id))?;
        let rs = self
            .get_room(&req.room_id)
            .ok_or(EngineError::NotFound(Entity::Room, req.room_id))?;
        let mut guard = rs.write().await;
        // The room may have been deleted while we waited for the lock.
        if !self.state.contains_key(&req.room_id) {
            return Err(EngineError::NotFound(Entity::Room, req.room_id));
        }

        let mut queue_positions = BTreeMap::new();
        let mut blocked_dates = Vec::new();
        let mut blocking = Vec::new();
        for &date in &dates {
            let conflicts = find_conflicting(&guard, date, req.window);
            if conflicts.is_empty() {
                continue;
            }
            let confirmed: Vec<Ulid> = conflicts
                .iter()
                .filter(|b| b.status == BookingStatus::Confirmed)
                .map(|b| b.id)
                .collect();
            if !confirmed.is_empty() {
                blocked_dates.push(date);
                blocking.extend(confirmed);
            }
            // Any overlap means waiting, even when only a confirmed row is ahead.
            queue_positions.insert(date, position_for_new(&guard, date, req.window));
        }

        if req.kind == BookingType::Booking && !blocked_dates.is_empty() {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            tracing::debug!(
                "booking request by {} on room {} blocked on {} date(s)",
                actor.user_id,
                req.room_id,
                blocked_dates.len()
            );
            return Err(EngineError::Conflict {
                dates: blocked_dates,
                bookings: blocking,
            });
        }

        // Non-decreasing per room, so a clock step back cannot reorder a queue.
        let created_at = now_ms().max(guard.last_created_at);
        let mut tx = BookingTx::begin(&guard, self.config.max_bookings_per_room);
        for &date in &dates {
            tx.insert(Booking {
                id: Ulid::new(),
                user_id: actor.user_id,
                room_id: req.room_id,
                date,
                window: req.window,
                kind: req.kind,
                status: BookingStatus::Pending,
                cancellation_reason: None,
                created_at,
            })?;
        }
        let bookings = tx.staged().to_vec();
        let event = tx.into_event();

        self.wal_append(&event)
            .await
            .map_err(|e| EngineError::TransactionFailed(e.to_string()))?;
        apply_to_room(&mut guard, &event, &self.booking_to_room);
        let room_name = guard.name.clone();
        drop(guard);

        metrics::counter!(BOOKINGS_CREATED_TOTAL, "type" => req.kind.as_str())
            .increment(bookings.len() as u64);
        tracing::info!(
            "user {} requested {} {} row(s) on room {} at {}",
            user.name,
            bookings.len(),
            req.kind.as_str(),
            req.room_id,
            req.window
        );

        let notices = bookings
            .iter()
            .map(|b| Notice::request_received(&user, &room_name, b, queue_positions.get(&b.date).copied()))
            .collect();
        self.notify.publish(notices);

        Ok(CreatedRequest {
            bookings,
            queue_positions,
        })
    }

    /// Move a booking to `status` on behalf of `actor`.
    ///
    /// Cancellation requires a reason. With `confirm_guard` enabled a
    /// confirmation is refused while another confirmed row overlaps.
    pub async fn set_status(
        &self,
        booking_id: Ulid,
        status: BookingStatus,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Booking, EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let current = guard
            .get_booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, booking_id))?;

        check_transition(&current, status, actor)?;
        let reason = match status {
            BookingStatus::Cancelled => Some(validate_reason(reason)?),
            _ => None,
        };

        if status == BookingStatus::Confirmed && self.config.confirm_guard {
            let clashes: Vec<Ulid> =
                confirmed_conflicts(&guard, current.date, current.window, Some(booking_id))
                    .iter()
                    .map(|b| b.id)
                    .collect();
            if !clashes.is_empty() {
                metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::Conflict {
                    dates: vec![current.date],
                    bookings: clashes,
                });
            }
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            room_id,
            status,
            reason,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .get_booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, booking_id))?;
        let room_name = guard.name.clone();
        drop(guard);

        metrics::counter!(STATUS_CHANGES_TOTAL, "status" => status.as_str()).increment(1);
        if status == BookingStatus::Cancelled {
            tracing::info!("booking {booking_id} cancelled by its owner {}", actor.user_id);
        } else {
            tracing::info!(
                target: "audit",
                action = "review_booking",
                actor = %actor.user_id,
                booking = %booking_id,
                status = status.as_str(),
                "booking {booking_id} {status}"
            );
        }

        match self.user(&updated.user_id) {
            Some(owner) => {
                let mut notices: Vec<Notice> =
                    Notice::status_changed(&owner, &room_name, &updated).into_iter().collect();
                if status == BookingStatus::Cancelled {
                    notices.push(Notice::cancellation_alert(
                        &self.config.admin_email,
                        &owner.name,
                        &room_name,
                        &updated,
                    ));
                }
                self.notify.publish(notices);
            }
            None => tracing::warn!("booking {booking_id} has no known owner; no notice sent"),
        }

        Ok(updated)
    }

    /// Confirm or reject a pending booking.
    pub async fn review_booking(
        &self,
        booking_id: Ulid,
        status: BookingStatus,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        if !matches!(status, BookingStatus::Confirmed | BookingStatus::Rejected) {
            return Err(EngineError::Validation(format!(
                "review must confirm or reject, not {status}"
            )));
        }
        self.set_status(booking_id, status, actor, None).await
    }

    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor: &Actor,
        reason: &str,
    ) -> Result<Booking, EngineError> {
        self.set_status(booking_id, BookingStatus::Cancelled, actor, Some(reason))
            .await
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, id: Ulid, name: &str) -> Result<(), EngineError> {
        let name = validate_name("room name", name)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.state.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(RoomState::new(id, name.clone()))));
        tracing::info!(target: "audit", action = "create_room", room = %id, "room {name:?} created");
        Ok(())
    }

    pub async fn rename_room(&self, id: Ulid, name: &str) -> Result<(), EngineError> {
        let name = validate_name("room name", name)?;
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(Entity::Room, id))?;
        let mut guard = rs.write().await;
        let event = Event::RoomUpdated { id, name };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete a room and every booking on it. Returns the number of bookings removed.
    pub async fn delete_room(&self, id: Ulid) -> Result<usize, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(Entity::Room, id))?;
        let guard = rs.write().await;

        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        for booking_id in guard.booking_ids() {
            self.booking_to_room.remove(booking_id);
        }
        let removed = guard.booking_count();
        self.state.remove(&id);
        drop(guard);

        tracing::info!(
            target: "audit",
            action = "delete_room",
            room = %id,
            "room deleted with {removed} booking(s)"
        );
        Ok(removed)
    }

    // ── Users ────────────────────────────────────────────────

    pub async fn create_user(&self, id: Ulid, name: &str, email: &str, role: Role) -> Result<User, EngineError> {
        let name = validate_name("user name", name)?;
        let email = validate_name("email", email)?;
        if !email.contains('@') {
            return Err(EngineError::Validation(format!("invalid email address: {email}")));
        }

        let _catalog = self.catalog_lock.lock().await;
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.user_names.contains_key(&name) {
            return Err(EngineError::Validation(format!("user name already taken: {name}")));
        }

        let event = Event::UserCreated {
            id,
            name: name.clone(),
            email: email.clone(),
            role,
        };
        self.wal_append(&event).await?;
        let user = User { id, name, email, role };
        self.user_names.insert(user.name.clone(), id);
        self.users.insert(id, user.clone());
        if role.is_admin() {
            tracing::info!(target: "audit", action = "create_user", user = %id, role = role.as_str(), "administrator {} created", user.name);
        }
        Ok(user)
    }

    /// Promote or demote a user.
    pub async fn set_user_role(&self, id: Ulid, role: Role) -> Result<User, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let previous = self
            .users
            .get(&id)
            .map(|u| u.role)
            .ok_or(EngineError::NotFound(Entity::User, id))?;

        let event = Event::UserRoleChanged { id, role };
        self.wal_append(&event).await?;
        let user = {
            let mut entry = self
                .users
                .get_mut(&id)
                .ok_or(EngineError::NotFound(Entity::User, id))?;
            entry.role = role;
            entry.clone()
        };
        tracing::info!(
            target: "audit",
            action = "set_user_role",
            user = %id,
            from = previous.as_str(),
            to = role.as_str(),
            "{} is now {}",
            user.name,
            role.as_str()
        );
        Ok(user)
    }

    // ── Settings ─────────────────────────────────────────────

    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings, EngineError> {
        if let Some(Some(message)) = &patch.maintenance_message
            && message.len() > MAX_MESSAGE_LEN
        {
            return Err(EngineError::LimitExceeded("maintenance message too long"));
        }

        let _catalog = self.catalog_lock.lock().await;
        let current = self.settings.get().await;
        let next = current.apply_patch(patch).ok_or_else(|| {
            EngineError::Validation("working hours need both a start and an end".into())
        })?;
        if let Some(hours) = next.working_hours
            && hours.start == hours.end
        {
            return Err(EngineError::Validation("working hours window is empty".into()));
        }
        if next == current {
            return Ok(current);
        }

        let event = Event::SettingsUpdated { settings: next.clone() };
        self.wal_append(&event).await?;
        self.settings.replace(next.clone()).await;
        tracing::info!(
            target: "audit",
            action = "update_settings",
            maintenance = next.maintenance_mode,
            working_hours = ?next.working_hours,
            "settings changed"
        );
        Ok(next)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event set that recreates current state.
    ///
    /// Holds the catalog lock and a read lock on every room until the new
    /// file is in place, so no write can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut events = Vec::new();

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        for u in users {
            events.push(Event::UserCreated {
                id: u.id,
                name: u.name,
                email: u.email,
                role: u.role,
            });
        }

        let settings = self.settings.get().await;
        if settings != Settings::default() {
            events.push(Event::SettingsUpdated { settings });
        }

        let mut rooms: Vec<(Ulid, super::SharedRoomState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rooms.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(rooms.len());
        for (_, rs) in rooms {
            let guard = rs.read_owned().await;
            events.push(Event::RoomCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            // Date order, then commit order within a date.
            let bookings: Vec<Booking> = guard.bookings().cloned().collect();
            if !bookings.is_empty() {
                events.push(Event::BookingsInserted {
                    room_id: guard.id,
                    bookings,
                });
            }
            guards.push(guard);
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);

        tracing::debug!("WAL compacted to {count} events");
        Ok(())
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
