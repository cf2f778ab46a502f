use crate::model::*;

use super::error::StateError;

/// Booking status state machine.
///
/// ```text
/// pending   --confirm (admin)--> confirmed
/// pending   --reject  (admin)--> rejected
/// pending   --cancel  (owner)--> cancelled
/// confirmed --cancel  (owner)--> cancelled
/// ```
///
/// Role and ownership are checked before the current status.
pub fn check_transition(booking: &Booking, to: BookingStatus, actor: &Actor) -> Result<(), StateError> {
    let invalid = || StateError::InvalidTransition {
        id: booking.id,
        from: booking.status,
        to,
    };
    match to {
        BookingStatus::Confirmed | BookingStatus::Rejected => {
            if !actor.role.is_admin() {
                return Err(StateError::NotAdmin { actor: actor.user_id });
            }
            if booking.status != BookingStatus::Pending {
                return Err(invalid());
            }
            Ok(())
        }
        BookingStatus::Cancelled => {
            if actor.user_id != booking.user_id {
                return Err(StateError::NotOwner {
                    id: booking.id,
                    actor: actor.user_id,
                });
            }
            match booking.status {
                BookingStatus::Pending | BookingStatus::Confirmed => Ok(()),
                BookingStatus::Cancelled => Err(StateError::AlreadyCancelled(booking.id)),
                BookingStatus::Rejected => Err(invalid()),
            }
        }
        BookingStatus::Pending => Err(invalid()),
    }
}
