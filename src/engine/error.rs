use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::BookingStatus;

/// What kind of entity a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Room,
    User,
    Booking,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Room => "room",
            Entity::User => "user",
            Entity::Booking => "booking",
        }
    }
}

/// Request refused by the policy gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRejection {
    MaintenanceMode {
        message: String,
    },
    OutsideWorkingHours {
        start: NaiveTime,
        end: NaiveTime,
        message: String,
    },
}

impl PolicyRejection {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            PolicyRejection::MaintenanceMode { .. } => "MAINTENANCE_MODE",
            PolicyRejection::OutsideWorkingHours { .. } => "OUTSIDE_WORKING_HOURS",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PolicyRejection::MaintenanceMode { message }
            | PolicyRejection::OutsideWorkingHours { message, .. } => message,
        }
    }
}

/// Transition refused by the status state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    AlreadyCancelled(Ulid),
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    NotOwner {
        id: Ulid,
        actor: Ulid,
    },
    NotAdmin {
        actor: Ulid,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            StateError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id} cannot go from {from} to {to}")
            }
            StateError::NotOwner { id, actor } => {
                write!(f, "user {actor} does not own booking {id}")
            }
            StateError::NotAdmin { actor } => {
                write!(f, "user {actor} is not an administrator")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    NotFound(Entity, Ulid),
    AlreadyExists(Ulid),
    /// A booking-type request, or a confirmation, collides with confirmed rows.
    Conflict {
        dates: Vec<NaiveDate>,
        bookings: Vec<Ulid>,
    },
    Policy(PolicyRejection),
    State(StateError),
    TransactionFailed(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(entity, id) => write!(f, "{} not found: {id}", entity.as_str()),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict { dates, .. } => {
                let dates: Vec<String> = dates.iter().map(|d| d.to_string()).collect();
                write!(f, "slot already confirmed on: {}", dates.join(", "))
            }
            EngineError::Policy(p) => write!(f, "{}: {}", p.code(), p.message()),
            EngineError::State(s) => write!(f, "{s}"),
            EngineError::TransactionFailed(e) => write!(f, "transaction rolled back: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        EngineError::State(e)
    }
}

impl From<PolicyRejection> for EngineError {
    fn from(p: PolicyRejection) -> Self {
        EngineError::Policy(p)
    }
}
