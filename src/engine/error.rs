use thiserror::Error;
use ulid::Ulid;

use crate::model::{ReservationStatus, ResourceKind};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("resource {resource_id} is already booked by {with}")]
    Conflict { resource_id: Ulid, with: Ulid },
    #[error("resource {resource_id} is closed ({closure})")]
    ClosedForBooking { resource_id: Ulid, closure: Ulid },
    #[error("resource {resource_id}: capacity {capacity} exceeded, all slots occupied")]
    CapacityExceeded { resource_id: Ulid, capacity: u32 },
    #[error("resource {resource_id} holds at most {max} people, got {requested}")]
    OccupancyExceeded {
        resource_id: Ulid,
        max: u32,
        requested: u32,
    },
    #[error("{what} falls outside reservation {reservation_id}")]
    OutOfRange {
        reservation_id: Ulid,
        what: &'static str,
    },
    #[error("reservation {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("resource {resource_id} is a {actual}, expected a {expected}")]
    WrongResourceKind {
        resource_id: Ulid,
        expected: ResourceKind,
        actual: ResourceKind,
    },
    #[error("reservation {id} is {status} and its stay can no longer change")]
    ReservationClosed { id: Ulid, status: ReservationStatus },
    #[error("cannot delete resource {0}: it has bookings")]
    HasBookings(Ulid),
    #[error("cannot delete staff {0}: assigned to a program session")]
    StaffInUse(Ulid),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Invalid(msg.into())
    }

    /// Booking rejections, as opposed to bad input or missing rows.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. }
                | EngineError::ClosedForBooking { .. }
                | EngineError::CapacityExceeded { .. }
        )
    }
}
