use std::fmt;

use thiserror::Error;

use crate::model::*;

/// What a NotFound / AlreadyExists refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Location(LocationId),
    Chair(ChairKey),
    Service(ServiceId),
    Blackout(BlackoutId),
    Reservation(ReservationId),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Location(id) => write!(f, "location {id}"),
            Entity::Chair(key) => write!(f, "{key}"),
            Entity::Service(id) => write!(f, "service {id}"),
            Entity::Blackout(id) => write!(f, "tournament {id}"),
            Entity::Reservation(id) => write!(f, "reservation {id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Entity),
    #[error("already exists: {0}")]
    AlreadyExists(Entity),
    #[error("invalid range: {0}")]
    InvalidRange(&'static str),
    /// Chair already taken at the transactional recheck. An expected outcome.
    #[error("{chair} is not available: overlaps reservation {existing}")]
    Conflict {
        chair: ChairKey,
        existing: ReservationId,
    },
    #[error("timed out waiting for lock on {0}")]
    Timeout(ChairKey),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl EngineError {
    /// Stable machine-readable code for protocol replies and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidRange(_) => "invalid_range",
            EngineError::Conflict { .. } => "conflict",
            EngineError::Timeout(_) => "timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StorageFailure(_) => "storage_failure",
        }
    }
}
