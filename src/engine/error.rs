use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Validation(String),
    CapacityExceeded {
        requested: u32,
        free: u32,
    },
    ResourceConflict(String),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    IntegrityConflict(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::CapacityExceeded { requested, free } => {
                write!(
                    f,
                    "capacity exceeded: requested {requested} seats, {free} free"
                )
            }
            EngineError::ResourceConflict(msg) => write!(f, "resource conflict: {msg}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::IntegrityConflict(msg) => write!(f, "integrity conflict: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
