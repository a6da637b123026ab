//! Typed failures for every ledger operation
use crate::types::EntityKind;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Stable failure categories the calling layer maps to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidState,
    InvalidQuantity,
    InsufficientQuantity,
    InvalidCode,
    NotFound,
    Unauthorized,
    Conflict,
    Expired,
    HasActiveDeliveries,
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("{entity} {id} cannot {action} while {status}")]
    InvalidState {
        entity: EntityKind,
        id: String,
        status: String,
        action: &'static str,
    },
    #[error("invalid quantity {requested}: {reason}")]
    InvalidQuantity { requested: u64, reason: &'static str },
    #[error("window {window} is not a positive, storable duration")]
    InvalidWindow { window: chrono::TimeDelta },
    #[error("item {item_id} has {remaining} unreserved, {requested} requested")]
    InsufficientQuantity {
        item_id: String,
        requested: u64,
        remaining: u64,
    },
    #[error("confirmation code rejected for delivery {delivery_id}")]
    InvalidCode { delivery_id: String },
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: String },
    #[error("actor {actor} may not {action} {entity} {id}")]
    Unauthorized {
        actor: String,
        action: &'static str,
        entity: EntityKind,
        id: String,
    },
    #[error("courier {courier_id} already holds active delivery {delivery_id}")]
    Conflict {
        courier_id: String,
        delivery_id: String,
    },
    #[error("{entity} {id} expired")]
    Expired { entity: EntityKind, id: String },
    #[error("{entity} {id} still has {count} active deliveries")]
    HasActiveDeliveries {
        entity: EntityKind,
        id: String,
        count: usize,
    },
    #[error("batch {id} is not ready for reservation ({status})")]
    NotReady { id: String, status: String },
    #[error("delivery {id} is not available for commitment ({status})")]
    NotAvailable { id: String, status: String },
    #[error("reservation {id} cannot be cancelled while {status}")]
    WrongState { id: String, status: String },
    #[error("timed out waiting for lock on {key}")]
    LockTimeout { key: String },
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode row: {0}")]
    Encoding(String),
    #[error("failed to decode row: {0}")]
    Decoding(#[from] minicbor::decode::Error),
    #[error("failed to build identifier: {0}")]
    Identifier(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidState { .. }
            | LedgerError::NotReady { .. }
            | LedgerError::NotAvailable { .. }
            | LedgerError::WrongState { .. } => ErrorKind::InvalidState,
            LedgerError::InvalidQuantity { .. } | LedgerError::InvalidWindow { .. } => {
                ErrorKind::InvalidQuantity
            }
            LedgerError::InsufficientQuantity { .. } => ErrorKind::InsufficientQuantity,
            LedgerError::InvalidCode { .. } => ErrorKind::InvalidCode,
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::Unauthorized { .. } => ErrorKind::Unauthorized,
            LedgerError::Conflict { .. } | LedgerError::LockTimeout { .. } => ErrorKind::Conflict,
            LedgerError::Expired { .. } => ErrorKind::Expired,
            LedgerError::HasActiveDeliveries { .. } => ErrorKind::HasActiveDeliveries,
            LedgerError::Storage(_)
            | LedgerError::Encoding(_)
            | LedgerError::Decoding(_)
            | LedgerError::Identifier(_) => ErrorKind::Internal,
        }
    }

    /// A lock wait that timed out leaves the store untouched; the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::LockTimeout { .. })
    }

    pub(crate) fn not_found(entity: EntityKind, id: &str) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn unauthorized(
        actor: &str,
        action: &'static str,
        entity: EntityKind,
        id: &str,
    ) -> Self {
        LedgerError::Unauthorized {
            actor: actor.to_string(),
            action,
            entity,
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_a_retryable_conflict() {
        let err = LedgerError::LockTimeout {
            key: "batch/abc".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable());

        let err = LedgerError::Conflict {
            courier_id: "c".into(),
            delivery_id: "d".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn lifecycle_specific_errors_map_to_invalid_state() {
        let err = LedgerError::NotReady {
            id: "b".into(),
            status: "Producing".into(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(
            err.to_string(),
            "batch b is not ready for reservation (Producing)"
        );
    }
}
