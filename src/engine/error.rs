use ulid::Ulid;

use crate::directory::DirectoryError;
use crate::model::Entity;

/// Error classes, mapped once to a transport status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: Ulid },

    #[error("user {user_id} already holds reservation {reservation_id} overlapping session {session_id}")]
    Conflict {
        user_id: Ulid,
        reservation_id: Ulid,
        session_id: Ulid,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl EngineError {
    pub fn not_found(entity: Entity, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::WalError(_) | EngineError::Directory(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { entity, .. } => match entity {
                Entity::User => "USER_ERROR_001",
                Entity::Professional => "PROFESSIONAL_ERROR_001",
                Entity::Location => "LOCAL_ERROR_001",
                Entity::Community => "COMMUNITY_ERROR_001",
                Entity::Plan => "PLAN_ERROR_001",
                Entity::Session => "SESSION_ERROR_001",
                Entity::Reservation => "RESERVATION_ERROR_001",
                Entity::Membership => "MEMBERSHIP_ERROR_001",
                Entity::Suspension => "MEMBERSHIP_SUSPENSION_ERROR_001",
            },
            EngineError::Conflict { .. } => "CONFLICT_ERROR_002",
            EngineError::Validation(_) => "BAD_REQUEST_ERROR_001",
            EngineError::LimitExceeded(_) => "BAD_REQUEST_ERROR_002",
            EngineError::WalError(_) | EngineError::Directory(_) => "INTERNAL_SERVER_ERROR_001",
        }
    }
}
