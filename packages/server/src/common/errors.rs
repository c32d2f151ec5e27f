use thiserror::Error;

use super::JobId;

/// Bot authentication failure.
///
/// Deliberately carries no detail: unknown bot, disabled bot and wrong
/// credential are indistinguishable to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("authentication failed")]
pub struct AuthenticationError;

/// Why a submission (or an explicit expire) was refused by the lease guard.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseConflict {
    #[error("job is not locked")]
    NotLocked,

    #[error("job is not leased by this bot")]
    NotOwner,

    #[error("lease expired before submission")]
    LeaseExpired,
}

impl LeaseConflict {
    /// Stable wire code reported to bots.
    pub fn code(&self) -> &'static str {
        match self {
            LeaseConflict::NotLocked => "job_not_locked",
            LeaseConflict::NotOwner => "not_assigned",
            LeaseConflict::LeaseExpired => "lease_expired",
        }
    }
}

/// Failure of a guarded job-store transition.
#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error(transparent)]
    Conflict(#[from] LeaseConflict),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<sqlx::Error> for TransitionError {
    fn from(e: sqlx::Error) -> Self {
        TransitionError::Store(e.into())
    }
}

/// Errors surfaced by the pull/submit services to the bot protocol.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("authentication failed")]
    Authentication,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error(transparent)]
    LeaseConflict(#[from] LeaseConflict),

    #[error("rate limit of {limit} pulls per minute exceeded")]
    RateLimited { limit: i64 },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoordinatorError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoordinatorError::Validation(message.into())
    }

    /// Stable wire code reported to bots.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::Authentication => "authentication_error",
            CoordinatorError::Validation(_) => "validation_error",
            CoordinatorError::NotFound(_) => "job_not_found",
            CoordinatorError::LeaseConflict(conflict) => conflict.code(),
            CoordinatorError::RateLimited { .. } => "rate_limited",
            CoordinatorError::Internal(_) => "internal_error",
        }
    }
}

impl From<AuthenticationError> for CoordinatorError {
    fn from(_: AuthenticationError) -> Self {
        CoordinatorError::Authentication
    }
}

impl From<TransitionError> for CoordinatorError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::NotFound(id) => CoordinatorError::NotFound(id),
            TransitionError::Conflict(conflict) => CoordinatorError::LeaseConflict(conflict),
            TransitionError::Store(e) => CoordinatorError::Internal(e),
        }
    }
}
