use service_core::error::AppError;
use thiserror::Error;

use super::store::StoreError;
use crate::providers::ProviderError;

/// Domain failures. Messages are what callers see, so they stay generic:
/// no distinction between unknown user and wrong password, no credential
/// or provider detail.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid credentials")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid or expired code")]
    InvalidOrExpiredCode,

    #[error("Too many requests. Please try again later.")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("Provider unavailable")]
    MisconfiguredProvider(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Misconfigured(detail) => ServiceError::MisconfiguredProvider(detail),
            ProviderError::UnknownProvider(_) => ServiceError::NotFound("Provider not found".into()),
            // Upstream refusals (bad code, revoked grant) are the caller's problem.
            ProviderError::Upstream(_) | ProviderError::InvalidProfile(_) => {
                ServiceError::Unauthenticated
            }
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unauthenticated => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::Forbidden(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            ServiceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ServiceError::InvalidOrExpiredCode => {
                AppError::BadRequest(anyhow::anyhow!("Invalid or expired code"))
            }
            ServiceError::RateLimited {
                retry_after_seconds,
            } => AppError::TooManyRequests(
                "Too many requests. Please try again later.".to_string(),
                retry_after_seconds,
            ),
            ServiceError::MisconfiguredProvider(detail) => {
                tracing::error!(detail = %detail, "OAuth provider misconfigured");
                AppError::ServiceUnavailable("Provider unavailable".to_string())
            }
            ServiceError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            ServiceError::Validation(msg) => {
                let mut errors = validator::ValidationErrors::new();
                errors.add(
                    "request",
                    validator::ValidationError::new("invalid").with_message(msg.into()),
                );
                AppError::ValidationError(errors)
            }
            ServiceError::Store(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
