use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::types::Platform;

pub type PlatformResult<T> = Result<T, PlatformError>;
pub type CoreResult<T> = Result<T, CoreError>;

/// Error taxonomy every adapter translates its platform's failures into.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    /// Credential unusable; requires human re-auth and is never retried.
    #[error("authorization expired: {0}")]
    AuthExpired(String),

    #[error("rate limited by platform, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The proposed change violates a platform or policy constraint.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{operation} is not supported by {platform}")]
    PlatformIncompatibility {
        platform: Platform,
        operation: String,
    },
}

impl PlatformError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimited { .. } | PlatformError::TransientNetwork(_)
        )
    }

    /// Short stable label for metrics and audit details.
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformError::AuthExpired(_) => "auth_expired",
            PlatformError::RateLimited { .. } => "rate_limited",
            PlatformError::TransientNetwork(_) => "transient_network",
            PlatformError::Validation(_) => "validation",
            PlatformError::PlatformIncompatibility { .. } => "platform_incompatibility",
        }
    }
}

/// Errors surfaced by the core services.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("account {account_id} needs re-authorization")]
    NeedsReauth { account_id: Uuid },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("credential version conflict for account {account_id}")]
    CredentialConflict { account_id: Uuid },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// How the job queue should treat a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry, waiting at least the given hint when one is known.
    Retry(Option<Duration>),
    /// Terminate without retrying.
    Terminal,
}

impl CoreError {
    pub fn disposition(&self) -> Disposition {
        match self {
            CoreError::Platform(PlatformError::RateLimited { retry_after }) => {
                Disposition::Retry(Some(*retry_after))
            }
            CoreError::Platform(PlatformError::TransientNetwork(_))
            | CoreError::Timeout(_)
            | CoreError::StoreUnavailable(_)
            | CoreError::CredentialConflict { .. } => Disposition::Retry(None),
            _ => Disposition::Terminal,
        }
    }

    /// True for failures that only a human re-connecting the account can fix.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            CoreError::NeedsReauth { .. } | CoreError::Platform(PlatformError::AuthExpired(_))
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Platform(e) => e.kind(),
            CoreError::NeedsReauth { .. } => "needs_reauth",
            CoreError::NotFound(_) => "not_found",
            CoreError::StateConflict(_) => "state_conflict",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::CredentialConflict { .. } => "credential_conflict",
            CoreError::StoreUnavailable(_) => "store_unavailable",
            CoreError::Timeout(_) => "timeout",
            CoreError::Config(_) => "config",
            CoreError::Serialization(_) => "serialization",
            CoreError::Internal(_) => "internal",
        }
    }
}
