//! Error types for the privacy compliance engine.

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

use crate::compliance::types::{DataProcessingPurpose, LegalBasis, RegionCode};

/// Result type alias for compliance operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification used by callers to decide how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller or business-rule mismatch. Never retried automatically.
    Validation,
    /// Remote authority or transport failure. Safe to retry with the same idempotency key.
    Transient,
    /// Deployment defect detected while loading configuration.
    Consistency,
    /// Anything else (serialization, local storage, I/O).
    Internal,
}

/// Error types for compliance operations
#[derive(Debug, Error)]
pub enum Error {
    /// Region is not present in the configured law table
    #[error("Unknown region: {0}")]
    UnknownRegion(RegionCode),

    /// Legal basis is not permitted for the purpose in the region
    #[error("Legal basis {basis} is not permitted for purpose {purpose} in region {region}")]
    InvalidLegalBasis {
        purpose: DataProcessingPurpose,
        basis: LegalBasis,
        region: RegionCode,
    },

    /// Withdrawal without a currently granted consent
    #[error("No active consent for purpose {purpose} (user {user_id})")]
    NoActiveConsent {
        user_id: String,
        purpose: DataProcessingPurpose,
    },

    /// Birth date lies after the current date
    #[error("Birth date {0} is in the future")]
    FutureBirthDate(NaiveDate),

    /// State machine rejected the move
    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Rights request deadline was already extended once
    #[error("Rights request {0} has already been extended")]
    AlreadyExtended(Uuid),

    /// Minor without verified parental consent tried to grant a non-essential purpose
    #[error("Parental consent is required before granting {purpose} (user {user_id})")]
    ParentalConsentRequired {
        user_id: String,
        purpose: DataProcessingPurpose,
    },

    /// Parental consent has already been verified for the user
    #[error("Parental consent already verified for user {0}")]
    ParentalConsentAlreadyVerified(String),

    /// Parental consent request outlived the configured response window
    #[error("Parental consent request {0} has expired")]
    ParentalConsentExpired(Uuid),

    /// Entity lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Remote authority failure
    #[error("Remote authority error: {0}")]
    Remote(#[from] RemoteError),

    /// Caller cancelled the write before the remote acknowledged it
    #[error("Operation cancelled before remote acknowledgement")]
    Cancelled,

    /// Local cache store failure
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Region table is missing entries required at runtime
    #[error("Inconsistent region policy: {0}")]
    InconsistentPolicy(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// エラー種別を返す
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownRegion(_)
            | Error::InvalidLegalBasis { .. }
            | Error::NoActiveConsent { .. }
            | Error::FutureBirthDate(_)
            | Error::InvalidTransition { .. }
            | Error::AlreadyExtended(_)
            | Error::ParentalConsentRequired { .. }
            | Error::ParentalConsentAlreadyVerified(_)
            | Error::ParentalConsentExpired(_)
            | Error::NotFound(_)
            | Error::InvalidInput(_) => ErrorKind::Validation,
            Error::Remote(remote) if remote.is_transient() => ErrorKind::Transient,
            Error::Remote(_) => ErrorKind::Validation,
            Error::Cancelled => ErrorKind::Transient,
            Error::Config(_) | Error::InconsistentPolicy(_) => ErrorKind::Consistency,
            Error::Cache(_) | Error::Json(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// リトライ可能かどうか
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnknownRegion(_) => "unknown_region",
            Error::InvalidLegalBasis { .. } => "invalid_legal_basis",
            Error::NoActiveConsent { .. } => "no_active_consent",
            Error::FutureBirthDate(_) => "future_birth_date",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::AlreadyExtended(_) => "already_extended",
            Error::ParentalConsentRequired { .. } => "parental_consent_required",
            Error::ParentalConsentAlreadyVerified(_) => "parental_consent_already_verified",
            Error::ParentalConsentExpired(_) => "parental_consent_expired",
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::Remote(RemoteError::Unavailable(_)) => "remote_unavailable",
            Error::Remote(RemoteError::Timeout(_)) => "remote_timeout",
            Error::Remote(RemoteError::Rejected(_)) => "remote_rejected",
            Error::Cancelled => "cancelled",
            Error::Cache(_) => "cache_error",
            Error::Config(_) => "config_error",
            Error::InconsistentPolicy(_) => "inconsistent_policy",
            Error::Json(_) => "json_error",
            Error::Io(_) => "io_error",
        }
    }

    pub(crate) fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Error::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Errors reported by the remote compliance authority
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or service outage
    #[error("Authority unavailable: {0}")]
    Unavailable(String),

    /// No acknowledgement within the configured window
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Authority validated the payload and refused it
    #[error("Rejected by authority: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// 一時的な障害かどうか
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_) | RemoteError::Timeout(_))
    }
}

/// Local cache store errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
