use affiliate_storage::StorageError;
use affiliate_types::{AffiliateId, ReferralId};
use thiserror::Error;

/// Ledger errors.
///
/// Expected non-events (unknown code, expired cookie, duplicate payment event)
/// are outcomes, not errors. Everything here is either an operator mistake or
/// a backend fault.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("affiliate not found: {0}")]
    AffiliateNotFound(AffiliateId),

    #[error("referral not found: {0}")]
    ReferralNotFound(ReferralId),

    #[error("referral code already taken: {0}")]
    CodeTaken(String),

    #[error("invalid code or slug: {0}")]
    InvalidCode(String),

    #[error("custom link {slug} already exists for affiliate {affiliate_id}")]
    LinkExists {
        affiliate_id: AffiliateId,
        slug: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("available balance {available_minor} is below the minimum payout {minimum_minor}")]
    BelowMinimum {
        available_minor: u64,
        minimum_minor: u64,
    },

    #[error("no payout method configured for affiliate {0}")]
    NoPayoutMethod(AffiliateId),

    #[error("no cleared commissions to pay for affiliate {0}")]
    NoClearedCommissions(AffiliateId),

    #[error("a clearing sweep is already running")]
    SweepAlreadyRunning,

    #[error("timed out waiting for the writer lock of affiliate {0}")]
    LockTimeout(AffiliateId),

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl LedgerError {
    /// Errors an operator can fix by changing the request or the affiliate's
    /// configuration.
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self,
            Self::CodeTaken(_)
                | Self::InvalidCode(_)
                | Self::LinkExists { .. }
                | Self::InvalidInput(_)
                | Self::BelowMinimum { .. }
                | Self::NoPayoutMethod(_)
                | Self::NoClearedCommissions(_)
        )
    }
}

impl From<StorageError> for LedgerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Conflict(msg) | StorageError::DuplicatePaymentReference(msg) => {
                Self::Conflict(msg)
            }
            StorageError::PreconditionFailed(msg) => Self::InvalidStateTransition(msg),
            StorageError::InvalidInput(msg) => Self::InvalidInput(msg),
            StorageError::Serialization(msg) | StorageError::Backend(msg) => Self::Backend(msg),
        }
    }
}
