// src/error.rs
use std::fmt;

/// Failure classification surfaced by store adapters. The ledger converts
/// these into the `LedgerError` taxonomy; `Deadlock` is consumed by the
/// retry driver and never reaches callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    DuplicateKey,
    Deadlock,
    NotFound,
    Other(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey => write!(f, "Duplicate key"),
            Self::Deadlock => write!(f, "Deadlock detected"),
            Self::NotFound => write!(f, "Row not found"),
            Self::Other(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // unique_violation
                Some("23505") => StoreError::DuplicateKey,
                // deadlock_detected
                Some("40P01") => StoreError::Deadlock,
                _ => StoreError::Other(db.to_string()),
            },
            _ => StoreError::Other(err.to_string()),
        }
    }
}

/// Error taxonomy of the ledger. Transport layers map these onto status
/// codes; the burn orchestrator recovers only `InsufficientCredits`.
#[derive(Debug)]
pub enum LedgerError {
    InvalidAmount,
    ArithmeticOverflow,
    InsufficientCredits { available: i64, requested: i64 },
    OutstandingDebt { debt: i64 },
    AlreadyPerformed,
    ReferencedOperationNotFound,
    GrantAlreadyInFlight,
    BurnFailed(String),
    BurnDidNotRestoreBalance,
    InvalidArguments(String),
    Store(StoreError),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAmount => write!(f, "Invalid amount"),
            Self::ArithmeticOverflow => write!(f, "Arithmetic overflow"),
            Self::InsufficientCredits {
                available,
                requested,
            } => write!(
                f,
                "Insufficient credits: have {}, need {}",
                available, requested
            ),
            Self::OutstandingDebt { debt } => {
                write!(f, "Outstanding debt of {} must be settled first", debt)
            }
            Self::AlreadyPerformed => write!(f, "Operation already performed"),
            Self::ReferencedOperationNotFound => {
                write!(f, "Referenced operation not found")
            }
            Self::GrantAlreadyInFlight => write!(f, "A grant is already in flight"),
            Self::BurnFailed(msg) => write!(f, "Burn failed: {}", msg),
            Self::BurnDidNotRestoreBalance => {
                write!(f, "Burn did not restore the balance")
            }
            Self::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            Self::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            // Every identity-conflict insert in the ledger flows means the
            // action (or its replay) already happened.
            StoreError::DuplicateKey => LedgerError::AlreadyPerformed,
            other => LedgerError::Store(other),
        }
    }
}

impl LedgerError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, LedgerError::Store(StoreError::Deadlock))
    }
}
