//! Error types for the distribution engine

use thiserror::Error;

/// Result type for distribution operations
pub type Result<T> = std::result::Result<T, Error>;

/// Distribution errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] luckymoney_ledger::Error),

    /// Fewer minor units than shares
    #[error("Amount too small: {total_units} units cannot fill {count} shares")]
    TooSmallAmount {
        /// Units to split
        total_units: u64,
        /// Requested shares
        count: u32,
    },

    /// Zero shares requested
    #[error("Invalid share count: {0}")]
    InvalidShareCount(u32),

    /// Equal split that does not divide evenly
    #[error("Total of {total_units} units does not split evenly into {count} shares")]
    UnevenSplit {
        /// Units to split
        total_units: u64,
        /// Requested shares
        count: u32,
    },

    /// Claimant already holds a share of this distribution
    #[error("Distribution {0} already claimed by this user")]
    AlreadyClaimed(u64),

    /// Every share is taken
    #[error("Distribution {0} has nothing left")]
    NothingLeft(u64),

    /// Claim before the owner activated the distribution
    #[error("Distribution {0} is not activated")]
    NotActivated(u64),

    /// Second activation
    #[error("Distribution {0} is already activated")]
    AlreadyActivated(u64),

    /// Requester does not own the distribution
    #[error("Permission denied on distribution {0}")]
    PermissionDenied(u64),

    /// Claim window has closed
    #[error("Distribution {0} has expired")]
    DistributionExpired(u64),

    /// Unknown id or serial
    #[error("Distribution not found: {0}")]
    DistributionNotFound(String),

    /// Message longer than the configured limit
    #[error("Message too long: {len} > {max}")]
    MessageTooLong {
        /// Message length in characters
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Lock succeeded, persist failed and the compensating unlock failed too
    #[error("Compensation failed, funds stuck in lock: {0}")]
    CompensationFailed(String),

    /// Gateway refused the withdraw address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Gateway refused the external transaction
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Deposit memo does not name an owner
    #[error("Invalid memo: {0}")]
    InvalidMemo(String),

    /// External network rejected the withdraw
    #[error("Withdraw rejected: {0}")]
    WithdrawRejected(String),

    /// No withdraw outcome within the timeout
    #[error("Withdraw timed out after {0:?}")]
    WithdrawTimedOut(std::time::Duration),

    /// Pending result was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Gateway transport failure
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable code for callers; infrastructure failures collapse to `"internal"`
    pub fn code(&self) -> &'static str {
        use luckymoney_ledger::Error as L;
        match self {
            Error::Ledger(L::InsufficientFunds { .. }) => "insufficient_funds",
            Error::Ledger(L::NoSuchAccount { .. }) => "no_such_account",
            Error::Ledger(L::InvalidAmount(_)) => "invalid_amount",
            Error::Ledger(L::DuplicateExternalTransaction(_)) => "duplicate_transaction",
            Error::Ledger(_) => "internal",
            Error::TooSmallAmount { .. } => "too_small_amount",
            Error::InvalidShareCount(_) => "invalid_share_count",
            Error::UnevenSplit { .. } => "uneven_split",
            Error::AlreadyClaimed(_) => "already_claimed",
            Error::NothingLeft(_) => "nothing_left",
            Error::NotActivated(_) => "not_activated",
            Error::AlreadyActivated(_) => "already_activated",
            Error::PermissionDenied(_) => "permission_denied",
            Error::DistributionExpired(_) => "expired",
            Error::DistributionNotFound(_) => "not_found",
            Error::MessageTooLong { .. } => "message_too_long",
            Error::InvalidAddress(_) => "invalid_address",
            Error::InvalidTransaction(_) => "invalid_transaction",
            Error::InvalidMemo(_) => "invalid_memo",
            Error::WithdrawRejected(_) => "withdraw_rejected",
            Error::WithdrawTimedOut(_) => "withdraw_timed_out",
            Error::Cancelled => "cancelled",
            Error::CompensationFailed(_)
            | Error::Gateway(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Other(_) => "internal",
        }
    }

    /// Whether this is an infrastructure failure rather than a business rejection
    pub fn is_internal(&self) -> bool {
        match self {
            Error::Ledger(e) => e.is_infrastructure(),
            _ => self.code() == "internal",
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Ledger(luckymoney_ledger::Error::Serialization(err))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
