//! Error types for the ledger

use crate::types::OwnerId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Balance too small for the requested movement
    #[error("Insufficient funds: {owner} {asset} requested {requested}, have {available}")]
    InsufficientFunds {
        /// Account owner
        owner: OwnerId,
        /// Asset symbol
        asset: String,
        /// Amount the operation needed
        requested: Decimal,
        /// Amount the relevant balance held
        available: Decimal,
    },

    /// Account row does not exist
    #[error("No such account: {owner} {asset}")]
    NoSuchAccount {
        /// Account owner
        owner: OwnerId,
        /// Asset symbol
        asset: String,
    },

    /// Non-positive amount or more fractional digits than the configured precision
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// External transaction id was already credited
    #[error("Duplicate external transaction: {0}")]
    DuplicateExternalTransaction(String),

    /// Invariant violation (negative balance, broken counter, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Infrastructure failures (store, codec, filesystem) as opposed to business rejections
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::Storage(_)
                | Error::Serialization(_)
                | Error::Io(_)
                | Error::InvariantViolation(_)
                | Error::Config(_)
                | Error::Other(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
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
