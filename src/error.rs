//! Error taxonomy shared by every subsystem.
//!
//! Each variant carries the stable numeric wire code from the original
//! `mdv_errno` table, preserved here so `status.err` on the user protocol and
//! `MdvError::code()` always agree.

use thiserror::Error;

/// A single, crate-wide error type. Most subsystems return `Result<T,
/// MdvError>`; the process boundary (`main`, `Node::run`) widens to
/// `anyhow::Result`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MdvError {
    #[error("invalid argument")]
    InvalidArg,
    #[error("invalid type")]
    InvalidType,
    #[error("no such entity")]
    ENoEnt,
    #[error("resource temporarily unavailable")]
    EAgain,
    #[error("channel closed")]
    Closed,
    #[error("entity already exists")]
    EExist,
    #[error("out of memory")]
    NoMem,
    #[error("operation in progress")]
    InProgress,
    #[error("timed out")]
    ETimedOut,
    #[error("resource busy")]
    Busy,
    #[error("not implemented")]
    NoImpl,
    #[error("stack overflow")]
    StackOverflow,
    #[error("invalid protocol version")]
    InvalidProtocolVersion,
    #[error("{0}")]
    Failed(String),
}

impl MdvError {
    /// The stable wire code sent back as `status.err` on the user protocol.
    pub const fn code(&self) -> i32 {
        match self {
            MdvError::InvalidArg => -2,
            MdvError::InvalidType => -3,
            MdvError::ENoEnt => -4,
            MdvError::EAgain => -5,
            MdvError::Closed => -6,
            MdvError::EExist => -7,
            MdvError::NoMem => -8,
            MdvError::InProgress => -9,
            MdvError::ETimedOut => -10,
            MdvError::Busy => -11,
            MdvError::NoImpl => -12,
            MdvError::StackOverflow => -13,
            MdvError::InvalidProtocolVersion => -14,
            MdvError::Failed(_) => -1,
        }
    }
}

pub type MdvResult<T> = std::result::Result<T, MdvError>;

impl From<std::io::Error> for MdvError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            WouldBlock => MdvError::EAgain,
            NotFound => MdvError::ENoEnt,
            AlreadyExists => MdvError::EExist,
            TimedOut => MdvError::ETimedOut,
            _ => MdvError::Failed(e.to_string()),
        }
    }
}

impl From<bincode::Error> for MdvError {
    fn from(e: bincode::Error) -> Self {
        MdvError::Failed(format!("frame codec error: {e}"))
    }
}

impl From<sled::Error> for MdvError {
    fn from(e: sled::Error) -> Self {
        MdvError::Failed(format!("storage error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_original_table() {
        assert_eq!(MdvError::InvalidArg.code(), -2);
        assert_eq!(MdvError::ENoEnt.code(), -4);
        assert_eq!(MdvError::EAgain.code(), -5);
        assert_eq!(MdvError::Closed.code(), -6);
        assert_eq!(MdvError::StackOverflow.code(), -13);
    }
}
