use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum CrossdisError {
    #[error("inconsistent opcode table {table}: {reason}")]
    InconsistentTable { table: String, reason: String },

    #[error("opcode table {0} is finalized and can no longer be edited")]
    FrozenTable(String),

    #[error("malformed bytecode at offset {offset}: {problem}")]
    MalformedBytecode { offset: usize, problem: Malformed },

    #[error("no opcode table for {0}")]
    UnknownTable(String),

    #[error("malformed line table at byte {position}")]
    LineTable { position: usize },

    #[error("malformed exception table at byte {position}")]
    ExceptionTable { position: usize },

    #[error("invalid version string: {0:?}")]
    InvalidVersion(String),
}

/// What exactly went wrong with a single instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum Malformed {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("truncated instruction (needs {needed} bytes, {remaining} remaining)")]
    Truncated { needed: usize, remaining: usize },

    #[error("{pool} index {index} out of range (len {len})")]
    IndexOutOfRange { pool: &'static str, index: u64, len: usize },

    #[error("operand overflows 64 bits")]
    OperandOverflow,

    #[error("jump target out of range")]
    JumpOutOfRange,
}

impl CrossdisError {
    pub(crate) fn inconsistent(table: impl ToString, reason: impl Into<String>) -> Self {
        CrossdisError::InconsistentTable { table: table.to_string(), reason: reason.into() }
    }

    pub(crate) fn malformed(offset: usize, problem: Malformed) -> Self {
        CrossdisError::MalformedBytecode { offset, problem }
    }
}

pub type Result<T> = std::result::Result<T, CrossdisError>;
