// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use thiserror::Error;

/// Stable error taxonomy shared by the binary protocol and the HTTP gateway.
///
/// Each variant maps to exactly one wire-level status on both surfaces: the
/// binary ERROR frame carries `code` + UTF-8 `detail`, the HTTP gateway
/// carries the same information as a JSON `{"error": {...}}` body.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed dependency: {0}")]
    FailedDependency(String),

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Stable numeric code, identical across the binary and HTTP surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u16);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StoreError {
    /// The stable numeric code for this error, shared by both wire surfaces.
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound(_) => ErrorCode(404),
            StoreError::Conflict(_) => ErrorCode(409),
            StoreError::PreconditionFailed(_) => ErrorCode(412),
            StoreError::InvalidInput(_) => ErrorCode(422),
            StoreError::FailedDependency(_) => ErrorCode(424),
            StoreError::Corrupt(_) => ErrorCode(500),
            StoreError::Io(_) => ErrorCode(500),
        }
    }

    pub fn detail(&self) -> String {
        self.to_string()
    }
}
