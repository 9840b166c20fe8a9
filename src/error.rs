//! Unified application error model and mapping helpers.
//! This module provides a common error enum used across the policy loader,
//! the subject resolver and the wire frontend, along with a mapper to stable
//! protocol error names.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    /// Malformed policy line, duplicate action id, unreadable or missing source.
    /// Fatal at startup; the daemon refuses to serve under ambiguous policy.
    Config { code: String, message: String },
    /// Malformed frame, unknown member, unknown subject kind. Rejects the one
    /// offending request; the connection keeps serving.
    Protocol { code: String, message: String },
    /// Subject could not be verified (lookup failure, start-time or uid
    /// mismatch). Always folded into a deny, never surfaced to the caller.
    Credential { code: String, message: String },
    /// Socket bind/registration failure. Fatal at startup, no retry.
    Transport { code: String, message: String },
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Config { code, .. }
            | AppError::Protocol { code, .. }
            | AppError::Credential { code, .. }
            | AppError::Transport { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Config { message, .. }
            | AppError::Protocol { message, .. }
            | AppError::Credential { message, .. }
            | AppError::Transport { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn config<S: Into<String>>(code: S, msg: S) -> Self { AppError::Config { code: code.into(), message: msg.into() } }
    pub fn protocol<S: Into<String>>(code: S, msg: S) -> Self { AppError::Protocol { code: code.into(), message: msg.into() } }
    pub fn credential<S: Into<String>>(code: S, msg: S) -> Self { AppError::Credential { code: code.into(), message: msg.into() } }
    pub fn transport<S: Into<String>>(code: S, msg: S) -> Self { AppError::Transport { code: code.into(), message: msg.into() } }
    pub fn io<S: Into<String>>(code: S, msg: S) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to the stable error name reported in a wire error reply.
    ///
    /// Credential errors must never reach the wire as errors (that would hand
    /// callers a deny oracle); the service folds them into `{allowed: false}`
    /// before a reply is built. The mapping below exists only as a backstop.
    pub fn wire_name(&self) -> &'static str {
        match self {
            AppError::Protocol { .. } => "org.freedesktop.DBus.Error.InvalidArgs",
            AppError::Credential { .. } => "org.freedesktop.DBus.Error.AccessDenied",
            AppError::Config { .. }
            | AppError::Transport { .. }
            | AppError::Io { .. }
            | AppError::Internal { .. } => "org.freedesktop.DBus.Error.Failed",
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io { code: "io_error".into(), message: err.to_string() }
    }
}
