//! The subject of an authorization request: who is asking.
//!
//! Subjects arrive on the wire as a kind tag plus a detail map and are parsed
//! fresh per request from untrusted input. Three kinds exist in the authority
//! convention; process and bus-name subjects can be verified, session subjects
//! are parsed but never resolved to credentials (always denied downstream).

use serde_json::Value;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    UnixProcess { pid: u32, start_time: u64 },
    UnixSession { session_id: String },
    SystemBusName { name: String },
}

impl Subject {
    /// Parse the wire form `["kind", {detail: value, ...}]`.
    ///
    /// Unrecognized detail keys within a known kind are ignored for forward
    /// compatibility; an unrecognized kind tag is a protocol error.
    pub fn from_wire(value: &Value) -> AppResult<Subject> {
        let parts = value
            .as_array()
            .ok_or_else(|| AppError::protocol("bad_subject", "subject must be [kind, details]"))?;
        let kind = parts
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::protocol("bad_subject", "subject kind must be a string"))?;
        let details = match parts.get(1) {
            Some(Value::Object(map)) => map,
            Some(_) => return Err(AppError::protocol("bad_subject", "subject details must be a map")),
            None => return Err(AppError::protocol("bad_subject", "subject details missing")),
        };

        match kind {
            "unix-process" => {
                let pid = detail_u64(details, "pid")?;
                let pid = u32::try_from(pid)
                    .map_err(|_| AppError::protocol("bad_subject", "pid out of range"))?;
                let start_time = detail_u64(details, "start-time")?;
                Ok(Subject::UnixProcess { pid, start_time })
            }
            "unix-session" => {
                let session_id = detail_str(details, "session-id")?;
                Ok(Subject::UnixSession { session_id })
            }
            "system-bus-name" => {
                let name = detail_str(details, "name")?;
                Ok(Subject::SystemBusName { name })
            }
            other => Err(AppError::protocol(
                "invalid_subject_kind".into(),
                format!("unknown subject kind '{}'", other),
            )),
        }
    }

    /// One-line rendering for the audit log.
    pub fn describe(&self) -> String {
        match self {
            Subject::UnixProcess { pid, start_time } => {
                format!("unix process (pid: {}, start time: {})", pid, start_time)
            }
            Subject::UnixSession { session_id } => format!("unix session (session id: {})", session_id),
            Subject::SystemBusName { name } => format!("system bus name {}", name),
        }
    }
}

fn detail_u64(details: &serde_json::Map<String, Value>, key: &str) -> AppResult<u64> {
    details
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| AppError::protocol("bad_subject".into(), format!("missing or invalid '{}'", key)))
}

fn detail_str(details: &serde_json::Map<String, Value>, key: &str) -> AppResult<String> {
    details
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::protocol("bad_subject".into(), format!("missing or invalid '{}'", key)))
}
