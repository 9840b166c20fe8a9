//! Resolution of a parsed subject to verified credentials.
//!
//! Every failure in here is a credential error: the service folds those into
//! a plain deny so callers can never use error replies as an oracle for why
//! access was refused.

use tracing::debug;

use super::credentials::{Credentials, ProcTable};
use super::subject::Subject;
use crate::error::{AppError, AppResult};

/// What the resolver requires from the transport and OS: credential
/// introspection for a pid or for a named bus peer.
pub trait CredentialSource: Send + Sync {
    fn credentials_for_pid(&self, pid: u32) -> AppResult<Credentials>;
    fn credentials_for_bus_name(&self, name: &str) -> AppResult<Credentials>;
}

pub struct SubjectResolver<S: CredentialSource> {
    source: S,
    proc_table: ProcTable,
}

impl<S: CredentialSource> SubjectResolver<S> {
    pub fn new(source: S, proc_table: ProcTable) -> Self {
        Self { source, proc_table }
    }

    /// Resolve a subject to verified credentials.
    ///
    /// Process subjects get two anti-spoofing checks: the start time supplied
    /// in the (untrusted) request must exactly match the one the process table
    /// reports now, which defeats pid-reuse spoofing; and the real uid must
    /// equal the effective uid, which defends against a caller that exec'd a
    /// privilege-changing binary to alter its effective identity while its
    /// real identity stays unprivileged. Session subjects are never resolved.
    pub fn resolve(&self, subject: &Subject) -> AppResult<Credentials> {
        let creds = match subject {
            Subject::UnixProcess { pid, start_time } => {
                let creds = self.source.credentials_for_pid(*pid)?;
                let actual = self.proc_table.start_time(*pid)?;
                if actual != *start_time {
                    debug!(pid, claimed = start_time, actual, "start time mismatch");
                    return Err(AppError::credential(
                        "start_time_mismatch".into(),
                        format!("pid {}: claimed start time {} != {}", pid, start_time, actual),
                    ));
                }
                creds
            }
            Subject::SystemBusName { name } => self.source.credentials_for_bus_name(name)?,
            Subject::UnixSession { session_id } => {
                return Err(AppError::credential(
                    "session_unsupported".into(),
                    format!("session subjects are not resolved (session id: {})", session_id),
                ));
            }
        };

        if creds.uid != creds.euid {
            return Err(AppError::credential(
                "uid_mismatch".into(),
                format!("real uid {} != effective uid {}", creds.uid, creds.euid),
            ));
        }
        Ok(creds)
    }
}
