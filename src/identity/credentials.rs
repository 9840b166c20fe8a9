//! Verified process credentials and the /proc readers that produce them.
//!
//! Credentials are resolved per request and never cached: a decision must act
//! on the identity the process has right now, not the identity it had when
//! some earlier request was made.

use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub primary_gid: u32,
    /// Supplementary gids in OS order. Only these ever grant access.
    pub supplementary_gids: Vec<u32>,
}

/// Reader over the OS process table. The root is overridable so tests can
/// point it at a fixture directory instead of /proc.
#[derive(Debug, Clone)]
pub struct ProcTable {
    root: PathBuf,
}

impl Default for ProcTable {
    fn default() -> Self { Self { root: PathBuf::from("/proc") } }
}

impl ProcTable {
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self { Self { root: root.into() } }

    /// Process start time in clock ticks since boot, from the 22nd field of
    /// `<root>/<pid>/stat`. Serves as an identity nonce tied to the pid: a
    /// later process reusing the pid will report a different start time.
    pub fn start_time(&self, pid: u32) -> AppResult<u64> {
        let path = self.root.join(pid.to_string()).join("stat");
        let text = read_proc_file(&path)?;
        parse_stat_start_time(&text)
            .ok_or_else(|| AppError::credential("bad_stat".into(), format!("{}: cannot parse start time", path.display())))
    }

    /// Real/effective uid, primary gid and supplementary gids from
    /// `<root>/<pid>/status`.
    pub fn credentials(&self, pid: u32) -> AppResult<Credentials> {
        let path = self.root.join(pid.to_string()).join("status");
        let text = read_proc_file(&path)?;
        parse_status_credentials(&text)
            .ok_or_else(|| AppError::credential("bad_status".into(), format!("{}: cannot parse credentials", path.display())))
    }
}

fn read_proc_file(path: &Path) -> AppResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| AppError::credential("proc_read".into(), format!("{}: {}", path.display(), e)))
}

/// Extract the start time (field 22) from a stat line.
///
/// The second field is the process name in parentheses and may itself contain
/// spaces or ')' characters, so field splitting only starts after the *last*
/// ')'. From there the remainder begins at field 3; the start time is 19
/// fields further on.
fn parse_stat_start_time(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(19)?.parse().ok()
}

fn parse_status_credentials(status: &str) -> Option<Credentials> {
    let mut uid: Option<(u32, u32)> = None;
    let mut gid: Option<u32> = None;
    let mut groups: Option<Vec<u32>> = None;

    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            let mut it = rest.split_whitespace();
            let real = it.next()?.parse().ok()?;
            let effective = it.next()?.parse().ok()?;
            uid = Some((real, effective));
        } else if let Some(rest) = line.strip_prefix("Gid:") {
            gid = Some(rest.split_whitespace().next()?.parse().ok()?);
        } else if let Some(rest) = line.strip_prefix("Groups:") {
            let mut gids = Vec::new();
            for tok in rest.split_whitespace() {
                gids.push(tok.parse().ok()?);
            }
            groups = Some(gids);
        }
    }

    let (uid, euid) = uid?;
    Some(Credentials {
        uid,
        euid,
        primary_gid: gid?,
        supplementary_gids: groups?,
    })
}
