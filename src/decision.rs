//! The allow/deny decision: pure group matching over resolved credentials.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::identity::Credentials;
use crate::policy::PolicyStore;

/// Resolution of group names to numeric ids via the OS group database.
pub trait GroupDatabase: Send + Sync {
    /// Returns None for names the database does not know; callers skip those.
    fn gid_by_name(&self, name: &str) -> Option<u32>;
}

/// Group database backed by an /etc/group format file
/// (`name:password:gid:members` per line).
#[derive(Debug, Clone)]
pub struct EtcGroupDatabase {
    path: PathBuf,
}

impl Default for EtcGroupDatabase {
    fn default() -> Self { Self { path: PathBuf::from("/etc/group") } }
}

impl EtcGroupDatabase {
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self { Self { path: path.into() } }
}

impl GroupDatabase for EtcGroupDatabase {
    fn gid_by_name(&self, name: &str) -> Option<u32> {
        lookup_group_file(&self.path, name)
    }
}

fn lookup_group_file(path: &Path, name: &str) -> Option<u32> {
    let text = std::fs::read_to_string(path).ok()?;
    for line in text.lines() {
        let mut fields = line.split(':');
        if fields.next() != Some(name) {
            continue;
        }
        let _password = fields.next()?;
        return fields.next()?.parse().ok();
    }
    None
}

/// Fixed name → gid map, for tests and embedded setups.
#[derive(Debug, Clone, Default)]
pub struct StaticGroupDatabase {
    groups: HashMap<String, u32>,
}

impl StaticGroupDatabase {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self { groups: entries.into_iter().map(|(n, g)| (n.into(), g)).collect() }
    }
}

impl GroupDatabase for StaticGroupDatabase {
    fn gid_by_name(&self, name: &str) -> Option<u32> { self.groups.get(name).copied() }
}

/// The outcome of one authorization check. `is_challenge` is always false:
/// there is no interactive flow, a caller is either in an allowed group right
/// now or it is denied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub is_challenge: bool,
    pub details: HashMap<String, String>,
}

impl Decision {
    pub fn deny() -> Self {
        Decision { allowed: false, is_challenge: false, details: HashMap::new() }
    }

    pub fn allow() -> Self {
        Decision { allowed: true, is_challenge: false, details: HashMap::new() }
    }
}

/// Decide whether credentials satisfy the policy for an action.
///
/// An action id absent from the store denies: no implicit policy exists.
/// Group names that the database cannot resolve are skipped, not fatal.
/// Membership is tested against the supplementary gid set only; any
/// supplementary entry equal to the primary gid is excluded, because a process
/// can change its primary group through a privilege-changing exec while
/// supplementary membership is not as trivially forged. First match allows.
///
/// Pure and deterministic given its inputs; safe to call concurrently from
/// any number of in-flight requests.
pub fn decide(
    store: &PolicyStore,
    action_id: &str,
    credentials: &Credentials,
    groups: &dyn GroupDatabase,
) -> Decision {
    let Some(rule) = store.lookup(action_id) else {
        return Decision::deny();
    };

    for group_name in &rule.allowed_groups {
        let Some(gid) = groups.gid_by_name(group_name) else {
            continue;
        };
        let member = credentials
            .supplementary_gids
            .iter()
            .any(|g| *g != credentials.primary_gid && *g == gid);
        if member {
            return Decision::allow();
        }
    }
    Decision::deny()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(primary_gid: u32, supplementary: &[u32]) -> Credentials {
        Credentials { uid: 1000, euid: 1000, primary_gid, supplementary_gids: supplementary.to_vec() }
    }

    fn store(text: &str) -> PolicyStore {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("policy");
        std::fs::write(&file, text).unwrap();
        PolicyStore::load(&file).unwrap()
    }

    fn adm_wheel_db() -> StaticGroupDatabase {
        StaticGroupDatabase::new([("adm", 4u32), ("wheel", 10u32)])
    }

    #[test]
    fn absent_action_denies_regardless_of_credentials() {
        let store = store("org.x.y=\"adm\"\n");
        let d = decide(&store, "org.x.z", &creds(4, &[4, 10]), &adm_wheel_db());
        assert_eq!(d, Decision::deny());
    }

    #[test]
    fn supplementary_membership_allows() {
        let store = store("org.x.y=\"adm,wheel\"\n");
        let d = decide(&store, "org.x.y", &creds(100, &[1000, 4]), &adm_wheel_db());
        assert_eq!(d, Decision::allow());
    }

    #[test]
    fn primary_gid_never_grants_access() {
        let store = store("org.x.y=\"adm,wheel\"\n");
        // adm is the primary gid and also listed as supplementary; excluded.
        let d = decide(&store, "org.x.y", &creds(4, &[1000, 4]), &adm_wheel_db());
        assert_eq!(d, Decision::deny());
        // Primary-only membership, not in the supplementary set at all.
        let d = decide(&store, "org.x.y", &creds(4, &[1000]), &adm_wheel_db());
        assert_eq!(d, Decision::deny());
    }

    #[test]
    fn unresolvable_group_names_are_skipped() {
        let store = store("org.x.y=\"nosuchgroup,wheel\"\n");
        let d = decide(&store, "org.x.y", &creds(100, &[10]), &adm_wheel_db());
        assert_eq!(d, Decision::allow());
    }

    #[test]
    fn no_match_denies() {
        let store = store("org.x.y=\"adm,wheel\"\n");
        let d = decide(&store, "org.x.y", &creds(100, &[1000, 2000]), &adm_wheel_db());
        assert_eq!(d, Decision::deny());
    }

    #[test]
    fn etc_group_file_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("group");
        std::fs::write(&file, "root:x:0:\nadm:x:4:syslog\nwheel:x:10:alice,bob\n").unwrap();
        let db = EtcGroupDatabase::with_path(&file);
        assert_eq!(db.gid_by_name("adm"), Some(4));
        assert_eq!(db.gid_by_name("wheel"), Some(10));
        assert_eq!(db.gid_by_name("nosuch"), None);
        assert_eq!(EtcGroupDatabase::with_path(dir.path().join("missing")).gid_by_name("adm"), None);
    }
}
