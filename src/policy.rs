//! Static group policy: one rule per line mapping an action id to the group
//! names allowed to perform it.
//!
//! Format (no whitespace handling, no quote or comma escaping):
//!
//!   org.freedesktop.login1.reboot="adm,wheel"
//!   # comments start with '#', blank lines are ignored
//!
//! Loading is fail-fast: any malformed line, duplicate action id or unreadable
//! source fails the whole load, so a corrupt file can never yield a silently
//! incomplete policy. The store is built once before the service accepts
//! requests and is read-only afterwards, so it can be shared across in-flight
//! requests without synchronization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Upper bound on groups per rule. An explicit parsing constraint: a rule
/// naming more groups than this fails the load.
pub const MAX_GROUPS_PER_RULE: usize = 10;

/// Default locations probed when no policy path is configured, in order.
pub const DEFAULT_POLICY_PATHS: [&str; 2] = [
    "/etc/groupgate.policy",
    "/usr/share/defaults/etc/groupgate.policy",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRule {
    pub action_id: String,
    /// Group names in file order; matched first-to-last.
    pub allowed_groups: Vec<String>,
}

/// Action-id indexed rule set, preserving file order for enumeration.
#[derive(Debug, Default)]
pub struct PolicyStore {
    rules: Vec<PolicyRule>,
    index: HashMap<String, usize>,
}

impl PolicyStore {
    /// Load policy from a file, or from every regular file in a directory in
    /// lexicographic filename order (deterministic enumeration order).
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut store = PolicyStore::default();
        for source in policy_sources(path)? {
            let text = std::fs::read_to_string(&source).map_err(|e| {
                AppError::config("unreadable_policy".into(), format!("{}: {}", source.display(), e))
            })?;
            store.ingest(&text, &source.display().to_string())?;
        }
        Ok(store)
    }

    /// Probe the default policy locations and load the first that exists.
    pub fn load_default() -> AppResult<Self> {
        for candidate in DEFAULT_POLICY_PATHS {
            let p = Path::new(candidate);
            if p.exists() {
                return Self::load(p);
            }
        }
        Err(AppError::config(
            "no_policy_file".into(),
            format!("no policy file found at {}", DEFAULT_POLICY_PATHS.join(" or ")),
        ))
    }

    /// Parse rules out of one text source, appending to the store.
    fn ingest(&mut self, text: &str, origin: &str) -> AppResult<()> {
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches(['\r', '\n']);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let rule = parse_rule(line).map_err(|msg| {
                AppError::config("bad_policy_line".into(), format!("{}:{}: {}", origin, lineno + 1, msg))
            })?;
            if self.index.contains_key(&rule.action_id) {
                return Err(AppError::config(
                    "duplicate_action_id".into(),
                    format!("{}:{}: duplicate action id '{}'", origin, lineno + 1, rule.action_id),
                ));
            }
            self.index.insert(rule.action_id.clone(), self.rules.len());
            self.rules.push(rule);
        }
        Ok(())
    }

    /// Exact, case-sensitive lookup.
    pub fn lookup(&self, action_id: &str) -> Option<&PolicyRule> {
        self.index.get(action_id).map(|&i| &self.rules[i])
    }

    /// Rules in file order.
    pub fn rules(&self) -> &[PolicyRule] { &self.rules }

    pub fn len(&self) -> usize { self.rules.len() }

    pub fn is_empty(&self) -> bool { self.rules.is_empty() }
}

/// Expand a path into the ordered list of text sources it denotes.
fn policy_sources(path: &Path) -> AppResult<Vec<PathBuf>> {
    let meta = std::fs::metadata(path).map_err(|e| {
        AppError::config("unreadable_policy".into(), format!("{}: {}", path.display(), e))
    })?;
    if meta.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = Vec::new();
    let entries = std::fs::read_dir(path).map_err(|e| {
        AppError::config("unreadable_policy".into(), format!("{}: {}", path.display(), e))
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            AppError::config("unreadable_policy".into(), format!("{}: {}", path.display(), e))
        })?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    if files.is_empty() {
        return Err(AppError::config(
            "no_policy_file".into(),
            format!("{}: directory contains no policy files", path.display()),
        ));
    }
    Ok(files)
}

/// Parse one `action-id="group1,...,groupN"` line.
///
/// Grammar, enforced strictly: exactly one '=', a non-empty action id with no
/// whitespace, the value enclosed in double quotes with nothing but trailing
/// whitespace after the closing quote, and 1..=MAX_GROUPS_PER_RULE non-empty
/// comma-separated group names with no whitespace.
fn parse_rule(line: &str) -> Result<PolicyRule, String> {
    let mut parts = line.splitn(3, '=');
    let action_id = parts.next().unwrap_or("");
    let value = parts.next().ok_or_else(|| "missing '='".to_string())?;
    if parts.next().is_some() {
        return Err("more than one '='".into());
    }
    if action_id.is_empty() {
        return Err("empty action id".into());
    }
    if action_id.chars().any(char::is_whitespace) {
        return Err("whitespace in action id".into());
    }

    let value = value
        .strip_prefix('"')
        .ok_or_else(|| "group list must start with '\"'".to_string())?;
    let (groups_text, rest) = value
        .split_once('"')
        .ok_or_else(|| "missing closing '\"'".to_string())?;
    if !rest.trim().is_empty() {
        return Err("trailing content after closing '\"'".into());
    }

    let mut allowed_groups = Vec::new();
    for group in groups_text.split(',') {
        if group.is_empty() {
            return Err("empty group name".into());
        }
        if group.chars().any(char::is_whitespace) {
            return Err(format!("whitespace in group name '{}'", group));
        }
        if allowed_groups.len() >= MAX_GROUPS_PER_RULE {
            return Err(format!("more than {} groups", MAX_GROUPS_PER_RULE));
        }
        allowed_groups.push(group.to_string());
    }

    Ok(PolicyRule { action_id: action_id.to_string(), allowed_groups })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_from(text: &str) -> AppResult<PolicyStore> {
        let mut store = PolicyStore::default();
        store.ingest(text, "test").map(|_| store)
    }

    #[test]
    fn round_trip_single_rule() {
        let store = store_from("a.b.c=\"g1,g2\"\n").unwrap();
        let rule = store.lookup("a.b.c").expect("rule present");
        assert_eq!(rule.allowed_groups, vec!["g1", "g2"]);
    }

    #[test]
    fn comments_and_blank_lines_skipped() {
        let store = store_from("# header\n\norg.x.y=\"adm\"\n# tail\n").unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.lookup("org.x.y").is_some());
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let store = store_from("org.x.y=\"adm\"\n").unwrap();
        assert!(store.lookup("org.x.Y").is_none());
    }

    #[test]
    fn missing_equals_fails_load() {
        assert!(store_from("good=\"adm\"\nbad \"adm\"\n").is_err());
    }

    #[test]
    fn missing_closing_quote_fails_load() {
        assert!(store_from("a=\"adm\n").is_err());
    }

    #[test]
    fn second_equals_fails_load() {
        assert!(store_from("a=b=\"adm\"\n").is_err());
    }

    #[test]
    fn trailing_garbage_fails_load() {
        assert!(store_from("a=\"adm\" extra\n").is_err());
    }

    #[test]
    fn group_limit_enforced() {
        let groups = (0..=MAX_GROUPS_PER_RULE).map(|i| format!("g{}", i)).collect::<Vec<_>>().join(",");
        assert!(store_from(&format!("a=\"{}\"\n", groups)).is_err());
        let groups = (0..MAX_GROUPS_PER_RULE).map(|i| format!("g{}", i)).collect::<Vec<_>>().join(",");
        assert_eq!(store_from(&format!("a=\"{}\"\n", groups)).unwrap().lookup("a").unwrap().allowed_groups.len(), MAX_GROUPS_PER_RULE);
    }

    #[test]
    fn duplicate_action_id_fails_load() {
        assert!(store_from("a=\"g1\"\na=\"g2\"\n").is_err());
    }

    #[test]
    fn failed_load_retains_nothing() {
        let err = store_from("a=\"g1\"\nbroken\n");
        assert!(err.is_err(), "load must fail as a whole");
    }

    #[test]
    fn rules_preserve_file_order() {
        let store = store_from("c=\"g\"\na=\"g\"\nb=\"g\"\n").unwrap();
        let order: Vec<&str> = store.rules().iter().map(|r| r.action_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }
}
