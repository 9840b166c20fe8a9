//!
//! groupgate authority service
//! ---------------------------
//! This module defines the protocol-facing authority surface and its
//! Unix-domain-socket frontend.
//!
//! Responsibilities:
//! - Dispatch of the three authority methods (`CheckAuthorization`,
//!   `CancelCheckAuthorization`, `EnumerateActions`) and property reads
//!   (`BackendName`, `BackendVersion`, `BackendFeatures`). Member and property
//!   names are carried verbatim from the established authority convention.
//! - Orchestration of subject resolution and the group-match decision, with an
//!   audit log line for every check.
//! - The accept loop: newline-delimited JSON frames over a Unix socket, peer
//!   identity via SO_PEERCRED, one peer name (`:1.N`) per connection.
//!
//! Credential failures are folded into a deny before any reply is built; only
//! malformed requests produce error replies.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::decision::{decide, Decision, EtcGroupDatabase, GroupDatabase};
use crate::error::{AppError, AppResult};
use crate::identity::{CredentialSource, Credentials, ProcTable, Subject, SubjectResolver};
use crate::policy::{PolicyRule, PolicyStore};

pub const BACKEND_NAME: &str = "groupgate";
pub const BACKEND_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Feature bitmask: no temporary or interactive grants.
pub const BACKEND_FEATURES: u32 = 0;

/// Runtime configuration, read from the environment in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Policy file or directory. None probes the default locations.
    pub policy_path: Option<PathBuf>,
    pub socket_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            policy_path: std::env::var("GROUPGATE_POLICY").ok().map(PathBuf::from),
            socket_path: std::env::var("GROUPGATE_SOCKET")
                .unwrap_or_else(|_| "/run/groupgate.sock".to_string())
                .into(),
        }
    }
}

/// Connection-scoped peer names and their pids. This is the only cross-request
/// state in the daemon; decisions themselves share nothing mutable.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, u32>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    pub fn register(&self, pid: u32) -> String {
        let name = format!(":1.{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.peers.write().insert(name.clone(), pid);
        name
    }

    pub fn unregister(&self, name: &str) {
        self.peers.write().remove(name);
    }

    pub fn pid_of(&self, name: &str) -> Option<u32> {
        self.peers.read().get(name).copied()
    }
}

/// Credential introspection backed by the peer registry and the OS process
/// table. A bus-name subject resolves to the pid recorded for that peer's
/// connection; both paths re-read /proc on every call so no identity is ever
/// cached across requests.
pub struct ProcCredentialSource {
    proc_table: ProcTable,
    peers: Arc<PeerRegistry>,
}

impl ProcCredentialSource {
    pub fn new(proc_table: ProcTable, peers: Arc<PeerRegistry>) -> Self {
        Self { proc_table, peers }
    }
}

impl CredentialSource for ProcCredentialSource {
    fn credentials_for_pid(&self, pid: u32) -> AppResult<Credentials> {
        self.proc_table.credentials(pid)
    }

    fn credentials_for_bus_name(&self, name: &str) -> AppResult<Credentials> {
        let pid = self
            .peers
            .pid_of(name)
            .ok_or_else(|| AppError::credential("unknown_peer".into(), format!("no peer named '{}'", name)))?;
        self.proc_table.credentials(pid)
    }
}

/// One row of the `EnumerateActions` reply: the bare action id plus fixed
/// metadata. The three implicit fields are 1 ("authentication required") for
/// every caller class; no implicit-grant tiers are modeled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub action_id: String,
    pub description: String,
    pub message: String,
    pub vendor_name: String,
    pub vendor_url: String,
    pub icon_name: String,
    pub implicit_any: u32,
    pub implicit_inactive: u32,
    pub implicit_active: u32,
    pub annotations: HashMap<String, String>,
}

impl ActionDescriptor {
    fn for_rule(rule: &PolicyRule) -> Self {
        ActionDescriptor {
            action_id: rule.action_id.clone(),
            description: String::new(),
            message: String::new(),
            vendor_name: String::new(),
            vendor_url: String::new(),
            icon_name: String::new(),
            implicit_any: 1,
            implicit_inactive: 1,
            implicit_active: 1,
            annotations: HashMap::new(),
        }
    }
}

/// The authority service proper: immutable policy plus the resolver and group
/// database it consults. Constructed once before serving starts and captured
/// by every connection task; nothing in here mutates after construction.
pub struct AuthorityService<S: CredentialSource, G: GroupDatabase> {
    store: Arc<PolicyStore>,
    resolver: SubjectResolver<S>,
    groups: G,
}

impl<S: CredentialSource, G: GroupDatabase> AuthorityService<S, G> {
    pub fn new(store: Arc<PolicyStore>, source: S, proc_table: ProcTable, groups: G) -> Self {
        Self { store, resolver: SubjectResolver::new(source, proc_table), groups }
    }

    /// Dispatch one request frame. Errors escaping here are protocol-level;
    /// credential failures have already been folded into a deny.
    pub fn handle(&self, frame: &Value) -> AppResult<Value> {
        let member = frame
            .get("member")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::protocol("bad_frame", "missing 'member'"))?;
        match member {
            "CheckAuthorization" => self.check_authorization(frame),
            "CancelCheckAuthorization" => self.cancel_check_authorization(frame),
            "EnumerateActions" => self.enumerate_actions(frame),
            "Get" => self.get_property(frame),
            other => Err(AppError::protocol(
                "unknown_member".into(),
                format!("unknown member '{}'", other),
            )),
        }
    }

    /// `CheckAuthorization(subject, action_id, details, flags, cancellation_id)`.
    ///
    /// Fully synchronous: the decision is computed in full before the reply is
    /// produced. `details`, `flags` and `cancellation_id` are parsed for frame
    /// validity but carry no semantics here (no interactive flow exists).
    fn check_authorization(&self, frame: &Value) -> AppResult<Value> {
        let subject_wire = frame
            .get("subject")
            .ok_or_else(|| AppError::protocol("bad_frame", "missing 'subject'"))?;
        let subject = Subject::from_wire(subject_wire)?;
        let action_id = frame
            .get("action_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::protocol("bad_frame", "missing 'action_id'"))?;
        let _details = parse_string_map(frame.get("details"))?;
        let _flags = parse_flags(frame.get("flags"))?;
        let _cancellation_id = parse_optional_str(frame.get("cancellation_id"))?;

        let decision = match self.resolver.resolve(&subject) {
            Ok(credentials) => decide(&self.store, action_id, &credentials, &self.groups),
            Err(e) => {
                // Fail closed. The reason stays local; the caller sees a plain
                // deny, never an error it could use as an oracle.
                debug!(code = e.code_str(), "credential resolution failed: {}", e.message());
                Decision::deny()
            }
        };

        info!(
            target: "audit",
            "{} {}allowed to do action-id {}",
            subject.describe(),
            if decision.allowed { "" } else { "NOT " },
            action_id
        );

        serde_json::to_value(&decision).map_err(|e| AppError::internal("encode".into(), e.to_string()))
    }

    /// Always succeeds immediately: checks are synchronous, so nothing is ever
    /// outstanding to cancel.
    fn cancel_check_authorization(&self, frame: &Value) -> AppResult<Value> {
        let _cancellation_id = parse_optional_str(frame.get("cancellation_id"))?;
        Ok(Value::Null)
    }

    /// One descriptor per policy rule, in policy file order. The locale is
    /// parsed and ignored; descriptions are not localized.
    fn enumerate_actions(&self, frame: &Value) -> AppResult<Value> {
        let _locale = parse_optional_str(frame.get("locale"))?;
        let actions: Vec<ActionDescriptor> =
            self.store.rules().iter().map(ActionDescriptor::for_rule).collect();
        serde_json::to_value(actions).map_err(|e| AppError::internal("encode".into(), e.to_string()))
    }

    fn get_property(&self, frame: &Value) -> AppResult<Value> {
        let property = frame
            .get("property")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::protocol("bad_frame", "missing 'property'"))?;
        match property {
            "BackendName" => Ok(json!(BACKEND_NAME)),
            "BackendVersion" => Ok(json!(BACKEND_VERSION)),
            "BackendFeatures" => Ok(json!(BACKEND_FEATURES)),
            other => Err(AppError::protocol(
                "unknown_property".into(),
                format!("unknown property '{}'", other),
            )),
        }
    }
}

fn parse_string_map(value: Option<&Value>) -> AppResult<HashMap<String, String>> {
    let Some(value) = value else { return Ok(HashMap::new()) };
    let map = value
        .as_object()
        .ok_or_else(|| AppError::protocol("bad_frame", "'details' must be a map"))?;
    let mut out = HashMap::new();
    for (k, v) in map {
        let v = v
            .as_str()
            .ok_or_else(|| AppError::protocol("bad_frame", "'details' values must be strings"))?;
        out.insert(k.clone(), v.to_string());
    }
    Ok(out)
}

fn parse_flags(value: Option<&Value>) -> AppResult<u32> {
    let Some(value) = value else { return Ok(0) };
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| AppError::protocol("bad_frame", "'flags' must be an unsigned integer"))
}

fn parse_optional_str(value: Option<&Value>) -> AppResult<String> {
    let Some(value) = value else { return Ok(String::new()) };
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AppError::protocol("bad_frame", "expected a string argument"))
}

/// Run the daemon with configuration from the environment.
pub async fn run() -> anyhow::Result<()> {
    run_with_config(Config::from_env()).await
}

/// Load policy, bind the socket and serve until the accept loop terminates.
/// Policy and transport failures here are fatal: the daemon never serves a
/// partially loaded policy and never retries a failed bind.
pub async fn run_with_config(cfg: Config) -> anyhow::Result<()> {
    let store = match &cfg.policy_path {
        Some(path) => PolicyStore::load(path),
        None => PolicyStore::load_default(),
    }
    .context("loading policy")?;
    info!(target: "startup", "policy loaded: {} rule(s)", store.len());
    for rule in store.rules() {
        debug!(target: "startup", "rule: {} -> {:?}", rule.action_id, rule.allowed_groups);
    }

    let peers = Arc::new(PeerRegistry::default());
    let source = ProcCredentialSource::new(ProcTable::default(), peers.clone());
    let service = Arc::new(AuthorityService::new(
        Arc::new(store),
        source,
        ProcTable::default(),
        EtcGroupDatabase::default(),
    ));

    // A stale socket from a previous run would make bind fail spuriously.
    if cfg.socket_path.exists() {
        std::fs::remove_file(&cfg.socket_path)
            .with_context(|| format!("removing stale socket {}", cfg.socket_path.display()))?;
    }
    let listener = UnixListener::bind(&cfg.socket_path)
        .map_err(|e| AppError::transport("bind_failed".into(), format!("{}: {}", cfg.socket_path.display(), e)))
        .context("binding service socket")?;
    info!(target: "startup", "serving on {}", cfg.socket_path.display());

    loop {
        let (stream, _) = listener.accept().await.context("accepting connection")?;
        let service = service.clone();
        let peers = peers.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, service, peers).await {
                warn!("connection ended with error: {}", e);
            }
        });
    }
}

/// Serve one connection: register a peer name for it, then answer frames
/// strictly in arrival order. A malformed frame gets an error reply and the
/// connection keeps going; it never affects other requests.
async fn serve_connection<S, G>(
    stream: UnixStream,
    service: Arc<AuthorityService<S, G>>,
    peers: Arc<PeerRegistry>,
) -> anyhow::Result<()>
where
    S: CredentialSource + 'static,
    G: GroupDatabase + 'static,
{
    let pid = stream
        .peer_cred()
        .ok()
        .and_then(|c| c.pid())
        .and_then(|p| u32::try_from(p).ok())
        .unwrap_or(0);
    let peer_name = peers.register(pid);
    debug!("peer connected as {} (pid {})", peer_name, pid);

    let result = drive_connection(stream, &service).await;
    peers.unregister(&peer_name);
    debug!("peer {} disconnected", peer_name);
    result
}

async fn drive_connection<S, G>(
    stream: UnixStream,
    service: &AuthorityService<S, G>,
) -> anyhow::Result<()>
where
    S: CredentialSource,
    G: GroupDatabase,
{
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Value>(&line) {
            Ok(frame) => reply_for(service.handle(&frame)),
            Err(e) => reply_for(Err(AppError::protocol("bad_frame".into(), format!("invalid frame: {}", e)))),
        };
        let mut buf = serde_json::to_vec(&reply)?;
        buf.push(b'\n');
        writer.write_all(&buf).await?;
    }
    Ok(())
}

/// Encode a dispatch result as a wire reply frame.
pub fn reply_for(result: AppResult<Value>) -> Value {
    match result {
        Ok(body) => json!({ "ok": body }),
        Err(e) => json!({ "error": { "name": e.wire_name(), "message": e.to_string() } }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::StaticGroupDatabase;

    struct FixedSource(AppResult<Credentials>);

    impl CredentialSource for FixedSource {
        fn credentials_for_pid(&self, _pid: u32) -> AppResult<Credentials> { self.0.clone() }
        fn credentials_for_bus_name(&self, _name: &str) -> AppResult<Credentials> { self.0.clone() }
    }

    fn fixture_service(
        creds: AppResult<Credentials>,
    ) -> (AuthorityService<FixedSource, StaticGroupDatabase>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy");
        std::fs::write(&policy, "org.example.reboot=\"adm,wheel\"\norg.example.suspend=\"users\"\n").unwrap();
        let store = Arc::new(PolicyStore::load(&policy).unwrap());
        // /proc fixture for pid 42 with start time 900.
        let pid_dir = dir.path().join("42");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(
            pid_dir.join("stat"),
            "42 (svc) S 1 42 42 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 900 0 0",
        )
        .unwrap();
        let groups = StaticGroupDatabase::new([("adm", 4u32), ("wheel", 10u32), ("users", 100u32)]);
        let service = AuthorityService::new(store, FixedSource(creds), ProcTable::with_root(dir.path()), groups);
        (service, dir)
    }

    fn member_creds() -> Credentials {
        Credentials { uid: 1000, euid: 1000, primary_gid: 1000, supplementary_gids: vec![4, 1000] }
    }

    fn check_frame(subject: Value, action_id: &str) -> Value {
        json!({
            "member": "CheckAuthorization",
            "subject": subject,
            "action_id": action_id,
            "details": {},
            "flags": 0,
            "cancellation_id": ""
        })
    }

    #[test]
    fn check_allows_supplementary_member() {
        let (service, _dir) = fixture_service(Ok(member_creds()));
        let body = service
            .handle(&check_frame(json!(["unix-process", {"pid": 42, "start-time": 900}]), "org.example.reboot"))
            .unwrap();
        assert_eq!(body["allowed"], json!(true));
        assert_eq!(body["is_challenge"], json!(false));
        assert_eq!(body["details"], json!({}));
    }

    #[test]
    fn check_folds_credential_failure_into_deny() {
        let (service, _dir) = fixture_service(Err(AppError::credential("lookup", "gone")));
        let body = service
            .handle(&check_frame(json!(["unix-process", {"pid": 42, "start-time": 900}]), "org.example.reboot"))
            .unwrap();
        assert_eq!(body["allowed"], json!(false));
    }

    #[test]
    fn check_denies_on_start_time_mismatch() {
        let (service, _dir) = fixture_service(Ok(member_creds()));
        let body = service
            .handle(&check_frame(json!(["unix-process", {"pid": 42, "start-time": 901}]), "org.example.reboot"))
            .unwrap();
        assert_eq!(body["allowed"], json!(false));
    }

    #[test]
    fn check_denies_session_subjects() {
        let (service, _dir) = fixture_service(Ok(member_creds()));
        let body = service
            .handle(&check_frame(json!(["unix-session", {"session-id": "c2"}]), "org.example.reboot"))
            .unwrap();
        assert_eq!(body["allowed"], json!(false));
    }

    #[test]
    fn check_rejects_unknown_subject_kind_as_protocol_error() {
        let (service, _dir) = fixture_service(Ok(member_creds()));
        let err = service
            .handle(&check_frame(json!(["galactic-empire", {}]), "org.example.reboot"))
            .unwrap_err();
        assert!(matches!(err, AppError::Protocol { .. }));
    }

    #[test]
    fn cancel_always_succeeds() {
        let (service, _dir) = fixture_service(Ok(member_creds()));
        let body = service
            .handle(&json!({"member": "CancelCheckAuthorization", "cancellation_id": "never-issued"}))
            .unwrap();
        assert_eq!(body, Value::Null);
    }

    #[test]
    fn enumerate_preserves_policy_order() {
        let (service, _dir) = fixture_service(Ok(member_creds()));
        let body = service.handle(&json!({"member": "EnumerateActions", "locale": "en_US"})).unwrap();
        let actions: Vec<ActionDescriptor> = serde_json::from_value(body).unwrap();
        let ids: Vec<&str> = actions.iter().map(|a| a.action_id.as_str()).collect();
        assert_eq!(ids, vec!["org.example.reboot", "org.example.suspend"]);
        assert_eq!(actions[0].implicit_any, 1);
        assert!(actions[0].annotations.is_empty());
        assert!(actions[0].description.is_empty());
    }

    #[test]
    fn properties_are_fixed() {
        let (service, _dir) = fixture_service(Ok(member_creds()));
        let get = |p: &str| service.handle(&json!({"member": "Get", "property": p})).unwrap();
        assert_eq!(get("BackendName"), json!("groupgate"));
        assert_eq!(get("BackendVersion"), json!(BACKEND_VERSION));
        assert_eq!(get("BackendFeatures"), json!(0));
        assert!(service.handle(&json!({"member": "Get", "property": "Nope"})).is_err());
    }

    #[test]
    fn unknown_member_is_protocol_error() {
        let (service, _dir) = fixture_service(Ok(member_creds()));
        let err = service.handle(&json!({"member": "SelfDestruct"})).unwrap_err();
        assert_eq!(err.code_str(), "unknown_member");
    }

    #[test]
    fn peer_registry_round_trip() {
        let reg = PeerRegistry::default();
        let a = reg.register(100);
        let b = reg.register(200);
        assert_ne!(a, b);
        assert_eq!(reg.pid_of(&a), Some(100));
        reg.unregister(&a);
        assert_eq!(reg.pid_of(&a), None);
        assert_eq!(reg.pid_of(&b), Some(200));
    }

    #[test]
    fn reply_encoding() {
        let ok = reply_for(Ok(json!({"allowed": false})));
        assert_eq!(ok["ok"]["allowed"], json!(false));
        let err = reply_for(Err(AppError::protocol("bad_frame", "nope")));
        assert_eq!(err["error"]["name"], json!("org.freedesktop.DBus.Error.InvalidArgs"));
    }
}
