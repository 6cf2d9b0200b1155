//! File observation and delta reconciliation.
//!
//! A polling scan hashes the config file and every auth-dir JSON file;
//! synthesis runs when anything changed and the result is diffed against
//! the last emitted set. Deletions get a short grace window so an atomic
//! replace (remove + create) reads as a modify, not a delete/add pair.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;

use modelgate_auth::{Auth, AuthId, StableIdGenerator};
use modelgate_common::{GatewayConfig, content_hash};

use crate::dispatch::{AuthChange, DispatchQueue};
use crate::synthesizer::{ConfigSynthesizer, FileSynthesizer, SynthesisContext};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CONFIG_DEBOUNCE: Duration = Duration::from_millis(150);
/// A remove followed by a create within this window is a modify.
const DELETE_GRACE: Duration = Duration::from_secs(1);

pub type ConfigCallback = Arc<dyn Fn(GatewayConfig) + Send + Sync>;

pub struct Watcher {
    config_path: Option<PathBuf>,
    auth_dir: Option<PathBuf>,
    /// Vendor credential caches observed alongside the auth dir.
    vendor_dirs: Vec<PathBuf>,
    queue: Arc<DispatchQueue>,
    on_config: Option<ConfigCallback>,
    state: Mutex<WatchState>,
}

#[derive(Default)]
struct WatchState {
    config_hash: Option<String>,
    config: GatewayConfig,
    file_hashes: HashMap<PathBuf, String>,
    last_set: HashMap<AuthId, Auth>,
    pending_deletes: HashMap<AuthId, PendingDelete>,
}

struct PendingDelete {
    provider: String,
    deadline: OffsetDateTime,
}

impl Watcher {
    pub fn new(
        config_path: Option<PathBuf>,
        auth_dir: Option<PathBuf>,
        queue: Arc<DispatchQueue>,
        on_config: Option<ConfigCallback>,
    ) -> Self {
        Self {
            config_path,
            auth_dir,
            vendor_dirs: Vec::new(),
            queue,
            on_config,
            state: Mutex::new(WatchState::default()),
        }
    }

    pub fn with_vendor_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.vendor_dirs = dirs;
        self
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.scan_once(OffsetDateTime::now_utc()).await;
            }
        });
    }

    /// One observation pass. Separated from the loop so tests can drive
    /// it with an injected `now`.
    pub async fn scan_once(&self, now: OffsetDateTime) {
        let config_changed = self.refresh_config().await;
        let (files_changed, file_auths) = self.scan_auth_dir(now).await;
        if !config_changed && !files_changed && !self.has_pending_deletes() {
            return;
        }

        let config = {
            let state = self.state.lock().expect("watch state lock");
            state.config.clone()
        };
        let ctx = SynthesisContext {
            config: &config,
            now,
            id_generator: StableIdGenerator::new(),
        };
        let mut full_set = ConfigSynthesizer::new().synthesize(&ctx);
        full_set.extend(file_auths);

        for change in self.reconcile(full_set, now) {
            self.queue.push(change);
        }
    }

    fn has_pending_deletes(&self) -> bool {
        !self
            .state
            .lock()
            .expect("watch state lock")
            .pending_deletes
            .is_empty()
    }

    /// Reloads the config when its hash changed, with a settle delay to
    /// skip half-written files.
    async fn refresh_config(&self) -> bool {
        let Some(path) = self.config_path.as_deref() else {
            return false;
        };
        let Ok(bytes) = tokio::fs::read(path).await else {
            return false;
        };
        let hash = content_hash(&bytes);
        {
            let state = self.state.lock().expect("watch state lock");
            if state.config_hash.as_deref() == Some(hash.as_str()) {
                return false;
            }
        }
        tokio::time::sleep(CONFIG_DEBOUNCE).await;
        let Ok(bytes) = tokio::fs::read(path).await else {
            return false;
        };
        let hash = content_hash(&bytes);
        let parsed = match GatewayConfig::from_yaml(&String::from_utf8_lossy(&bytes)) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "config reload failed, keeping previous");
                return false;
            }
        };
        {
            let mut state = self.state.lock().expect("watch state lock");
            state.config_hash = Some(hash);
            state.config = parsed.clone();
        }
        tracing::info!(path = %path.display(), "config reloaded");
        if let Some(callback) = &self.on_config {
            callback(parsed);
        }
        true
    }

    /// Hashes every credential file; returns whether the set changed and
    /// the synthesized records.
    async fn scan_auth_dir(&self, now: OffsetDateTime) -> (bool, Vec<Auth>) {
        if self.auth_dir.is_none() && self.vendor_dirs.is_empty() {
            return (false, Vec::new());
        }
        let mut current: HashMap<PathBuf, (String, Vec<u8>)> = HashMap::new();
        if let Some(dir) = self.auth_dir.as_deref() {
            collect_json_files(dir, 2, &mut current).await;
        }
        for dir in &self.vendor_dirs {
            collect_json_files(dir, 2, &mut current).await;
        }

        let changed = {
            let mut state = self.state.lock().expect("watch state lock");
            let new_hashes: HashMap<PathBuf, String> = current
                .iter()
                .map(|(path, (hash, _))| (path.clone(), hash.clone()))
                .collect();
            let changed = new_hashes != state.file_hashes;
            state.file_hashes = new_hashes;
            changed
        };

        let synthesizer = FileSynthesizer::new();
        let mut out = Vec::new();
        for (path, (_, bytes)) in &current {
            if let Some(auth) = synthesizer.synthesize_file(path, bytes, now) {
                out.push(auth);
            } else {
                tracing::warn!(path = %path.display(), "skipping unparseable credential file");
            }
        }
        (changed, out)
    }

    /// Diffs the freshly synthesized set against the last emitted one.
    fn reconcile(&self, full_set: Vec<Auth>, now: OffsetDateTime) -> Vec<AuthChange> {
        let mut state = self.state.lock().expect("watch state lock");
        let mut changes = Vec::new();
        let mut new_set: HashMap<AuthId, Auth> = HashMap::new();

        for auth in full_set {
            let id = auth.id.clone();
            // Present again: any pending delete for it is void.
            let was_pending = state.pending_deletes.remove(&id).is_some();
            match state.last_set.get(&id) {
                None => {
                    if was_pending {
                        // Recreated within the grace window: a modify.
                        changes.push(AuthChange::Modify(auth.clone()));
                    } else {
                        changes.push(AuthChange::Add(auth.clone()));
                    }
                }
                Some(previous) => {
                    if !same_identity(previous, &auth) {
                        changes.push(AuthChange::Modify(auth.clone()));
                    }
                }
            }
            new_set.insert(id, auth);
        }

        // Disappeared entries enter the grace window; expired ones delete.
        let mut sorted_missing: Vec<(AuthId, String)> = state
            .last_set
            .iter()
            .filter(|(id, _)| !new_set.contains_key(*id))
            .map(|(id, auth)| (id.clone(), auth.provider.clone()))
            .collect();
        sorted_missing.sort();
        for (id, provider) in sorted_missing {
            state
                .pending_deletes
                .entry(id.clone())
                .or_insert(PendingDelete {
                    provider,
                    deadline: now + DELETE_GRACE,
                });
            // Keep it in the working set until the grace expires.
            if let Some(auth) = state.last_set.get(&id) {
                new_set.insert(id, auth.clone());
            }
        }

        let expired: Vec<AuthId> = state
            .pending_deletes
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let pending = state
                .pending_deletes
                .remove(&id)
                .expect("expired entry exists");
            new_set.remove(&id);
            changes.push(AuthChange::Delete {
                provider: pending.provider,
                id,
            });
        }

        state.last_set = new_set;
        changes
    }
}

fn same_identity(a: &Auth, b: &Auth) -> bool {
    a.provider == b.provider
        && a.label == b.label
        && a.prefix == b.prefix
        && a.status == b.status
        && a.proxy_url == b.proxy_url
        && a.attributes == b.attributes
        && a.metadata == b.metadata
        && a.model_states == b.model_states
}

async fn collect_json_files(
    dir: &Path,
    depth: u8,
    out: &mut HashMap<PathBuf, (String, Vec<u8>)>,
) {
    if depth == 0 {
        return;
    }
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if file_type.is_dir() {
            Box::pin(collect_json_files(&path, depth - 1, out)).await;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(bytes) = tokio::fs::read(&path).await {
            out.insert(path, (content_hash(&bytes), bytes));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn watcher(queue: Arc<DispatchQueue>) -> Watcher {
        Watcher::new(None, None, queue, None)
    }

    fn auth(id: &str, key: &str) -> Auth {
        let mut auth = Auth::new(id, "gemini", datetime!(2025-06-01 00:00:00 UTC));
        auth.attributes
            .insert("api_key".to_string(), key.to_string());
        auth
    }

    #[test]
    fn reconcile_emits_add_modify_delete() {
        let queue = Arc::new(DispatchQueue::new());
        let watcher = watcher(queue);
        let now = datetime!(2025-06-01 00:00:00 UTC);

        let changes = watcher.reconcile(vec![auth("a", "k1"), auth("b", "k1")], now);
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], AuthChange::Add(_)));

        // Same set again: silence.
        assert!(
            watcher
                .reconcile(vec![auth("a", "k1"), auth("b", "k1")], now)
                .is_empty()
        );

        // Changed attribute: modify.
        let changes = watcher.reconcile(vec![auth("a", "k2"), auth("b", "k1")], now);
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], AuthChange::Modify(a) if a.id == "a"));

        // "b" disappears: nothing yet (grace window).
        let changes = watcher.reconcile(vec![auth("a", "k2")], now);
        assert!(changes.is_empty());

        // Still missing after the grace: delete fires.
        let later = now + Duration::from_secs(2);
        let changes = watcher.reconcile(vec![auth("a", "k2")], later);
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], AuthChange::Delete { id, .. } if id == "b"));
    }

    #[tokio::test]
    async fn scan_once_synthesizes_config_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "gemini-keys:\n  - api-key: \"AIza-disk\"\n").unwrap();
        let auth_dir = dir.path().join("auths");
        std::fs::create_dir_all(auth_dir.join("antigravity")).unwrap();
        std::fs::write(
            auth_dir.join("antigravity").join("acct.json"),
            br#"{"type": "antigravity", "access_token": "tok"}"#,
        )
        .unwrap();

        let queue = Arc::new(DispatchQueue::new());
        let watcher = Watcher::new(
            Some(config_path),
            Some(auth_dir),
            queue.clone(),
            None,
        );
        watcher.scan_once(OffsetDateTime::now_utc()).await;

        let mut providers = Vec::new();
        while let Some(change) = queue.try_pop() {
            match change {
                AuthChange::Add(auth) => providers.push(auth.provider),
                other => panic!("expected adds, got {other:?}"),
            }
        }
        providers.sort();
        assert_eq!(providers, vec!["antigravity".to_string(), "gemini".to_string()]);

        // A second unchanged scan is silent.
        watcher.scan_once(OffsetDateTime::now_utc()).await;
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_then_recreate_within_grace_is_a_modify() {
        let queue = Arc::new(DispatchQueue::new());
        let watcher = watcher(queue);
        let now = datetime!(2025-06-01 00:00:00 UTC);

        watcher.reconcile(vec![auth("a", "k1")], now);
        // File vanished (atomic replace in progress).
        assert!(watcher.reconcile(vec![], now).is_empty());
        // Recreated 200 ms later: one modify, no delete/add pair.
        let shortly = now + Duration::from_millis(200);
        let changes = watcher.reconcile(vec![auth("a", "k2")], shortly);
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], AuthChange::Modify(a) if a.id == "a"));

        // And the set is stable afterwards.
        assert!(watcher.reconcile(vec![auth("a", "k2")], shortly).is_empty());
    }
}
