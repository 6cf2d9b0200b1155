use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, broadcast};

use modelgate_common::RoutingStrategy;
use modelgate_protocol::StatusError;

use crate::record::{Auth, AuthId, ModelState};
use crate::store::AuthStore;

const QUOTA_BACKOFF_BASE: Duration = Duration::from_secs(1);
const QUOTA_BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);
const REFRESH_SCAN_INTERVAL: Duration = Duration::from_secs(5);
const REFRESH_FAILURE_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, thiserror::Error)]
pub enum SelectError {
    #[error("no credentials for provider {provider}")]
    NoCredentials { provider: String },
    /// Every eligible credential is cooling down; `retry_after` is the
    /// earliest recovery.
    #[error("all credentials cooling down, retry after {retry_after:?}")]
    Cooldown { retry_after: Duration },
}

impl SelectError {
    pub fn to_status_error(&self) -> StatusError {
        match self {
            SelectError::NoCredentials { provider } => StatusError::service_unavailable(format!(
                "no credentials available for provider {provider}"
            )),
            SelectError::Cooldown { retry_after } => {
                StatusError::new(429, "all credentials are cooling down")
                    .with_retry_after(Some(*retry_after))
            }
        }
    }
}

/// Change notifications fanned out to persistence hooks and the model
/// registry.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    Added(Auth),
    Updated(Auth),
    Removed { provider: String, id: AuthId },
}

/// Per-provider token refresh, implemented by the owning executor.
#[async_trait]
pub trait AuthRefresher: Send + Sync {
    async fn refresh(&self, auth: Auth) -> Result<Auth, StatusError>;

    /// How long before expiry to refresh pre-emptively.
    fn refresh_lead(&self) -> Duration {
        DEFAULT_REFRESH_LEAD
    }
}

/// Owns the credential population: selection, quota accounting, and the
/// background refresh loop.
pub struct Conductor {
    auths: RwLock<HashMap<AuthId, Auth>>,
    cursors: Mutex<HashMap<String, usize>>,
    strategy: RoutingStrategy,
    switch_project: bool,
    store: Option<Arc<dyn AuthStore>>,
    refreshers: RwLock<HashMap<String, Arc<dyn AuthRefresher>>>,
    in_flight_refreshes: Mutex<HashSet<AuthId>>,
    refresh_failures: Mutex<HashMap<AuthId, OffsetDateTime>>,
    events: broadcast::Sender<AuthEvent>,
}

impl Conductor {
    pub fn new(strategy: RoutingStrategy, store: Option<Arc<dyn AuthStore>>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            auths: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            strategy,
            switch_project: false,
            store,
            refreshers: RwLock::new(HashMap::new()),
            in_flight_refreshes: Mutex::new(HashSet::new()),
            refresh_failures: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn with_switch_project(mut self, switch_project: bool) -> Self {
        self.switch_project = switch_project;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub async fn register_refresher(&self, provider: &str, refresher: Arc<dyn AuthRefresher>) {
        self.refreshers
            .write()
            .await
            .insert(provider.to_string(), refresher);
    }

    // ---- population management ----

    pub async fn upsert(&self, auth: Auth) {
        let mut guard = self.auths.write().await;
        let event = match guard.get(&auth.id) {
            Some(existing) => {
                // Runtime quota state survives a config-driven modify.
                let mut merged = auth;
                merged.quota = existing.quota.clone();
                merged.model_states = existing.model_states.clone();
                let merged_clone = merged.clone();
                guard.insert(merged.id.clone(), merged);
                AuthEvent::Updated(merged_clone)
            }
            None => {
                guard.insert(auth.id.clone(), auth.clone());
                AuthEvent::Added(auth)
            }
        };
        drop(guard);
        let _ = self.events.send(event);
    }

    pub async fn remove(&self, id: &str) {
        let removed = self.auths.write().await.remove(id);
        if let Some(auth) = removed {
            let _ = self.events.send(AuthEvent::Removed {
                provider: auth.provider.clone(),
                id: auth.id.clone(),
            });
            if let Some(store) = &self.store
                && let Err(err) = store.delete(&auth.provider, &auth.id).await
            {
                tracing::warn!(id = %auth.id, %err, "delete credential file failed");
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Auth> {
        self.auths.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Auth> {
        let mut all: Vec<Auth> = self.auths.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    // ---- selection ----

    /// Picks at most one credential for `(provider, model, prefix)` at
    /// `now`, honoring priority, cooldown, and the routing strategy.
    pub async fn select(
        &self,
        provider: &str,
        model: &str,
        prefix: &str,
        now: OffsetDateTime,
    ) -> Result<Auth, SelectError> {
        let guard = self.auths.read().await;
        let mut matching = 0usize;
        let mut earliest_recovery: Option<OffsetDateTime> = None;
        let mut eligible: Vec<&Auth> = Vec::new();

        for auth in guard.values() {
            if auth.provider != provider || !auth.matches_prefix(prefix) {
                continue;
            }
            matching += 1;
            if auth.available_for(model, now) {
                eligible.push(auth);
                continue;
            }
            let recover = auth
                .quota
                .next_recover_at
                .into_iter()
                .chain(
                    auth.model_states
                        .get(model)
                        .and_then(|state| state.recover_at),
                )
                .min();
            if let Some(recover) = recover {
                earliest_recovery =
                    Some(earliest_recovery.map_or(recover, |cur| cur.min(recover)));
            }
        }

        if eligible.is_empty() {
            if matching == 0 {
                return Err(SelectError::NoCredentials {
                    provider: provider.to_string(),
                });
            }
            let retry_after = earliest_recovery
                .map(|at| {
                    let delta = at - now;
                    if delta.is_positive() {
                        Duration::from_secs_f64(delta.as_seconds_f64())
                    } else {
                        Duration::ZERO
                    }
                })
                .unwrap_or(Duration::from_secs(60));
            return Err(SelectError::Cooldown { retry_after });
        }

        // Highest priority group wins; ties break by stable ID order.
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        let best = eligible.iter().map(|a| a.priority()).max().unwrap_or(0);
        let group: Vec<&Auth> = eligible
            .into_iter()
            .filter(|a| a.priority() == best)
            .collect();

        let chosen = match self.strategy {
            RoutingStrategy::FillFirst => group[0].clone(),
            RoutingStrategy::RoundRobin => {
                let key = format!("{provider}:{model}");
                let mut cursors = self.cursors.lock().await;
                let cursor = cursors.entry(key).or_insert(0);
                let auth = group[*cursor % group.len()].clone();
                *cursor = cursor.wrapping_add(1);
                auth
            }
        };
        Ok(chosen)
    }

    // ---- quota accounting ----

    /// Exponential cooldown on quota exhaustion: base 1 s, doubled per
    /// consecutive hit, capped at 30 minutes.
    pub async fn mark_quota_exceeded(&self, id: &str, now: OffsetDateTime) {
        let mut guard = self.auths.write().await;
        let Some(auth) = guard.get_mut(id) else {
            return;
        };
        let backoff = quota_backoff(auth.quota.backoff_level);
        if self.switch_project {
            rotate_project(auth);
        }
        auth.quota.exceeded = true;
        auth.quota.next_recover_at = Some(now + backoff);
        auth.quota.backoff_level = auth.quota.backoff_level.saturating_add(1);
        auth.updated_at = now;
        let updated = auth.clone();
        drop(guard);
        tracing::debug!(id, ?backoff, "credential entering quota cooldown");
        let _ = self.events.send(AuthEvent::Updated(updated));
    }

    /// A successful request resets the backoff ladder.
    pub async fn mark_success(&self, id: &str, now: OffsetDateTime) {
        let mut guard = self.auths.write().await;
        let Some(auth) = guard.get_mut(id) else {
            return;
        };
        if !auth.quota.exceeded && auth.quota.backoff_level == 0 {
            return;
        }
        auth.quota = Default::default();
        auth.updated_at = now;
        let updated = auth.clone();
        drop(guard);
        let _ = self.events.send(AuthEvent::Updated(updated));
    }

    pub async fn mark_model_unavailable(
        &self,
        id: &str,
        model: &str,
        recover_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) {
        let mut guard = self.auths.write().await;
        let Some(auth) = guard.get_mut(id) else {
            return;
        };
        auth.model_states.insert(
            model.to_string(),
            ModelState {
                available: false,
                recover_at,
            },
        );
        auth.updated_at = now;
    }

    // ---- refresh loop ----

    /// Applies a refreshed credential: persists it and re-emits an update.
    pub async fn apply_refreshed(&self, auth: Auth) {
        if let Some(store) = &self.store
            && let Err(err) = store.save(&auth).await
        {
            tracing::warn!(id = %auth.id, %err, "persist refreshed credential failed");
        }
        let mut guard = self.auths.write().await;
        guard.insert(auth.id.clone(), auth.clone());
        drop(guard);
        let _ = self.events.send(AuthEvent::Updated(auth));
    }

    /// Scans every OAuth credential every five seconds and refreshes the
    /// ones inside their provider's refresh lead. Concurrent refreshes for
    /// the same ID are deduplicated; failures back off for a minute.
    pub fn spawn_refresh_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_SCAN_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.refresh_due().await;
            }
        });
    }

    async fn refresh_due(self: &Arc<Self>) {
        let now = OffsetDateTime::now_utc();
        let candidates: Vec<Auth> = {
            let guard = self.auths.read().await;
            guard.values().cloned().collect()
        };

        for auth in candidates {
            let refresher = {
                let guard = self.refreshers.read().await;
                guard.get(&auth.provider).cloned()
            };
            let Some(refresher) = refresher else {
                continue;
            };
            if !auth.needs_refresh(now, refresher.refresh_lead()) {
                continue;
            }
            {
                let failures = self.refresh_failures.lock().await;
                if let Some(failed_at) = failures.get(&auth.id)
                    && now < *failed_at + REFRESH_FAILURE_BACKOFF
                {
                    continue;
                }
            }
            {
                let mut in_flight = self.in_flight_refreshes.lock().await;
                if !in_flight.insert(auth.id.clone()) {
                    continue;
                }
            }

            let conductor = Arc::clone(self);
            tokio::spawn(async move {
                let id = auth.id.clone();
                match refresher.refresh(auth).await {
                    Ok(refreshed) => {
                        conductor.refresh_failures.lock().await.remove(&id);
                        conductor.apply_refreshed(refreshed).await;
                        tracing::debug!(%id, "credential refreshed");
                    }
                    Err(err) => {
                        tracing::info!(%id, %err, "credential refresh failed");
                        conductor
                            .refresh_failures
                            .lock()
                            .await
                            .insert(id.clone(), OffsetDateTime::now_utc());
                    }
                }
                conductor.in_flight_refreshes.lock().await.remove(&id);
            });
        }
    }
}

fn quota_backoff(level: u32) -> Duration {
    let factor = 1u64 << level.min(11);
    (QUOTA_BACKOFF_BASE * factor as u32).min(QUOTA_BACKOFF_CAP)
}

/// Rotates `project_id` through the `projects` metadata list, when the
/// credential carries alternates.
fn rotate_project(auth: &mut Auth) {
    let Some(projects) = auth
        .metadata
        .get("projects")
        .and_then(serde_json::Value::as_array)
        .cloned()
    else {
        return;
    };
    let names: Vec<String> = projects
        .iter()
        .filter_map(|p| p.as_str().map(str::to_string))
        .collect();
    if names.len() < 2 {
        return;
    }
    let current = auth.meta_str("project_id").unwrap_or_default().to_string();
    let idx = names.iter().position(|p| *p == current).unwrap_or(0);
    let next = names[(idx + 1) % names.len()].clone();
    auth.metadata
        .insert("project_id".to_string(), serde_json::Value::String(next));
}

#[cfg(test)]
mod tests {
    use super::quota_backoff;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(quota_backoff(0), Duration::from_secs(1));
        assert_eq!(quota_backoff(1), Duration::from_secs(2));
        assert_eq!(quota_backoff(5), Duration::from_secs(32));
        assert_eq!(quota_backoff(30), Duration::from_secs(30 * 60));
    }
}
