use std::collections::HashMap;
use std::time::Duration;

use time::OffsetDateTime;
use time::macros::datetime;

use modelgate_auth::{Auth, AuthStatus, Conductor, SelectError};
use modelgate_common::RoutingStrategy;

fn now() -> OffsetDateTime {
    datetime!(2025-06-01 12:00:00 UTC)
}

fn auth(id: &str, provider: &str) -> Auth {
    let mut auth = Auth::new(id, provider, now());
    auth.attributes
        .insert("api_key".to_string(), format!("key-{id}"));
    auth
}

#[tokio::test]
async fn round_robin_visits_every_credential() {
    let conductor = Conductor::new(RoutingStrategy::RoundRobin, None);
    for id in ["a", "b", "c"] {
        conductor.upsert(auth(id, "gemini")).await;
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    for _ in 0..9 {
        let selected = conductor
            .select("gemini", "gemini-2.5-pro", "", now())
            .await
            .unwrap();
        *seen.entry(selected.id).or_default() += 1;
    }
    assert_eq!(seen.len(), 3);
    for count in seen.values() {
        assert_eq!(*count, 3);
    }
}

#[tokio::test]
async fn fill_first_always_picks_first_by_id() {
    let conductor = Conductor::new(RoutingStrategy::FillFirst, None);
    for id in ["b", "a", "c"] {
        conductor.upsert(auth(id, "gemini")).await;
    }
    for _ in 0..3 {
        let selected = conductor
            .select("gemini", "gemini-2.5-pro", "", now())
            .await
            .unwrap();
        assert_eq!(selected.id, "a");
    }
}

#[tokio::test]
async fn priority_partitions_before_strategy() {
    let conductor = Conductor::new(RoutingStrategy::RoundRobin, None);
    let mut low = auth("low", "gemini");
    low.attributes
        .insert("priority".to_string(), "1".to_string());
    let mut high = auth("high", "gemini");
    high.attributes
        .insert("priority".to_string(), "5".to_string());
    conductor.upsert(low).await;
    conductor.upsert(high).await;

    for _ in 0..4 {
        let selected = conductor
            .select("gemini", "gemini-2.5-pro", "", now())
            .await
            .unwrap();
        assert_eq!(selected.id, "high");
    }
}

#[tokio::test]
async fn prefix_must_match_exactly() {
    let conductor = Conductor::new(RoutingStrategy::RoundRobin, None);
    let mut team = auth("team", "gemini");
    team.prefix = "team-a".to_string();
    conductor.upsert(team).await;
    conductor.upsert(auth("shared", "gemini")).await;

    let selected = conductor
        .select("gemini", "gemini-2.5-pro", "team-a", now())
        .await
        .unwrap();
    assert_eq!(selected.id, "team");

    let selected = conductor
        .select("gemini", "gemini-2.5-pro", "", now())
        .await
        .unwrap();
    assert_eq!(selected.id, "shared");
}

#[tokio::test]
async fn cooldown_error_carries_earliest_recovery() {
    let conductor = Conductor::new(RoutingStrategy::RoundRobin, None);
    conductor.upsert(auth("a", "gemini")).await;
    conductor.upsert(auth("b", "gemini")).await;

    conductor.mark_quota_exceeded("a", now()).await;
    conductor.mark_quota_exceeded("b", now()).await;
    // Second hit on "b" doubles its backoff, so "a" recovers first.
    conductor.mark_quota_exceeded("b", now()).await;

    let err = conductor
        .select("gemini", "gemini-2.5-pro", "", now())
        .await
        .unwrap_err();
    match err {
        SelectError::Cooldown { retry_after } => {
            assert_eq!(retry_after, Duration::from_secs(1));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // After the earliest recovery point, "a" is selectable again.
    let later = now() + Duration::from_secs(2);
    let selected = conductor
        .select("gemini", "gemini-2.5-pro", "", later)
        .await
        .unwrap();
    assert_eq!(selected.id, "a");
}

#[tokio::test]
async fn success_resets_backoff() {
    let conductor = Conductor::new(RoutingStrategy::RoundRobin, None);
    conductor.upsert(auth("a", "gemini")).await;
    conductor.mark_quota_exceeded("a", now()).await;
    conductor.mark_quota_exceeded("a", now()).await;

    conductor.mark_success("a", now()).await;
    let refreshed = conductor.get("a").await.unwrap();
    assert_eq!(refreshed.quota.backoff_level, 0);
    assert!(refreshed.quota.next_recover_at.is_none());

    // The ladder restarts from the base after a success.
    conductor.mark_quota_exceeded("a", now()).await;
    let hit = conductor.get("a").await.unwrap();
    assert_eq!(
        hit.quota.next_recover_at,
        Some(now() + Duration::from_secs(1))
    );
}

#[tokio::test]
async fn disabled_credentials_are_never_selected() {
    let conductor = Conductor::new(RoutingStrategy::RoundRobin, None);
    let mut disabled = auth("off", "gemini");
    disabled.status = AuthStatus::Disabled;
    conductor.upsert(disabled).await;

    let err = conductor
        .select("gemini", "gemini-2.5-pro", "", now())
        .await
        .unwrap_err();
    assert!(matches!(err, SelectError::NoCredentials { .. }));
}

#[tokio::test]
async fn model_state_blocks_only_that_model() {
    let conductor = Conductor::new(RoutingStrategy::RoundRobin, None);
    conductor.upsert(auth("a", "gemini")).await;
    conductor
        .mark_model_unavailable("a", "gemini-2.5-pro", None, now())
        .await;

    assert!(
        conductor
            .select("gemini", "gemini-2.5-pro", "", now())
            .await
            .is_err()
    );
    assert!(
        conductor
            .select("gemini", "gemini-2.5-flash", "", now())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn upsert_preserves_runtime_quota_state() {
    let conductor = Conductor::new(RoutingStrategy::RoundRobin, None);
    conductor.upsert(auth("a", "gemini")).await;
    conductor.mark_quota_exceeded("a", now()).await;

    // A watcher-driven modify replaces attributes but not quota state.
    let mut updated = auth("a", "gemini");
    updated
        .attributes
        .insert("api_key".to_string(), "rotated".to_string());
    conductor.upsert(updated).await;

    let current = conductor.get("a").await.unwrap();
    assert_eq!(current.attribute("api_key"), Some("rotated"));
    assert!(current.quota.next_recover_at.is_some());
}
