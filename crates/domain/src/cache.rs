use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::DomainResult;
use crate::events::{DomainEvent, DomainEventHandler};
use crate::ports::BoxFuture;
use crate::ports::cache::{CacheError, CacheStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrendInterval {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl TrendInterval {
    pub const ALL: [TrendInterval; 4] = [
        TrendInterval::Daily,
        TrendInterval::Weekly,
        TrendInterval::Monthly,
        TrendInterval::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

pub struct CacheKeys;

impl CacheKeys {
    pub const ISSUE_LIST_PATTERN: &'static str = "issue:list:*";
    pub const ISSUE_NEARBY_PATTERN: &'static str = "issue:nearby:*";
    pub const REPORT_LIST_PATTERN: &'static str = "report:list:*";

    pub const STATS_DASHBOARD_SUMMARY: &'static str = "stats:dashboard_summary";
    pub const STATS_METRICS_OVERVIEW: &'static str = "stats:metrics_overview";
    pub const STATS_MONTHLY_TARGET: &'static str = "stats:monthly_target";
    pub const STATS_CATEGORY_DISTRIBUTION: &'static str = "stats:category_distribution";
    pub const STATS_GEOGRAPHIC_DISTRIBUTION: &'static str = "stats:geographic_distribution";

    pub fn issue_detail(issue_id: &str) -> String {
        format!("issue:detail:{issue_id}")
    }

    pub fn report_detail(report_id: &str) -> String {
        format!("report:detail:{report_id}")
    }

    pub fn issue_reports(issue_id: &str) -> String {
        format!("issue:{issue_id}:reports:all")
    }

    pub fn issue_reports_pattern(issue_id: &str) -> String {
        format!("issue:{issue_id}:reports:*")
    }

    pub fn incident_trends(interval: TrendInterval) -> String {
        format!("stats:incident_trends:{}", interval.as_str())
    }

    pub fn statistics() -> Vec<String> {
        let mut keys = vec![
            Self::STATS_DASHBOARD_SUMMARY.to_string(),
            Self::STATS_METRICS_OVERVIEW.to_string(),
            Self::STATS_MONTHLY_TARGET.to_string(),
            Self::STATS_CATEGORY_DISTRIBUTION.to_string(),
            Self::STATS_GEOGRAPHIC_DISTRIBUTION.to_string(),
        ];
        keys.extend(TrendInterval::ALL.iter().map(|interval| Self::incident_trends(*interval)));
        keys
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvalidationSummary {
    pub keys_removed: usize,
    pub pattern_matches_removed: u64,
    pub failures: usize,
}

/// Clears every derived view touched by a report or issue change. Always a
/// full sweep: detail key, list/nearby patterns and all statistics.
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn CacheStore>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    pub async fn invalidate_issue(&self, issue_id: &str) -> InvalidationSummary {
        let mut summary = InvalidationSummary::default();
        self.remove_keys(&mut summary, [CacheKeys::issue_detail(issue_id)])
            .await;
        self.remove_patterns(
            &mut summary,
            [
                CacheKeys::ISSUE_LIST_PATTERN.to_string(),
                CacheKeys::ISSUE_NEARBY_PATTERN.to_string(),
                CacheKeys::REPORT_LIST_PATTERN.to_string(),
                CacheKeys::issue_reports_pattern(issue_id),
            ],
        )
        .await;
        self.remove_keys(&mut summary, CacheKeys::statistics()).await;
        tracing::debug!(
            issue_id,
            keys_removed = summary.keys_removed,
            failures = summary.failures,
            "issue caches invalidated"
        );
        summary
    }

    pub async fn invalidate_report(
        &self,
        report_id: &str,
        issue_id: Option<&str>,
    ) -> InvalidationSummary {
        let mut summary = InvalidationSummary::default();
        self.remove_keys(&mut summary, [CacheKeys::report_detail(report_id)])
            .await;
        self.remove_patterns(&mut summary, [CacheKeys::REPORT_LIST_PATTERN.to_string()])
            .await;

        if let Some(issue_id) = issue_id {
            self.remove_keys(&mut summary, [CacheKeys::issue_detail(issue_id)])
                .await;
            self.remove_patterns(
                &mut summary,
                [
                    CacheKeys::ISSUE_LIST_PATTERN.to_string(),
                    CacheKeys::ISSUE_NEARBY_PATTERN.to_string(),
                    CacheKeys::issue_reports_pattern(issue_id),
                ],
            )
            .await;
        }

        self.remove_keys(&mut summary, CacheKeys::statistics()).await;
        tracing::debug!(
            report_id,
            keys_removed = summary.keys_removed,
            failures = summary.failures,
            "report caches invalidated"
        );
        summary
    }

    async fn remove_keys(
        &self,
        summary: &mut InvalidationSummary,
        keys: impl IntoIterator<Item = String>,
    ) {
        for key in keys {
            match self.cache.remove(&key).await {
                Ok(()) => summary.keys_removed += 1,
                Err(err) => {
                    summary.failures += 1;
                    tracing::warn!(key, error = %err, "cache key invalidation failed");
                }
            }
        }
    }

    async fn remove_patterns(
        &self,
        summary: &mut InvalidationSummary,
        patterns: impl IntoIterator<Item = String>,
    ) {
        for pattern in patterns {
            match self.cache.remove_pattern(&pattern).await {
                Ok(removed) => summary.pattern_matches_removed += removed,
                Err(err) => {
                    summary.failures += 1;
                    tracing::warn!(pattern, error = %err, "cache pattern invalidation failed");
                }
            }
        }
    }
}

impl DomainEventHandler for CacheInvalidator {
    fn name(&self) -> &'static str {
        "cache_invalidator"
    }

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> BoxFuture<'a, DomainResult<()>> {
        Box::pin(async move {
            match event {
                DomainEvent::SnapReportSubmitted { report_id, .. }
                | DomainEvent::SnapReportValidationRequested { report_id, .. } => {
                    self.invalidate_report(report_id, None).await;
                }
                DomainEvent::SnapReportStatusChanged {
                    report_id,
                    issue_id,
                    ..
                } => {
                    self.invalidate_report(report_id, issue_id.as_deref()).await;
                }
                DomainEvent::IssueCreated { issue_id, .. }
                | DomainEvent::IssueStatusChanged { issue_id, .. } => {
                    self.invalidate_issue(issue_id).await;
                }
            }
            Ok(())
        })
    }
}

/// Serves `key` from cache, falling back to `load` and populating on a miss.
/// The fill is dropped if any invalidation ran while `load` was in flight, so
/// a value read before a commit is never cached after its invalidation.
/// Cache failures degrade to a plain load.
pub async fn read_through<T, F, Fut>(
    cache: &dyn CacheStore,
    key: &str,
    ttl: Duration,
    load: F,
) -> DomainResult<Option<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = DomainResult<Option<T>>>,
{
    match cache.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
            Ok(value) => return Ok(Some(value)),
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding undecodable cache entry");
                if let Err(err) = cache.remove(key).await {
                    tracing::warn!(key, error = %err, "cache removal failed");
                }
            }
        },
        Ok(None) => {}
        Err(err) => tracing::warn!(key, error = %err, "cache read failed"),
    }

    let generation = match cache.generation().await {
        Ok(generation) => Some(generation),
        Err(err) => {
            tracing::warn!(key, error = %err, "cache generation unavailable; skipping fill");
            None
        }
    };

    let value = load().await?;
    let Some(generation) = generation else {
        return Ok(value);
    };
    if let Some(inner) = value.as_ref() {
        match serde_json::to_string(inner) {
            Ok(raw) => match cache.set_if_generation(key, &raw, ttl, generation).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(key, "cache fill raced an invalidation; not stored"),
                Err(err) => tracing::warn!(key, error = %err, "cache write failed"),
            },
            Err(err) => tracing::warn!(key, error = %err, "cache encode failed"),
        }
    }
    Ok(value)
}

/// `*` matches any run of characters; everything else is literal.
pub fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !candidate.starts_with(first) || candidate.len() < first.len() + last.len() {
        return false;
    }
    if !candidate.ends_with(last) {
        return false;
    }

    let mut rest = &candidate[first.len()..candidate.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    true
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    generation: u64,
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryCacheStore {
    inner: Arc<Mutex<CacheState>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut state = self.state();
            let expired = state
                .entries
                .get(&key)
                .and_then(|entry| entry.expires_at)
                .is_some_and(|deadline| Instant::now() >= deadline);
            if expired {
                state.entries.remove(&key);
                return Ok(None);
            }
            Ok(state.entries.get(&key).map(|entry| entry.value.clone()))
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        let entry = CacheEntry::new(value, ttl);
        Box::pin(async move {
            self.state().entries.insert(key, entry);
            Ok(())
        })
    }

    fn generation(&self) -> BoxFuture<'_, Result<u64, CacheError>> {
        Box::pin(async move { Ok(self.state().generation) })
    }

    fn set_if_generation(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        generation: u64,
    ) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = key.to_string();
        let entry = CacheEntry::new(value, ttl);
        Box::pin(async move {
            let mut state = self.state();
            if state.generation != generation {
                return Ok(false);
            }
            state.entries.insert(key, entry);
            Ok(true)
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut state = self.state();
            state.generation += 1;
            state.entries.remove(&key);
            Ok(())
        })
    }

    fn remove_pattern(&self, pattern: &str) -> BoxFuture<'_, Result<u64, CacheError>> {
        let pattern = pattern.to_string();
        Box::pin(async move {
            let mut state = self.state();
            state.generation += 1;
            let before = state.entries.len();
            state.entries.retain(|key, _| !glob_matches(&pattern, key));
            Ok((before - state.entries.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(60);

    async fn seed(store: &InMemoryCacheStore, keys: &[&str]) {
        for key in keys {
            store.set(key, "cached", TTL).await.expect("seed");
        }
    }

    #[test]
    fn glob_matches_prefix_suffix_and_infix() {
        assert!(glob_matches("issue:list:*", "issue:list:page=1"));
        assert!(glob_matches("issue:*:reports:*", "issue:42:reports:page=2"));
        assert!(glob_matches("stats:dashboard_summary", "stats:dashboard_summary"));
        assert!(!glob_matches("issue:list:*", "report:list:page=1"));
        assert!(!glob_matches("issue:*:reports:*", "issue:42:photos:1"));
        assert!(glob_matches("*", "anything"));
    }

    #[test]
    fn statistics_cover_every_aggregate() {
        let keys = CacheKeys::statistics();
        assert_eq!(keys.len(), 5 + TrendInterval::ALL.len());
        assert!(keys.contains(&"stats:incident_trends:weekly".to_string()));
        assert!(keys.contains(&CacheKeys::STATS_GEOGRAPHIC_DISTRIBUTION.to_string()));
    }

    #[tokio::test]
    async fn invalidating_issue_clears_detail_related_patterns_and_statistics() {
        let store = InMemoryCacheStore::new();
        let mut keys = vec![
            "issue:detail:issue-1",
            "issue:list:page=1",
            "issue:nearby:-6.2:106.8",
            "issue:issue-1:reports:page=1",
            "report:list:mine",
        ];
        let stats = CacheKeys::statistics();
        keys.extend(stats.iter().map(String::as_str));
        seed(&store, &keys).await;
        seed(&store, &["issue:detail:issue-2", "report:detail:report-9"]).await;

        let summary = CacheInvalidator::new(Arc::new(store.clone()))
            .invalidate_issue("issue-1")
            .await;

        assert_eq!(summary.failures, 0);
        assert_eq!(store.len(), 2);
        assert!(store.get("issue:detail:issue-2").await.expect("get").is_some());
        assert!(store.get("issue:detail:issue-1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn invalidating_report_with_issue_clears_both_details() {
        let store = InMemoryCacheStore::new();
        seed(
            &store,
            &[
                "report:detail:report-1",
                "issue:detail:issue-1",
                "report:list:page=1",
                "stats:monthly_target",
            ],
        )
        .await;

        CacheInvalidator::new(Arc::new(store.clone()))
            .invalidate_report("report-1", Some("issue-1"))
            .await;

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn detail_read_after_invalidation_is_fresh() {
        let store = InMemoryCacheStore::new();
        let key = CacheKeys::issue_detail("issue-1");

        let first: Option<String> = read_through(&store, &key, TTL, || async {
            Ok(Some("before".to_string()))
        })
        .await
        .expect("first read");
        assert_eq!(first.as_deref(), Some("before"));

        let cached: Option<String> = read_through(&store, &key, TTL, || async {
            Ok(Some("ignored".to_string()))
        })
        .await
        .expect("cached read");
        assert_eq!(cached.as_deref(), Some("before"));

        CacheInvalidator::new(Arc::new(store.clone()))
            .invalidate_issue("issue-1")
            .await;

        let fresh: Option<String> = read_through(&store, &key, TTL, || async {
            Ok(Some("after".to_string()))
        })
        .await
        .expect("fresh read");
        assert_eq!(fresh.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn fill_loaded_before_invalidation_is_not_cached() {
        let store = Arc::new(InMemoryCacheStore::new());
        let key = CacheKeys::issue_detail("issue-1");
        let (loaded_tx, loaded_rx) = tokio::sync::oneshot::channel::<()>();
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();

        let reader = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                read_through::<String, _, _>(store.as_ref(), &key, TTL, || async move {
                    let snapshot = "pending".to_string();
                    let _ = loaded_tx.send(());
                    let _ = resume_rx.await;
                    Ok(Some(snapshot))
                })
                .await
            })
        };

        loaded_rx.await.expect("loader started");
        CacheInvalidator::new(store.clone())
            .invalidate_issue("issue-1")
            .await;
        resume_tx.send(()).expect("resume loader");
        let raced = reader.await.expect("reader joined").expect("read");
        assert_eq!(raced.as_deref(), Some("pending"));
        assert!(store.get(&key).await.expect("get").is_none());

        let next: Option<String> = read_through(store.as_ref(), &key, TTL, || async {
            Ok(Some("fixed".to_string()))
        })
        .await
        .expect("read after invalidation");
        assert_eq!(next.as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn set_if_generation_refuses_after_remove() {
        let store = InMemoryCacheStore::new();
        let generation = store.generation().await.expect("generation");
        store.remove("issue:detail:other").await.expect("remove");

        let stored = store
            .set_if_generation("issue:detail:issue-1", "old", TTL, generation)
            .await
            .expect("set");
        assert!(!stored);
        assert!(store.is_empty());

        let current = store.generation().await.expect("generation");
        assert!(store
            .set_if_generation("issue:detail:issue-1", "new", TTL, current)
            .await
            .expect("set"));
    }

    #[tokio::test]
    async fn read_through_does_not_cache_missing_values() {
        let store = InMemoryCacheStore::new();
        let loads = AtomicUsize::new(0);
        for _ in 0..2 {
            let value: Option<String> = read_through(&store, "report:detail:none", TTL, || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .expect("read");
            assert!(value.is_none());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_through_propagates_load_errors() {
        let store = InMemoryCacheStore::new();
        let result: DomainResult<Option<String>> =
            read_through(&store, "report:detail:x", TTL, || async {
                Err(DomainError::Unavailable("db down".into()))
            })
            .await;
        assert!(matches!(result, Err(DomainError::Unavailable(_))));
    }

    #[tokio::test]
    async fn handler_routes_events_to_matching_invalidation() {
        let store = InMemoryCacheStore::new();
        seed(&store, &["report:detail:report-1", "issue:detail:issue-1"]).await;
        let invalidator = CacheInvalidator::new(Arc::new(store.clone()));

        invalidator
            .handle(&DomainEvent::SnapReportStatusChanged {
                report_id: "report-1".to_string(),
                previous: crate::reports::ReportStatus::Pending,
                current: crate::reports::ReportStatus::Declined,
                issue_id: None,
            })
            .await
            .expect("handled");
        assert!(store.get("report:detail:report-1").await.expect("get").is_none());
        assert!(store.get("issue:detail:issue-1").await.expect("get").is_some());
    }
}
