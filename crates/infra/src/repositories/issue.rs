use std::collections::HashMap;
use std::sync::Arc;

use pantau_domain::DomainResult;
use pantau_domain::error::DomainError;
use pantau_domain::geo::GeoPoint;
use pantau_domain::issues::{Issue, IssueStatus};
use pantau_domain::ports::BoxFuture;
use pantau_domain::ports::issues::IssueRepository;
use pantau_domain::reports::Category;
use pantau_domain::util::now_ms;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemoryIssueRepository {
    store: Arc<RwLock<HashMap<String, Issue>>>,
}

impl InMemoryIssueRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.store.read().await.len()
    }
}

impl IssueRepository for InMemoryIssueRepository {
    fn create(&self, issue: &Issue) -> BoxFuture<'_, DomainResult<Issue>> {
        let issue = issue.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut issues = store.write().await;
            if issues.contains_key(&issue.issue_id) {
                return Err(DomainError::Conflict);
            }
            issues.insert(issue.issue_id.clone(), issue.clone());
            Ok(issue)
        })
    }

    fn get(&self, issue_id: &str) -> BoxFuture<'_, DomainResult<Option<Issue>>> {
        let issue_id = issue_id.to_string();
        let store = self.store.clone();
        Box::pin(async move { Ok(store.read().await.get(&issue_id).cloned()) })
    }

    fn find_nearby(
        &self,
        category: &Category,
        center: &GeoPoint,
        radius_deg: f64,
    ) -> BoxFuture<'_, DomainResult<Vec<Issue>>> {
        let category = *category;
        let center = *center;
        let store = self.store.clone();
        Box::pin(async move {
            let mut nearby: Vec<(f64, Issue)> = store
                .read()
                .await
                .values()
                .filter(|issue| issue.category == category)
                .filter_map(|issue| {
                    let distance = issue.location.degree_distance(&center);
                    (distance <= radius_deg).then(|| (distance, issue.clone()))
                })
                .collect();
            nearby.sort_by(|left, right| {
                left.0
                    .total_cmp(&right.0)
                    .then_with(|| left.1.created_at_ms.cmp(&right.1.created_at_ms))
            });
            Ok(nearby.into_iter().map(|(_, issue)| issue).collect())
        })
    }

    fn update_status(
        &self,
        issue_id: &str,
        status: IssueStatus,
    ) -> BoxFuture<'_, DomainResult<Issue>> {
        let issue_id = issue_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let mut issues = store.write().await;
            let issue = issues.get_mut(&issue_id).ok_or(DomainError::NotFound)?;
            issue.status = status;
            issue.updated_at_ms = now_ms();
            Ok(issue.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantau_domain::geo::meters_to_degrees;
    use pantau_domain::issues::Severity;
    use pantau_domain::reports::Address;

    fn issue(issue_id: &str, category: Category, latitude: f64, longitude: f64) -> Issue {
        Issue {
            issue_id: issue_id.to_string(),
            location: GeoPoint::new(latitude, longitude).expect("point"),
            category,
            severity: Severity::NotSpecified,
            status: IssueStatus::Pending,
            image_url: "https://cdn.example.org/a.jpg".to_string(),
            address: Address::default(),
            created_at_ms: 1,
            updated_at_ms: 1,
        }
    }

    #[tokio::test]
    async fn nearby_filters_by_category_and_radius_sorted_by_distance() {
        let repo = InMemoryIssueRepository::new();
        repo.create(&issue("far", Category::Pothole, 0.0002, 0.0))
            .await
            .expect("create");
        repo.create(&issue("near", Category::Pothole, 0.0001, 0.0))
            .await
            .expect("create");
        repo.create(&issue("outside", Category::Pothole, 0.001, 0.0))
            .await
            .expect("create");
        repo.create(&issue("other", Category::Garbage, 0.0, 0.0))
            .await
            .expect("create");

        let center = GeoPoint::new(0.0, 0.0).expect("point");
        let found = repo
            .find_nearby(&Category::Pothole, &center, meters_to_degrees(30.0))
            .await
            .expect("nearby");
        let ids: Vec<&str> = found.iter().map(|issue| issue.issue_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
    }

    #[tokio::test]
    async fn update_status_touches_only_status() {
        let repo = InMemoryIssueRepository::new();
        repo.create(&issue("i1", Category::Garbage, 0.0, 0.0))
            .await
            .expect("create");
        let updated = repo
            .update_status("i1", IssueStatus::Fixed)
            .await
            .expect("update");
        assert_eq!(updated.status, IssueStatus::Fixed);
        assert_eq!(updated.severity, Severity::NotSpecified);
        assert_eq!(repo.count().await, 1);
    }
}
