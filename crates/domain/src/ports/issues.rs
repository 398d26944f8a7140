use crate::DomainResult;
use crate::geo::GeoPoint;
use crate::issues::{Issue, IssueStatus};
use crate::ports::BoxFuture;
use crate::reports::Category;

#[allow(clippy::needless_pass_by_value)]
pub trait IssueRepository: Send + Sync {
    fn create(&self, issue: &Issue) -> BoxFuture<'_, DomainResult<Issue>>;

    fn get(&self, issue_id: &str) -> BoxFuture<'_, DomainResult<Option<Issue>>>;

    /// Issues of `category` whose degree distance to `center` is at most `radius_deg`.
    fn find_nearby(
        &self,
        category: &Category,
        center: &GeoPoint,
        radius_deg: f64,
    ) -> BoxFuture<'_, DomainResult<Vec<Issue>>>;

    fn update_status(
        &self,
        issue_id: &str,
        status: IssueStatus,
    ) -> BoxFuture<'_, DomainResult<Issue>>;
}
