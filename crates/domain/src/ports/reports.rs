use crate::DomainResult;
use crate::ports::BoxFuture;
use crate::reports::{ReportVerdict, SnapReport};

#[allow(clippy::needless_pass_by_value)]
pub trait SnapReportRepository: Send + Sync {
    fn create(&self, report: &SnapReport) -> BoxFuture<'_, DomainResult<SnapReport>>;

    fn get(&self, report_id: &str) -> BoxFuture<'_, DomainResult<Option<SnapReport>>>;

    fn get_by_validation_task(
        &self,
        task_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<SnapReport>>>;

    fn set_validation_task(
        &self,
        report_id: &str,
        task_id: &str,
    ) -> BoxFuture<'_, DomainResult<SnapReport>>;

    /// Fails with `DomainError::Conflict` unless the report is still pending.
    fn apply_verdict(
        &self,
        report_id: &str,
        verdict: &ReportVerdict,
    ) -> BoxFuture<'_, DomainResult<SnapReport>>;

    fn list_by_issue(&self, issue_id: &str) -> BoxFuture<'_, DomainResult<Vec<SnapReport>>>;
}
