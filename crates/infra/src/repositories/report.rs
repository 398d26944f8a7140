use std::collections::HashMap;
use std::sync::Arc;

use pantau_domain::DomainResult;
use pantau_domain::error::DomainError;
use pantau_domain::ports::BoxFuture;
use pantau_domain::ports::reports::SnapReportRepository;
use pantau_domain::reports::{ReportVerdict, SnapReport};
use pantau_domain::util::now_ms;
use tokio::sync::RwLock;

#[derive(Default)]
struct ReportTables {
    reports: HashMap<String, SnapReport>,
    by_task: HashMap<String, String>,
}

/// Reports and the task-id index share one lock so a task id is never
/// visible before its report carries it.
#[derive(Clone, Default)]
pub struct InMemorySnapReportRepository {
    store: Arc<RwLock<ReportTables>>,
}

impl InMemorySnapReportRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapReportRepository for InMemorySnapReportRepository {
    fn create(&self, report: &SnapReport) -> BoxFuture<'_, DomainResult<SnapReport>> {
        let report = report.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut tables = store.write().await;
            if tables.reports.contains_key(&report.report_id) {
                return Err(DomainError::Conflict);
            }
            if let Some(task_id) = report.validation_task_id.as_ref() {
                if tables.by_task.contains_key(task_id) {
                    return Err(DomainError::Conflict);
                }
                tables
                    .by_task
                    .insert(task_id.clone(), report.report_id.clone());
            }
            tables
                .reports
                .insert(report.report_id.clone(), report.clone());
            Ok(report)
        })
    }

    fn get(&self, report_id: &str) -> BoxFuture<'_, DomainResult<Option<SnapReport>>> {
        let report_id = report_id.to_string();
        let store = self.store.clone();
        Box::pin(async move { Ok(store.read().await.reports.get(&report_id).cloned()) })
    }

    fn get_by_validation_task(
        &self,
        task_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<SnapReport>>> {
        let task_id = task_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let tables = store.read().await;
            let Some(report_id) = tables.by_task.get(&task_id) else {
                return Ok(None);
            };
            Ok(tables.reports.get(report_id).cloned())
        })
    }

    fn set_validation_task(
        &self,
        report_id: &str,
        task_id: &str,
    ) -> BoxFuture<'_, DomainResult<SnapReport>> {
        let report_id = report_id.to_string();
        let task_id = task_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let mut tables = store.write().await;
            if tables
                .by_task
                .get(&task_id)
                .is_some_and(|owner| owner != &report_id)
            {
                return Err(DomainError::Conflict);
            }
            let report = tables
                .reports
                .get_mut(&report_id)
                .ok_or(DomainError::NotFound)?;
            if report.validation_task_id.is_some() {
                return Err(DomainError::Conflict);
            }
            report.validation_task_id = Some(task_id.clone());
            report.updated_at_ms = now_ms();
            let updated = report.clone();
            tables.by_task.insert(task_id, report_id);
            Ok(updated)
        })
    }

    fn apply_verdict(
        &self,
        report_id: &str,
        verdict: &ReportVerdict,
    ) -> BoxFuture<'_, DomainResult<SnapReport>> {
        let report_id = report_id.to_string();
        let verdict = verdict.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut tables = store.write().await;
            let report = tables
                .reports
                .get_mut(&report_id)
                .ok_or(DomainError::NotFound)?;
            verdict.apply_to(report)?;
            Ok(report.clone())
        })
    }

    fn list_by_issue(&self, issue_id: &str) -> BoxFuture<'_, DomainResult<Vec<SnapReport>>> {
        let issue_id = issue_id.to_string();
        let store = self.store.clone();
        Box::pin(async move {
            let mut reports: Vec<SnapReport> = store
                .read()
                .await
                .reports
                .values()
                .filter(|report| report.issue_id.as_deref() == Some(issue_id.as_str()))
                .cloned()
                .collect();
            reports.sort_by(|left, right| {
                left.created_at_ms
                    .cmp(&right.created_at_ms)
                    .then_with(|| left.report_id.cmp(&right.report_id))
            });
            Ok(reports)
        })
    }
}
