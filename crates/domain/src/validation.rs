use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::dedup::DeduplicationEngine;
use crate::error::DomainError;
use crate::events::{DomainEvent, EventBus};
use crate::idempotency::{BeginOutcome, IdempotencyService};
use crate::ports::idempotency::{IdempotencyError, IdempotencyKey};
use crate::ports::reports::SnapReportRepository;
use crate::ports::validation::{ValidationClient, ValidationRequest};
use crate::reports::{Category, ReportStatus, ReportVerdict, SnapReport};

pub const DEFAULT_APPROVAL_THRESHOLD: f64 = 0.3;
pub const CALLBACK_IDEMPOTENCY_SCOPE: &str = "validation_callback";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Declined,
    Pending,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::Pending => "pending",
        }
    }
}

/// Classifier status to verdict. Status comparison is exact; a completed
/// task without a score cannot clear the threshold.
pub fn map_verdict(status: &str, threshold: Option<f64>, approval_threshold: f64) -> Verdict {
    match status {
        "completed" => match threshold {
            Some(score) if score >= approval_threshold => Verdict::Approved,
            _ => Verdict::Declined,
        },
        "failed" => Verdict::Declined,
        _ => Verdict::Pending,
    }
}

pub fn map_category(label: Option<&str>) -> Category {
    label.map(Category::from_label).unwrap_or(Category::NotSpecified)
}

/// Inbound classifier callback.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationCallback {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Clone)]
pub struct ValidationRequester {
    reports: Arc<dyn SnapReportRepository>,
    client: Arc<dyn ValidationClient>,
    events: EventBus,
    webhook_url: String,
}

/// Builds a requester on the task that runs the request.
pub type RequesterFactory = Arc<dyn Fn() -> ValidationRequester + Send + Sync>;

impl ValidationRequester {
    pub fn new(
        reports: Arc<dyn SnapReportRepository>,
        client: Arc<dyn ValidationClient>,
        events: EventBus,
        webhook_url: impl Into<String>,
    ) -> Self {
        Self {
            reports,
            client,
            events,
            webhook_url: webhook_url.into(),
        }
    }

    pub fn factory(self) -> RequesterFactory {
        Arc::new(move || self.clone())
    }

    /// Submits the report image and stores the returned task id. A report that
    /// already carries a task id is not submitted again.
    pub async fn request(&self, report_id: &str) -> DomainResult<String> {
        let report = self
            .reports
            .get(report_id)
            .await?
            .ok_or(DomainError::NotFound)?;

        if let Some(task_id) = report.validation_task_id {
            tracing::debug!(report_id, task_id = %task_id, "validation already requested");
            return Ok(task_id);
        }

        let request = ValidationRequest {
            image_url: report.image_url.clone(),
            webhook_url: self.webhook_url.clone(),
        };
        let task_id = self.client.submit(&request).await.map_err(|err| {
            tracing::error!(report_id, error = %err, "validation request failed");
            DomainError::Upstream(err.to_string())
        })?;
        let task_id = task_id.trim().to_string();
        if task_id.is_empty() {
            tracing::error!(report_id, "validation service returned an empty task id");
            return Err(DomainError::Upstream("empty validation task id".into()));
        }

        self.reports.set_validation_task(report_id, &task_id).await?;
        tracing::info!(report_id, task_id = %task_id, "validation requested");
        self.events
            .publish(DomainEvent::SnapReportValidationRequested {
                report_id: report_id.to_string(),
                task_id: task_id.clone(),
            })
            .await;
        Ok(task_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Non-terminal status; nothing to apply yet.
    Ignored,
    Duplicate,
    UnknownTask,
    AlreadyApplied,
    Declined {
        report_id: String,
    },
    Approved {
        report_id: String,
        issue_id: String,
        issue_created: bool,
    },
}

impl CallbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Duplicate => "duplicate",
            Self::UnknownTask => "unknown_task",
            Self::AlreadyApplied => "already_applied",
            Self::Declined { .. } => "declined",
            Self::Approved { .. } => "approved",
        }
    }
}

#[derive(Clone)]
pub struct ValidationCorrelator {
    reports: Arc<dyn SnapReportRepository>,
    dedup: Arc<DeduplicationEngine>,
    events: EventBus,
    idempotency: IdempotencyService,
    approval_threshold: f64,
}

impl ValidationCorrelator {
    pub fn new(
        reports: Arc<dyn SnapReportRepository>,
        dedup: Arc<DeduplicationEngine>,
        events: EventBus,
        idempotency: IdempotencyService,
        approval_threshold: f64,
    ) -> Self {
        Self {
            reports,
            dedup,
            events,
            idempotency,
            approval_threshold,
        }
    }

    pub fn approval_threshold(&self) -> f64 {
        self.approval_threshold
    }

    /// Applies a classifier callback at most once per task id. Unknown task
    /// ids, replays and non-terminal statuses are acknowledged as no-ops.
    pub async fn handle(&self, callback: &ValidationCallback) -> DomainResult<CallbackOutcome> {
        let task_id = callback.task_id.trim();
        if task_id.is_empty() {
            return Err(DomainError::Validation("task_id is required".into()));
        }

        let verdict = map_verdict(&callback.status, callback.threshold, self.approval_threshold);
        if verdict == Verdict::Pending {
            tracing::debug!(task_id, status = %callback.status, "non-terminal validation status");
            return Ok(CallbackOutcome::Ignored);
        }

        let key = IdempotencyKey::new(CALLBACK_IDEMPOTENCY_SCOPE, task_id);
        match self.idempotency.begin(&key).await.map_err(store_error)? {
            BeginOutcome::Started => {}
            BeginOutcome::InProgress | BeginOutcome::Replay(_) => {
                tracing::info!(task_id, "duplicate validation callback");
                return Ok(CallbackOutcome::Duplicate);
            }
        }

        let outcome = match self.apply(task_id, verdict, callback.category.as_deref()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(release_err) = self.idempotency.release(&key).await {
                    tracing::warn!(task_id, error = %release_err, "failed to release callback claim");
                }
                return Err(err);
            }
        };

        // The report may not carry its task id yet; let a redelivery retry.
        if outcome == CallbackOutcome::UnknownTask {
            if let Err(err) = self.idempotency.release(&key).await {
                tracing::warn!(task_id, error = %err, "failed to release callback claim");
            }
            return Ok(outcome);
        }

        let recorded = serde_json::json!({ "outcome": outcome.as_str() });
        if let Err(err) = self.idempotency.complete(&key, recorded).await {
            tracing::warn!(task_id, error = %err, "failed to record callback outcome");
        }
        Ok(outcome)
    }

    async fn apply(
        &self,
        task_id: &str,
        verdict: Verdict,
        label: Option<&str>,
    ) -> DomainResult<CallbackOutcome> {
        let Some(report) = self.reports.get_by_validation_task(task_id).await? else {
            tracing::warn!(task_id, "validation callback for unknown task");
            return Ok(CallbackOutcome::UnknownTask);
        };
        if report.status.is_terminal() {
            tracing::info!(
                task_id,
                report_id = %report.report_id,
                status = report.status.as_str(),
                "report already has a verdict"
            );
            return Ok(CallbackOutcome::AlreadyApplied);
        }

        let mapped = map_category(label);
        let category = if mapped.is_specified() {
            mapped
        } else {
            report.category
        };

        match verdict {
            Verdict::Approved => self.approve(report, category).await,
            Verdict::Declined => self.decline(report, category).await,
            Verdict::Pending => Ok(CallbackOutcome::Ignored),
        }
    }

    async fn decline(&self, report: SnapReport, category: Category) -> DomainResult<CallbackOutcome> {
        let verdict = ReportVerdict::declined(category);
        let updated = match self.reports.apply_verdict(&report.report_id, &verdict).await {
            Ok(updated) => updated,
            Err(DomainError::Conflict) => return Ok(CallbackOutcome::AlreadyApplied),
            Err(err) => return Err(err),
        };
        tracing::info!(report_id = %updated.report_id, "report declined");

        self.events
            .publish(DomainEvent::SnapReportStatusChanged {
                report_id: updated.report_id.clone(),
                previous: report.status,
                current: updated.status,
                issue_id: None,
            })
            .await;

        Ok(CallbackOutcome::Declined {
            report_id: updated.report_id,
        })
    }

    async fn approve(&self, report: SnapReport, category: Category) -> DomainResult<CallbackOutcome> {
        let previous = report.status;
        let mut candidate = report;
        candidate.status = ReportStatus::Approved;
        candidate.category = category;

        let resolved = self.dedup.resolve(&candidate).await?;
        let issue_created = resolved.created();
        let issue = resolved.into_issue();

        let verdict = ReportVerdict::approved(category, issue.issue_id.clone());
        let updated = match self
            .reports
            .apply_verdict(&candidate.report_id, &verdict)
            .await
        {
            Ok(updated) => updated,
            Err(DomainError::Conflict) => {
                tracing::warn!(
                    report_id = %candidate.report_id,
                    issue_id = %issue.issue_id,
                    issue_created,
                    "report received a verdict while deduplicating"
                );
                if issue_created {
                    // The issue row is committed; listings must still see it.
                    tracing::warn!(
                        issue_id = %issue.issue_id,
                        "issue created without a linked report"
                    );
                    self.events
                        .publish(DomainEvent::IssueCreated {
                            issue_id: issue.issue_id.clone(),
                            category: issue.category,
                            report_id: candidate.report_id.clone(),
                        })
                        .await;
                }
                return Ok(CallbackOutcome::AlreadyApplied);
            }
            Err(err) => return Err(err),
        };
        tracing::info!(
            report_id = %updated.report_id,
            issue_id = %issue.issue_id,
            issue_created,
            "report approved"
        );

        if issue_created {
            self.events
                .publish(DomainEvent::IssueCreated {
                    issue_id: issue.issue_id.clone(),
                    category: issue.category,
                    report_id: updated.report_id.clone(),
                })
                .await;
        }
        self.events
            .publish(DomainEvent::SnapReportStatusChanged {
                report_id: updated.report_id.clone(),
                previous,
                current: updated.status,
                issue_id: Some(issue.issue_id.clone()),
            })
            .await;

        Ok(CallbackOutcome::Approved {
            report_id: updated.report_id,
            issue_id: issue.issue_id,
            issue_created,
        })
    }
}

fn store_error(err: IdempotencyError) -> DomainError {
    DomainError::Unavailable(err.to_string())
}
