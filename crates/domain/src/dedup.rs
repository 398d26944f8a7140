use std::sync::Arc;

use crate::DomainResult;
use crate::error::DomainError;
use crate::geo::{KeyedLocks, SpatialCell, meters_to_degrees};
use crate::issues::Issue;
use crate::ports::issues::IssueRepository;
use crate::reports::{ReportStatus, SnapReport};

pub const DEFAULT_DEDUP_RADIUS_M: f64 = 30.0;

#[derive(Clone, Debug)]
pub struct DedupConfig {
    pub radius_m: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            radius_m: DEFAULT_DEDUP_RADIUS_M,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DedupOutcome {
    Linked(Issue),
    Created(Issue),
}

impl DedupOutcome {
    pub fn issue(&self) -> &Issue {
        match self {
            Self::Linked(issue) | Self::Created(issue) => issue,
        }
    }

    pub fn into_issue(self) -> Issue {
        match self {
            Self::Linked(issue) | Self::Created(issue) => issue,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linked(_) => "linked",
            Self::Created(_) => "created",
        }
    }
}

/// Folds approved reports into issues: same category within the radius links
/// to the closest existing issue, otherwise a new issue is opened.
///
/// Lookup and creation run under locks on the 3x3 grid neighbourhood of the
/// report, so concurrent approvals for one spot never open two issues.
#[derive(Clone)]
pub struct DeduplicationEngine {
    issues: Arc<dyn IssueRepository>,
    config: DedupConfig,
    locks: KeyedLocks,
}

impl DeduplicationEngine {
    pub fn new(issues: Arc<dyn IssueRepository>, config: DedupConfig) -> Self {
        Self {
            issues,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn radius_deg(&self) -> f64 {
        meters_to_degrees(self.config.radius_m)
    }

    pub async fn resolve(&self, report: &SnapReport) -> DomainResult<DedupOutcome> {
        if report.status != ReportStatus::Approved {
            return Err(DomainError::Validation(
                "only approved reports can be deduplicated".into(),
            ));
        }

        let radius_deg = self.radius_deg();
        let scope = report.category.as_str();
        let keys = SpatialCell::containing(&report.location, radius_deg)
            .neighbourhood()
            .into_iter()
            .map(|cell| cell.lock_key(scope));
        let _guard = self.locks.acquire_all(keys).await;

        if let Some(existing) = self.nearest(report, radius_deg).await? {
            tracing::info!(
                report_id = %report.report_id,
                issue_id = %existing.issue_id,
                "report linked to existing issue"
            );
            return Ok(DedupOutcome::Linked(existing));
        }

        let issue = self.issues.create(&Issue::from_report(report)).await?;
        tracing::info!(
            report_id = %report.report_id,
            issue_id = %issue.issue_id,
            category = report.category.as_str(),
            "new issue created from report"
        );
        Ok(DedupOutcome::Created(issue))
    }

    async fn nearest(&self, report: &SnapReport, radius_deg: f64) -> DomainResult<Option<Issue>> {
        let candidates = self
            .issues
            .find_nearby(&report.category, &report.location, radius_deg)
            .await?;

        let mut best: Option<(f64, Issue)> = None;
        for candidate in candidates {
            if candidate.category != report.category {
                continue;
            }
            if !candidate
                .location
                .within_meters(&report.location, self.config.radius_m)
            {
                continue;
            }
            let distance = candidate.location.degree_distance(&report.location);
            let closer = best
                .as_ref()
                .is_none_or(|(current, _)| distance.total_cmp(current).is_lt());
            if closer {
                best = Some((distance, candidate));
            }
        }
        Ok(best.map(|(_, issue)| issue))
    }
}
