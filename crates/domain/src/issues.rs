use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::events::{DomainEvent, EventBus};
use crate::geo::GeoPoint;
use crate::ports::issues::IssueRepository;
use crate::reports::{Address, Category, SnapReport};
use crate::util::now_ms;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Pending,
    InProgress,
    Fixed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Fixed => "fixed",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    NotSpecified,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub issue_id: String,
    pub location: GeoPoint,
    pub category: Category,
    pub severity: Severity,
    pub status: IssueStatus,
    pub image_url: String,
    pub address: Address,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Issue {
    /// New aggregate seeded from the first approved report at a spot.
    pub fn from_report(report: &SnapReport) -> Self {
        let now = now_ms();
        Self {
            issue_id: crate::util::uuid_v7_without_dashes(),
            location: report.location,
            category: report.category,
            severity: Severity::NotSpecified,
            status: IssueStatus::Pending,
            image_url: report.image_url.clone(),
            address: report.address.clone(),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

/// Status management lives outside the ingestion pipeline; this only makes
/// sure every change is announced so derived views get cleared.
#[derive(Clone)]
pub struct IssueService {
    repository: Arc<dyn IssueRepository>,
    events: EventBus,
}

impl IssueService {
    pub fn new(repository: Arc<dyn IssueRepository>, events: EventBus) -> Self {
        Self { repository, events }
    }

    pub async fn get(&self, issue_id: &str) -> DomainResult<Issue> {
        self.repository
            .get(issue_id)
            .await?
            .ok_or(DomainError::NotFound)
    }

    pub async fn change_status(&self, issue_id: &str, status: IssueStatus) -> DomainResult<Issue> {
        let current = self.get(issue_id).await?;
        if current.status == status {
            return Ok(current);
        }
        let updated = self.repository.update_status(issue_id, status).await?;
        self.events
            .publish(DomainEvent::IssueStatusChanged {
                issue_id: updated.issue_id.clone(),
                previous: current.status,
                current: updated.status,
            })
            .await;
        Ok(updated)
    }
}
