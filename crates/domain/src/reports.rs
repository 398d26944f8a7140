use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::events::{DomainEvent, EventBus};
use crate::geo::GeoPoint;
use crate::identity::ActorIdentity;
use crate::otp::{OtpPurpose, OtpService};
use crate::ports::dispatch::{WorkDispatcher, WorkItem};
use crate::ports::reports::SnapReportRepository;
use crate::util::now_ms;
use crate::validation::RequesterFactory;

const MAX_IMAGE_URL_LENGTH: usize = 2_048;
const MAX_ADDRESS_FIELD_LENGTH: usize = 256;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Garbage,
    Pothole,
    DefectiveManhole,
    NonDefectiveManhole,
    NotSpecified,
}

impl Category {
    pub const RECOGNIZED: [Category; 4] = [
        Category::Garbage,
        Category::Pothole,
        Category::DefectiveManhole,
        Category::NonDefectiveManhole,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Garbage => "garbage",
            Self::Pothole => "pothole",
            Self::DefectiveManhole => "defective_manhole",
            Self::NonDefectiveManhole => "non_defective_manhole",
            Self::NotSpecified => "not_specified",
        }
    }

    /// Classifier label, e.g. `"Pothole"` or `"DefectiveManhole"`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Garbage => "Garbage",
            Self::Pothole => "Pothole",
            Self::DefectiveManhole => "DefectiveManhole",
            Self::NonDefectiveManhole => "NonDefectiveManhole",
            Self::NotSpecified => "NotSpecified",
        }
    }

    /// Case-insensitive match on classifier labels; anything else is `NotSpecified`.
    pub fn from_label(value: &str) -> Self {
        let value = value.trim();
        Self::RECOGNIZED
            .into_iter()
            .find(|category| category.label().eq_ignore_ascii_case(value))
            .unwrap_or(Self::NotSpecified)
    }

    pub fn is_specified(&self) -> bool {
        !matches!(self, Self::NotSpecified)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Approved,
    Declined,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Declined => "declined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Address {
    pub street: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SnapReport {
    pub report_id: String,
    pub submitter_id: String,
    pub image_url: String,
    pub location: GeoPoint,
    pub category: Category,
    pub address: Address,
    pub status: ReportStatus,
    pub issue_id: Option<String>,
    pub validation_task_id: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Terminal state written by the callback correlator. An issue link only
/// exists on approval.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportVerdict {
    status: ReportStatus,
    category: Category,
    issue_id: Option<String>,
}

impl ReportVerdict {
    pub fn approved(category: Category, issue_id: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Approved,
            category,
            issue_id: Some(issue_id.into()),
        }
    }

    pub fn declined(category: Category) -> Self {
        Self {
            status: ReportStatus::Declined,
            category,
            issue_id: None,
        }
    }

    pub fn status(&self) -> ReportStatus {
        self.status
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn issue_id(&self) -> Option<&str> {
        self.issue_id.as_deref()
    }

    pub fn apply_to(&self, report: &mut SnapReport) -> DomainResult<()> {
        if report.status != ReportStatus::Pending {
            return Err(DomainError::Conflict);
        }
        report.status = self.status;
        report.category = self.category;
        report.issue_id = self.issue_id.clone();
        report.updated_at_ms = now_ms();
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SnapReportCreate {
    /// Phone or email the submission code was sent to.
    pub identifier: String,
    pub otp_code: String,
    pub image_url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub category: Option<Category>,
    pub address: Address,
}

#[derive(Clone)]
pub struct SnapReportService {
    repository: Arc<dyn SnapReportRepository>,
    otp: OtpService,
    events: EventBus,
    dispatcher: Arc<dyn WorkDispatcher>,
    requester_factory: RequesterFactory,
}

impl SnapReportService {
    pub fn new(
        repository: Arc<dyn SnapReportRepository>,
        otp: OtpService,
        events: EventBus,
        dispatcher: Arc<dyn WorkDispatcher>,
        requester_factory: RequesterFactory,
    ) -> Self {
        Self {
            repository,
            otp,
            events,
            dispatcher,
            requester_factory,
        }
    }

    /// Creates a pending report behind the submission code and queues its
    /// validation request.
    pub async fn submit(
        &self,
        actor: ActorIdentity,
        input: SnapReportCreate,
    ) -> DomainResult<SnapReport> {
        let location = validate_report_create(&input)?;

        let verified = self
            .otp
            .verify_code(&input.identifier, OtpPurpose::ReportSubmission, &input.otp_code)
            .await;
        if !verified {
            return Err(DomainError::Validation(
                "invalid or expired verification code".into(),
            ));
        }

        let now = now_ms();
        let report = SnapReport {
            report_id: crate::util::uuid_v7_without_dashes(),
            submitter_id: actor.user_id,
            image_url: input.image_url.trim().to_string(),
            location,
            category: input.category.unwrap_or(Category::NotSpecified),
            address: trim_address(input.address),
            status: ReportStatus::Pending,
            issue_id: None,
            validation_task_id: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        let report = self.repository.create(&report).await?;
        tracing::info!(report_id = %report.report_id, "snap report submitted");

        self.events
            .publish(DomainEvent::SnapReportSubmitted {
                report_id: report.report_id.clone(),
                category: report.category,
            })
            .await;

        let report_id = report.report_id.clone();
        let factory = self.requester_factory.clone();
        let item = WorkItem::scoped(
            "validation_request",
            move || factory(),
            move |requester| Box::pin(async move { requester.request(&report_id).await.map(|_| ()) }),
        );
        if let Err(err) = self.dispatcher.dispatch(item) {
            tracing::error!(
                report_id = %report.report_id,
                error = %err,
                "failed to enqueue validation request"
            );
            return Err(DomainError::Unavailable("validation queue closed".into()));
        }

        Ok(report)
    }

    pub async fn get(&self, report_id: &str) -> DomainResult<SnapReport> {
        self.repository
            .get(report_id)
            .await?
            .ok_or(DomainError::NotFound)
    }

    /// Approved reports folded into `issue_id`, oldest first.
    pub async fn list_by_issue(&self, issue_id: &str) -> DomainResult<Vec<SnapReport>> {
        self.repository.list_by_issue(issue_id).await
    }
}

fn validate_report_create(input: &SnapReportCreate) -> DomainResult<GeoPoint> {
    let image_url = input.image_url.trim();
    if image_url.is_empty() {
        return Err(DomainError::Validation("image_url is required".into()));
    }
    if image_url.chars().count() > MAX_IMAGE_URL_LENGTH {
        return Err(DomainError::Validation(format!(
            "image_url exceeds max length of {MAX_IMAGE_URL_LENGTH}"
        )));
    }
    if input.otp_code.trim().is_empty() {
        return Err(DomainError::Validation("otp_code is required".into()));
    }

    let address = &input.address;
    let too_long = [
        &address.street,
        &address.district,
        &address.city,
        &address.province,
        &address.postal_code,
    ]
    .into_iter()
    .flatten()
    .any(|field| field.chars().count() > MAX_ADDRESS_FIELD_LENGTH);
    if too_long {
        return Err(DomainError::Validation(format!(
            "address fields exceed max length of {MAX_ADDRESS_FIELD_LENGTH}"
        )));
    }

    GeoPoint::new(input.latitude, input.longitude)
}

fn trim_address(address: Address) -> Address {
    let clean = |value: Option<String>| {
        value
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    Address {
        street: clean(address.street),
        district: clean(address.district),
        city: clean(address.city),
        province: clean(address.province),
        postal_code: clean(address.postal_code),
    }
}
