use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use pantau_domain::DomainResult;
use pantau_domain::cache::{CacheInvalidator, CacheKeys, InMemoryCacheStore, read_through};
use pantau_domain::dedup::{DedupConfig, DeduplicationEngine};
use pantau_domain::error::DomainError;
use pantau_domain::events::EventBus;
use pantau_domain::geo::GeoPoint;
use pantau_domain::idempotency::{IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore};
use pantau_domain::identity::ActorIdentity;
use pantau_domain::issues::{Issue, IssueService, IssueStatus};
use pantau_domain::otp::{InMemoryOtpStore, OtpConfig, OtpPurpose, OtpService};
use pantau_domain::ports::BoxFuture;
use pantau_domain::ports::cache::CacheStore;
use pantau_domain::ports::issues::IssueRepository;
use pantau_domain::ports::reports::SnapReportRepository;
use pantau_domain::ports::validation::{
    ValidationClient, ValidationClientError, ValidationRequest,
};
use pantau_domain::reports::{
    Address, Category, ReportStatus, ReportVerdict, SnapReport, SnapReportCreate,
    SnapReportService,
};
use pantau_domain::validation::{
    CallbackOutcome, DEFAULT_APPROVAL_THRESHOLD, ValidationCallback, ValidationCorrelator,
    ValidationRequester,
};
use pantau_infra::dispatch::{DispatchConfig, DispatchQueue};
use pantau_infra::messaging::LogMessageSender;
use pantau_infra::repositories::{InMemoryIssueRepository, InMemorySnapReportRepository};
use tokio_util::sync::CancellationToken;

const TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct StubClassifier {
    issued: AtomicUsize,
    failing: AtomicBool,
}

impl ValidationClient for StubClassifier {
    fn submit(
        &self,
        request: &ValidationRequest,
    ) -> BoxFuture<'_, Result<String, ValidationClientError>> {
        let webhook_ok = request.webhook_url.ends_with("/v1/webhooks/validation");
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ValidationClientError::Transport("connection refused".into()));
            }
            assert!(webhook_ok);
            let next = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("task-{next}"))
        })
    }
}

struct Pipeline {
    reports: Arc<InMemorySnapReportRepository>,
    issues: Arc<InMemoryIssueRepository>,
    cache: Arc<InMemoryCacheStore>,
    classifier: Arc<StubClassifier>,
    otp: OtpService,
    submissions: SnapReportService,
    issue_service: IssueService,
    correlator: ValidationCorrelator,
    shutdown: CancellationToken,
}

impl Pipeline {
    fn new() -> Self {
        let reports = Arc::new(InMemorySnapReportRepository::new());
        let issues = Arc::new(InMemoryIssueRepository::new());
        let cache = Arc::new(InMemoryCacheStore::new());
        let classifier = Arc::new(StubClassifier::default());
        let events = EventBus::new().with_handler(Arc::new(CacheInvalidator::new(cache.clone())));

        let otp = OtpService::new(
            Arc::new(InMemoryOtpStore::new()),
            Arc::new(LogMessageSender::new(false)),
            OtpConfig::default(),
        );
        let shutdown = CancellationToken::new();
        let (queue, _consumer) = DispatchQueue::start(DispatchConfig::default(), shutdown.clone());
        let requester = ValidationRequester::new(
            reports.clone(),
            classifier.clone(),
            events.clone(),
            "http://127.0.0.1:3000/v1/webhooks/validation",
        );
        let submissions = SnapReportService::new(
            reports.clone(),
            otp.clone(),
            events.clone(),
            Arc::new(queue),
            requester.factory(),
        );
        let dedup = Arc::new(DeduplicationEngine::new(issues.clone(), DedupConfig::default()));
        let idempotency = IdempotencyService::new(
            Arc::new(InMemoryIdempotencyStore::new("test")),
            IdempotencyConfig::default(),
        );
        let correlator = ValidationCorrelator::new(
            reports.clone(),
            dedup,
            events.clone(),
            idempotency,
            DEFAULT_APPROVAL_THRESHOLD,
        );
        let issue_service = IssueService::new(issues.clone(), events);

        Self {
            reports,
            issues,
            cache,
            classifier,
            otp,
            submissions,
            issue_service,
            correlator,
            shutdown,
        }
    }

    async fn submit(&self, identifier: &str, latitude: f64, longitude: f64) -> SnapReport {
        let code = self
            .otp
            .generate_code(identifier, OtpPurpose::ReportSubmission)
            .await
            .expect("otp");
        self.submissions
            .submit(
                ActorIdentity::with_user_id("user-1"),
                SnapReportCreate {
                    identifier: identifier.to_string(),
                    otp_code: code,
                    image_url: "https://cdn.example.org/photo.jpg".to_string(),
                    latitude,
                    longitude,
                    category: None,
                    address: Address {
                        city: Some("Jakarta".to_string()),
                        ..Address::default()
                    },
                },
            )
            .await
            .expect("submit")
    }

    async fn task_id_for(&self, report_id: &str) -> String {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let report = self
                    .reports
                    .get(report_id)
                    .await
                    .expect("get")
                    .expect("report exists");
                if let Some(task_id) = report.validation_task_id {
                    return task_id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("validation requested")
    }

    async fn report(&self, report_id: &str) -> SnapReport {
        self.reports
            .get(report_id)
            .await
            .expect("get")
            .expect("report exists")
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn completed(task_id: &str, score: f64, category: &str) -> ValidationCallback {
    ValidationCallback {
        task_id: task_id.to_string(),
        status: "completed".to_string(),
        category: Some(category.to_string()),
        threshold: Some(score),
    }
}

#[tokio::test]
async fn submission_requests_validation_in_background() {
    let pipeline = Pipeline::new();
    let report = pipeline.submit("+62811000001", -6.2, 106.8).await;
    assert_eq!(report.status, ReportStatus::Pending);
    assert!(report.validation_task_id.is_none());

    let task_id = pipeline.task_id_for(&report.report_id).await;
    assert_eq!(task_id, "task-1");
    assert_eq!(pipeline.report(&report.report_id).await.status, ReportStatus::Pending);
}

#[tokio::test]
async fn wrong_code_rejects_submission() {
    let pipeline = Pipeline::new();
    pipeline
        .otp
        .generate_code("+62811000002", OtpPurpose::ReportSubmission)
        .await
        .expect("otp");

    let err = pipeline
        .submissions
        .submit(
            ActorIdentity::with_user_id("user-1"),
            SnapReportCreate {
                identifier: "+62811000002".to_string(),
                otp_code: "000000".to_string(),
                image_url: "https://cdn.example.org/photo.jpg".to_string(),
                latitude: -6.2,
                longitude: 106.8,
                category: None,
                address: Address::default(),
            },
        )
        .await
        .expect_err("wrong code");
    assert!(matches!(err, DomainError::Validation(_)));
}

#[tokio::test]
async fn classifier_failure_leaves_report_pending_without_task() {
    let pipeline = Pipeline::new();
    pipeline.classifier.failing.store(true, Ordering::SeqCst);
    let report = pipeline.submit("+62811000003", -6.2, 106.8).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = pipeline.report(&report.report_id).await;
    assert_eq!(stored.status, ReportStatus::Pending);
    assert!(stored.validation_task_id.is_none());
}

#[tokio::test]
async fn approved_reports_within_radius_share_one_issue() {
    let pipeline = Pipeline::new();
    let first = pipeline.submit("+62811000004", -6.2, 106.8).await;
    // ~11 m away
    let second = pipeline.submit("+62811000005", -6.2001, 106.8).await;
    // ~55 m away
    let third = pipeline.submit("+62811000006", -6.2005, 106.8).await;

    let mut issue_ids = Vec::new();
    for report in [&first, &second, &third] {
        let task_id = pipeline.task_id_for(&report.report_id).await;
        let outcome = pipeline
            .correlator
            .handle(&completed(&task_id, 0.9, "Pothole"))
            .await
            .expect("callback");
        let CallbackOutcome::Approved { issue_id, .. } = outcome else {
            panic!("expected approval, got {outcome:?}");
        };
        issue_ids.push(issue_id);
    }

    assert_eq!(issue_ids[0], issue_ids[1]);
    assert_ne!(issue_ids[0], issue_ids[2]);
    assert_eq!(pipeline.issues.count().await, 2);

    let approved = pipeline.report(&second.report_id).await;
    assert_eq!(approved.status, ReportStatus::Approved);
    assert_eq!(approved.category, Category::Pothole);
    assert_eq!(approved.issue_id.as_deref(), Some(issue_ids[0].as_str()));
}

#[tokio::test]
async fn concurrent_approvals_at_one_spot_create_exactly_one_issue() {
    let pipeline = Pipeline::new();
    let mut task_ids = Vec::new();
    for index in 0..8 {
        let report = pipeline
            .submit(
                &format!("+6281100010{index}"),
                -6.2 + f64::from(index) * 0.000_02,
                106.8,
            )
            .await;
        task_ids.push(pipeline.task_id_for(&report.report_id).await);
    }

    let mut handles = Vec::new();
    for task_id in task_ids {
        let correlator = pipeline.correlator.clone();
        handles.push(tokio::spawn(async move {
            correlator
                .handle(&completed(&task_id, 0.8, "garbage"))
                .await
                .expect("callback")
        }));
    }

    let mut created = 0;
    for handle in handles {
        if let CallbackOutcome::Approved { issue_created, .. } = handle.await.expect("join") {
            created += usize::from(issue_created);
        }
    }
    assert_eq!(created, 1);
    assert_eq!(pipeline.issues.count().await, 1);
}

#[tokio::test]
async fn replayed_callback_is_acknowledged_without_side_effects() {
    let pipeline = Pipeline::new();
    let report = pipeline.submit("+62811000007", -6.2, 106.8).await;
    let task_id = pipeline.task_id_for(&report.report_id).await;
    let callback = completed(&task_id, 0.7, "DefectiveManhole");

    let first = pipeline.correlator.handle(&callback).await.expect("first");
    assert!(matches!(
        first,
        CallbackOutcome::Approved {
            issue_created: true,
            ..
        }
    ));
    let replay = pipeline.correlator.handle(&callback).await.expect("replay");
    assert_eq!(replay, CallbackOutcome::Duplicate);
    assert_eq!(pipeline.issues.count().await, 1);
}

#[tokio::test]
async fn unknown_task_is_a_silent_no_op() {
    let pipeline = Pipeline::new();
    let outcome = pipeline
        .correlator
        .handle(&completed("task-does-not-exist", 0.9, "Pothole"))
        .await
        .expect("acknowledged");
    assert_eq!(outcome, CallbackOutcome::UnknownTask);
    assert_eq!(pipeline.issues.count().await, 0);
}

#[tokio::test]
async fn low_score_and_failed_status_decline_without_issue() {
    let pipeline = Pipeline::new();
    let low = pipeline.submit("+62811000008", -6.2, 106.8).await;
    let failed = pipeline.submit("+62811000009", -6.3, 106.9).await;

    let low_task = pipeline.task_id_for(&low.report_id).await;
    let outcome = pipeline
        .correlator
        .handle(&completed(&low_task, 0.2, "Pothole"))
        .await
        .expect("low score");
    assert!(matches!(outcome, CallbackOutcome::Declined { .. }));

    let failed_task = pipeline.task_id_for(&failed.report_id).await;
    let outcome = pipeline
        .correlator
        .handle(&ValidationCallback {
            task_id: failed_task,
            status: "failed".to_string(),
            category: None,
            threshold: None,
        })
        .await
        .expect("failed");
    assert!(matches!(outcome, CallbackOutcome::Declined { .. }));

    let declined = pipeline.report(&low.report_id).await;
    assert_eq!(declined.status, ReportStatus::Declined);
    assert!(declined.issue_id.is_none());
    assert_eq!(pipeline.issues.count().await, 0);
}

#[tokio::test]
async fn queued_status_leaves_report_pending() {
    let pipeline = Pipeline::new();
    let report = pipeline.submit("+62811000010", -6.2, 106.8).await;
    let task_id = pipeline.task_id_for(&report.report_id).await;

    let outcome = pipeline
        .correlator
        .handle(&ValidationCallback {
            task_id: task_id.clone(),
            status: "queued".to_string(),
            category: None,
            threshold: Some(0.9),
        })
        .await
        .expect("queued");
    assert_eq!(outcome, CallbackOutcome::Ignored);
    assert_eq!(pipeline.report(&report.report_id).await.status, ReportStatus::Pending);

    // A later terminal callback for the same task still applies.
    let outcome = pipeline
        .correlator
        .handle(&completed(&task_id, 0.9, "Pothole"))
        .await
        .expect("completed");
    assert!(matches!(outcome, CallbackOutcome::Approved { .. }));
}

#[tokio::test]
async fn state_changes_clear_cached_details() {
    let pipeline = Pipeline::new();
    let report = pipeline.submit("+62811000011", -6.2, 106.8).await;
    let task_id = pipeline.task_id_for(&report.report_id).await;

    let report_key = CacheKeys::report_detail(&report.report_id);
    let load_report = || async { pipeline.reports.get(&report.report_id).await };
    let cached: Option<SnapReport> =
        read_through(pipeline.cache.as_ref(), &report_key, TTL, load_report)
            .await
            .expect("read");
    assert_eq!(cached.expect("report").status, ReportStatus::Pending);

    let outcome = pipeline
        .correlator
        .handle(&completed(&task_id, 0.9, "Pothole"))
        .await
        .expect("callback");
    let CallbackOutcome::Approved { issue_id, .. } = outcome else {
        panic!("expected approval, got {outcome:?}");
    };

    let fresh: Option<SnapReport> =
        read_through(pipeline.cache.as_ref(), &report_key, TTL, load_report)
            .await
            .expect("read");
    assert_eq!(fresh.expect("report").status, ReportStatus::Approved);

    let issue_key = CacheKeys::issue_detail(&issue_id);
    let load_issue = || async { pipeline.issues.get(&issue_id).await };
    let cached: Option<Issue> = read_through(pipeline.cache.as_ref(), &issue_key, TTL, load_issue)
        .await
        .expect("read");
    assert_eq!(cached.expect("issue").status, IssueStatus::Pending);

    pipeline
        .issue_service
        .change_status(&issue_id, IssueStatus::InProgress)
        .await
        .expect("status change");

    let fresh: Option<Issue> = read_through(pipeline.cache.as_ref(), &issue_key, TTL, load_issue)
        .await
        .expect("read");
    assert_eq!(fresh.expect("issue").status, IssueStatus::InProgress);
}

#[tokio::test]
async fn callback_before_task_is_recorded_applies_on_redelivery() {
    let pipeline = Pipeline::new();
    pipeline.classifier.failing.store(true, Ordering::SeqCst);
    let report = pipeline.submit("+62811000012", -6.2, 106.8).await;
    let callback = completed("task-early", 0.9, "Pothole");

    let first = pipeline.correlator.handle(&callback).await.expect("first");
    assert_eq!(first, CallbackOutcome::UnknownTask);

    pipeline
        .reports
        .set_validation_task(&report.report_id, "task-early")
        .await
        .expect("record task");
    let redelivered = pipeline.correlator.handle(&callback).await.expect("redelivery");
    assert!(matches!(
        redelivered,
        CallbackOutcome::Approved {
            issue_created: true,
            ..
        }
    ));
    assert_eq!(pipeline.report(&report.report_id).await.status, ReportStatus::Approved);
}

#[tokio::test]
async fn closed_queue_rejects_submission() {
    let pipeline = Pipeline::new();
    pipeline.shutdown.cancel();
    let code = pipeline
        .otp
        .generate_code("+62811000013", OtpPurpose::ReportSubmission)
        .await
        .expect("otp");

    let err = pipeline
        .submissions
        .submit(
            ActorIdentity::with_user_id("user-1"),
            SnapReportCreate {
                identifier: "+62811000013".to_string(),
                otp_code: code,
                image_url: "https://cdn.example.org/photo.jpg".to_string(),
                latitude: -6.2,
                longitude: 106.8,
                category: None,
                address: Address::default(),
            },
        )
        .await
        .expect_err("queue closed");
    assert!(matches!(err, DomainError::Unavailable(_)));
    assert_eq!(pipeline.classifier.issued.load(Ordering::SeqCst), 0);
}

/// Reports whose verdict always loses to a concurrent writer.
struct VerdictAlwaysConflicts {
    inner: InMemorySnapReportRepository,
}

impl SnapReportRepository for VerdictAlwaysConflicts {
    fn create(&self, report: &SnapReport) -> BoxFuture<'_, DomainResult<SnapReport>> {
        self.inner.create(report)
    }

    fn get(&self, report_id: &str) -> BoxFuture<'_, DomainResult<Option<SnapReport>>> {
        self.inner.get(report_id)
    }

    fn get_by_validation_task(
        &self,
        task_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<SnapReport>>> {
        self.inner.get_by_validation_task(task_id)
    }

    fn set_validation_task(
        &self,
        report_id: &str,
        task_id: &str,
    ) -> BoxFuture<'_, DomainResult<SnapReport>> {
        self.inner.set_validation_task(report_id, task_id)
    }

    fn apply_verdict(
        &self,
        _report_id: &str,
        _verdict: &ReportVerdict,
    ) -> BoxFuture<'_, DomainResult<SnapReport>> {
        Box::pin(async { Err(DomainError::Conflict) })
    }

    fn list_by_issue(&self, issue_id: &str) -> BoxFuture<'_, DomainResult<Vec<SnapReport>>> {
        self.inner.list_by_issue(issue_id)
    }
}

#[tokio::test]
async fn issue_created_before_verdict_conflict_still_clears_listings() {
    let reports = Arc::new(VerdictAlwaysConflicts {
        inner: InMemorySnapReportRepository::new(),
    });
    let issues = Arc::new(InMemoryIssueRepository::new());
    let cache = Arc::new(InMemoryCacheStore::new());
    let events = EventBus::new().with_handler(Arc::new(CacheInvalidator::new(cache.clone())));
    let correlator = ValidationCorrelator::new(
        reports.clone(),
        Arc::new(DeduplicationEngine::new(issues.clone(), DedupConfig::default())),
        events,
        IdempotencyService::new(
            Arc::new(InMemoryIdempotencyStore::new("test")),
            IdempotencyConfig::default(),
        ),
        DEFAULT_APPROVAL_THRESHOLD,
    );

    let report = SnapReport {
        report_id: "report-1".to_string(),
        submitter_id: "user-1".to_string(),
        image_url: "https://cdn.example.org/photo.jpg".to_string(),
        location: GeoPoint::new(-6.2, 106.8).expect("point"),
        category: Category::NotSpecified,
        address: Address::default(),
        status: ReportStatus::Pending,
        issue_id: None,
        validation_task_id: None,
        created_at_ms: 1,
        updated_at_ms: 1,
    };
    reports.create(&report).await.expect("create");
    reports
        .set_validation_task("report-1", "task-1")
        .await
        .expect("task");

    cache.set("issue:list:page:1", "[]", TTL).await.expect("seed");
    cache
        .set(CacheKeys::STATS_DASHBOARD_SUMMARY, "{}", TTL)
        .await
        .expect("seed");

    let outcome = correlator
        .handle(&completed("task-1", 0.9, "Pothole"))
        .await
        .expect("callback");
    assert_eq!(outcome, CallbackOutcome::AlreadyApplied);
    assert_eq!(issues.count().await, 1);
    assert!(cache.get("issue:list:page:1").await.expect("get").is_none());
    assert!(
        cache
            .get(CacheKeys::STATS_DASHBOARD_SUMMARY)
            .await
            .expect("get")
            .is_none()
    );
}
