use std::sync::Arc;
use std::time::Duration;

use pantau_domain::cache::{CacheInvalidator, InMemoryCacheStore};
use pantau_domain::dedup::{DedupConfig, DeduplicationEngine};
use pantau_domain::events::EventBus;
use pantau_domain::idempotency::{IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore};
use pantau_domain::issues::IssueService;
use pantau_domain::otp::{InMemoryOtpStore, OtpConfig, OtpService};
use pantau_domain::ports::cache::CacheStore;
use pantau_domain::ports::idempotency::IdempotencyStore;
use pantau_domain::ports::otp::OtpStore;
use pantau_domain::ports::validation::ValidationClient;
use pantau_domain::reports::SnapReportService;
use pantau_domain::validation::{ValidationCorrelator, ValidationRequester};
use pantau_infra::config::AppConfig;
use pantau_infra::dispatch::{DispatchConfig, DispatchQueue};
use pantau_infra::messaging::LogMessageSender;
use pantau_infra::redis_stores::{self, RedisCacheStore, RedisIdempotencyStore, RedisOtpStore};
use pantau_infra::repositories::{InMemoryIssueRepository, InMemorySnapReportRepository};
use pantau_infra::validation_client::HttpValidationClient;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Key-value backends selected by `data_backend`.
#[derive(Clone)]
pub struct Backends {
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub otp: Arc<dyn OtpStore>,
    pub cache: Arc<dyn CacheStore>,
}

impl Backends {
    pub fn in_memory(prefix: &str) -> Self {
        Self {
            idempotency: Arc::new(InMemoryIdempotencyStore::new(prefix)),
            otp: Arc::new(InMemoryOtpStore::new()),
            cache: Arc::new(InMemoryCacheStore::new()),
        }
    }

    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        if !config.uses_redis() {
            tracing::info!("using in-memory backends");
            return Ok(Self::in_memory(&config.redis_prefix));
        }
        let manager = redis_stores::connect(&config.redis_url).await?;
        tracing::info!("using redis backends");
        Ok(Self {
            idempotency: Arc::new(RedisIdempotencyStore::new(
                manager.clone(),
                &config.redis_prefix,
            )),
            otp: Arc::new(RedisOtpStore::new(manager.clone(), &config.redis_prefix)),
            cache: Arc::new(RedisCacheStore::new(manager, &config.redis_prefix)),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub otp: OtpService,
    pub reports: SnapReportService,
    pub issues: IssueService,
    pub correlator: ValidationCorrelator,
    pub cache: Arc<dyn CacheStore>,
    pub cache_ttl: Duration,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires the pipeline and starts the dispatch queue. The returned handle
    /// finishes once `shutdown` is cancelled.
    pub async fn new(config: AppConfig) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let backends = Backends::from_config(&config).await?;
        let client = Arc::new(HttpValidationClient::from_config(&config));
        Ok(Self::with_backends(config, backends, client))
    }

    pub fn with_backends(
        config: AppConfig,
        backends: Backends,
        client: Arc<dyn ValidationClient>,
    ) -> (Self, JoinHandle<()>) {
        let reports = Arc::new(InMemorySnapReportRepository::new());
        let issues = Arc::new(InMemoryIssueRepository::new());
        let events =
            EventBus::new().with_handler(Arc::new(CacheInvalidator::new(backends.cache.clone())));

        let otp = OtpService::new(
            backends.otp,
            Arc::new(LogMessageSender::new(config.is_development())),
            OtpConfig {
                ttl: Duration::from_secs(config.otp_ttl_secs),
                invalidate_on_success: config.otp_invalidate_on_success,
                max_attempts: config.otp_max_attempts,
            },
        );

        let shutdown = CancellationToken::new();
        let (queue, dispatch_worker) = DispatchQueue::start(
            DispatchConfig {
                max_concurrency: config.dispatch_max_concurrency,
            },
            shutdown.clone(),
        );
        let requester = ValidationRequester::new(
            reports.clone(),
            client,
            events.clone(),
            config.webhook_url(),
        );
        let submissions = SnapReportService::new(
            reports.clone(),
            otp.clone(),
            events.clone(),
            Arc::new(queue),
            requester.factory(),
        );

        let dedup = Arc::new(DeduplicationEngine::new(
            issues.clone(),
            DedupConfig {
                radius_m: config.dedup_radius_m,
            },
        ));
        let idempotency = IdempotencyService::new(backends.idempotency, IdempotencyConfig::default());
        let correlator = ValidationCorrelator::new(
            reports,
            dedup,
            events.clone(),
            idempotency,
            config.validation_approval_threshold,
        );
        let issue_service = IssueService::new(issues, events);

        let cache_ttl = Duration::from_secs(config.cache_detail_ttl_secs.max(1));
        let state = Self {
            config,
            otp,
            reports: submissions,
            issues: issue_service,
            correlator,
            cache: backends.cache,
            cache_ttl,
            shutdown,
        };
        (state, dispatch_worker)
    }
}
