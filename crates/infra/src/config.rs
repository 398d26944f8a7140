use serde::Deserialize;

pub const WEBHOOK_PATH: &str = "/v1/webhooks/validation";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub data_backend: String,
    pub redis_url: String,
    pub redis_prefix: String,
    pub jwt_secret: String,
    pub public_base_url: String,
    pub validation_base_url: String,
    pub validation_path: String,
    pub validation_timeout_ms: u64,
    pub validation_approval_threshold: f64,
    pub dedup_radius_m: f64,
    pub otp_ttl_secs: u64,
    pub otp_invalidate_on_success: bool,
    pub otp_max_attempts: u32,
    pub dispatch_max_concurrency: usize,
    pub cache_detail_ttl_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        Self::builder()?
            .add_source(config::Environment::default().separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Defaults only; used by tests that must not pick up the host environment.
    pub fn defaults() -> Result<Self, config::ConfigError> {
        Self::builder()?.build()?.try_deserialize()
    }

    fn builder()
    -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("redis_prefix", "pantau")?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("public_base_url", "http://127.0.0.1:3000")?
            .set_default("validation_base_url", "http://127.0.0.1:8090")?
            .set_default("validation_path", "/api/validate")?
            .set_default("validation_timeout_ms", 10_000)?
            .set_default("validation_approval_threshold", 0.3)?
            .set_default("dedup_radius_m", 30.0)?
            .set_default("otp_ttl_secs", 300)?
            .set_default("otp_invalidate_on_success", true)?
            .set_default("otp_max_attempts", 5)?
            .set_default("dispatch_max_concurrency", 0)?
            .set_default("cache_detail_ttl_secs", 300)
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("development")
    }

    pub fn uses_redis(&self) -> bool {
        self.data_backend.eq_ignore_ascii_case("redis")
    }

    /// Callback address handed to the classifier with every request.
    pub fn webhook_url(&self) -> String {
        format!(
            "{}{}",
            self.public_base_url.trim_end_matches('/'),
            WEBHOOK_PATH
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::defaults().expect("defaults");
        assert_eq!(config.port, 3000);
        assert_eq!(config.validation_path, "/api/validate");
        assert!((config.validation_approval_threshold - 0.3).abs() < f64::EPSILON);
        assert!((config.dedup_radius_m - 30.0).abs() < f64::EPSILON);
        assert_eq!(config.otp_max_attempts, 5);
        assert_eq!(config.dispatch_max_concurrency, 0);
        assert!(config.is_development());
        assert!(!config.uses_redis());
    }

    #[test]
    fn webhook_url_joins_without_double_slash() {
        let mut config = AppConfig::defaults().expect("defaults");
        config.public_base_url = "https://pantau.example.org/".to_string();
        assert_eq!(
            config.webhook_url(),
            "https://pantau.example.org/v1/webhooks/validation"
        );
    }
}
