use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::messaging::MessageSender;
use crate::ports::otp::{OtpStore, OtpStoreError};
use crate::util::{format_ms_rfc3339, now_ms};

pub const OTP_MIN: u32 = 100_000;
pub const OTP_MAX: u32 = 999_999;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    ReportSubmission,
    PhoneVerification,
    PasswordReset,
}

impl OtpPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReportSubmission => "report_submission",
            Self::PhoneVerification => "phone_verification",
            Self::PasswordReset => "password_reset",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OtpChallenge {
    pub identifier: String,
    pub purpose: OtpPurpose,
    pub code: String,
    pub expires_at_ms: i64,
    pub attempt_count: u32,
}

impl OtpChallenge {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Clone, Debug)]
pub struct OtpConfig {
    pub ttl: Duration,
    pub invalidate_on_success: bool,
    /// Wrong guesses allowed before the code is discarded. Zero disables the cap.
    pub max_attempts: u32,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            invalidate_on_success: true,
            max_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OtpIssued {
    pub expires_at_ms: i64,
    pub expires_at: String,
    pub delivered: bool,
}

/// One active code per (identifier, purpose). Verification never errors:
/// missing, expired, exhausted and wrong codes all read as `false`.
#[derive(Clone)]
pub struct OtpService {
    store: Arc<dyn OtpStore>,
    sender: Arc<dyn MessageSender>,
    config: OtpConfig,
}

impl OtpService {
    pub fn new(store: Arc<dyn OtpStore>, sender: Arc<dyn MessageSender>, config: OtpConfig) -> Self {
        Self {
            store,
            sender,
            config,
        }
    }

    pub fn config(&self) -> &OtpConfig {
        &self.config
    }

    pub async fn generate_code(&self, identifier: &str, purpose: OtpPurpose) -> DomainResult<String> {
        let identifier = normalize_identifier(identifier)?;
        let code = random_code();
        let challenge = OtpChallenge {
            identifier,
            purpose,
            code: code.clone(),
            expires_at_ms: now_ms() + self.config.ttl.as_millis() as i64,
            attempt_count: 0,
        };
        self.store
            .put(&challenge, self.config.ttl)
            .await
            .map_err(store_error)?;
        tracing::debug!(purpose = purpose.as_str(), "otp code generated");
        Ok(code)
    }

    /// Generates a code and hands it to the message sender.
    pub async fn issue(&self, identifier: &str, purpose: OtpPurpose) -> DomainResult<OtpIssued> {
        let code = self.generate_code(identifier, purpose).await?;
        let expires_at_ms = now_ms() + self.config.ttl.as_millis() as i64;
        let text = format!("Your verification code is {code}");
        let delivered = self.sender.send_message(identifier.trim(), &text).await;
        if !delivered {
            tracing::warn!(purpose = purpose.as_str(), "otp delivery failed");
        }
        Ok(OtpIssued {
            expires_at_ms,
            expires_at: format_ms_rfc3339(expires_at_ms),
            delivered,
        })
    }

    pub async fn verify_code(&self, identifier: &str, purpose: OtpPurpose, code: &str) -> bool {
        let Ok(identifier) = normalize_identifier(identifier) else {
            return false;
        };
        let stored = match self.store.get(&identifier, purpose).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "otp lookup failed");
                return false;
            }
        };

        if stored.is_expired_at(now_ms()) {
            return false;
        }
        if self.config.max_attempts > 0 && stored.attempt_count >= self.config.max_attempts {
            return false;
        }

        if stored.code != code.trim() {
            self.register_failure(&identifier, purpose).await;
            return false;
        }

        if !self.config.invalidate_on_success {
            return true;
        }
        match self.store.take_if_matches(&identifier, purpose, code.trim()).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(purpose = purpose.as_str(), "otp consumed by a concurrent verify");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "otp consume failed");
                false
            }
        }
    }

    pub async fn invalidate_code(&self, identifier: &str, purpose: OtpPurpose) -> DomainResult<()> {
        let identifier = normalize_identifier(identifier)?;
        self.store
            .remove(&identifier, purpose)
            .await
            .map_err(store_error)
    }

    async fn register_failure(&self, identifier: &str, purpose: OtpPurpose) {
        let attempts = match self.store.record_failed_attempt(identifier, purpose).await {
            Ok(attempts) => attempts,
            Err(err) => {
                tracing::warn!(error = %err, "otp attempt tracking failed");
                return;
            }
        };
        if self.config.max_attempts > 0 && attempts >= self.config.max_attempts {
            tracing::info!(
                purpose = purpose.as_str(),
                attempts,
                "otp attempts exhausted; discarding code"
            );
            if let Err(err) = self.store.remove(identifier, purpose).await {
                tracing::warn!(error = %err, "otp discard failed");
            }
        }
    }
}

fn random_code() -> String {
    rand::rng().random_range(OTP_MIN..=OTP_MAX).to_string()
}

fn normalize_identifier(identifier: &str) -> DomainResult<String> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(DomainError::Validation("identifier is required".into()));
    }
    Ok(identifier.to_string())
}

fn store_error(err: OtpStoreError) -> DomainError {
    DomainError::Unavailable(err.to_string())
}

/// Map-backed store with lazy expiry on read.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOtpStore {
    inner: Arc<Mutex<HashMap<(String, OtpPurpose), OtpChallenge>>>,
}

impl InMemoryOtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(String, OtpPurpose), OtpChallenge>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OtpStore for InMemoryOtpStore {
    fn put(
        &self,
        challenge: &OtpChallenge,
        _ttl: Duration,
    ) -> BoxFuture<'_, Result<(), OtpStoreError>> {
        let challenge = challenge.clone();
        Box::pin(async move {
            self.entries().insert(
                (challenge.identifier.clone(), challenge.purpose),
                challenge,
            );
            Ok(())
        })
    }

    fn get(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> BoxFuture<'_, Result<Option<OtpChallenge>, OtpStoreError>> {
        let key = (identifier.to_string(), purpose);
        Box::pin(async move {
            let mut entries = self.entries();
            let expired = entries
                .get(&key)
                .is_some_and(|challenge| challenge.is_expired_at(now_ms()));
            if expired {
                entries.remove(&key);
                return Ok(None);
            }
            Ok(entries.get(&key).cloned())
        })
    }

    fn remove(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> BoxFuture<'_, Result<(), OtpStoreError>> {
        let key = (identifier.to_string(), purpose);
        Box::pin(async move {
            self.entries().remove(&key);
            Ok(())
        })
    }

    fn take_if_matches(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        code: &str,
    ) -> BoxFuture<'_, Result<bool, OtpStoreError>> {
        let key = (identifier.to_string(), purpose);
        let code = code.to_string();
        Box::pin(async move {
            let mut entries = self.entries();
            let matches = entries
                .get(&key)
                .is_some_and(|challenge| !challenge.is_expired_at(now_ms()) && challenge.code == code);
            if matches {
                entries.remove(&key);
            }
            Ok(matches)
        })
    }

    fn record_failed_attempt(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> BoxFuture<'_, Result<u32, OtpStoreError>> {
        let key = (identifier.to_string(), purpose);
        Box::pin(async move {
            let mut entries = self.entries();
            match entries.get_mut(&key) {
                Some(challenge) => {
                    challenge.attempt_count = challenge.attempt_count.saturating_add(1);
                    Ok(challenge.attempt_count)
                }
                None => Ok(0),
            }
        })
    }
}
