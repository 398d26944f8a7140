use std::time::Duration;

use thiserror::Error;

use super::BoxFuture;
use crate::otp::{OtpChallenge, OtpPurpose};

#[derive(Debug, Error)]
pub enum OtpStoreError {
    #[error("otp store unavailable: {0}")]
    Unavailable(String),
    #[error("otp serialization error: {0}")]
    Serialization(String),
    #[error("otp store error: {0}")]
    Store(String),
}

pub trait OtpStore: Send + Sync {
    /// Replaces whatever challenge is stored for the same identifier and purpose.
    fn put(
        &self,
        challenge: &OtpChallenge,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), OtpStoreError>>;

    /// Expired challenges read as `None`.
    fn get(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> BoxFuture<'_, Result<Option<OtpChallenge>, OtpStoreError>>;

    fn remove(&self, identifier: &str, purpose: OtpPurpose)
    -> BoxFuture<'_, Result<(), OtpStoreError>>;

    /// Removes the challenge only when it is live and carries `code`, as one
    /// step. Of two concurrent callers with the same code, one gets `true`.
    fn take_if_matches(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        code: &str,
    ) -> BoxFuture<'_, Result<bool, OtpStoreError>>;

    /// Returns the attempt count after the increment, or 0 when nothing is stored.
    fn record_failed_attempt(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> BoxFuture<'_, Result<u32, OtpStoreError>>;
}
