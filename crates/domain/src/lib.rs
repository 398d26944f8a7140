pub mod cache;
pub mod dedup;
pub mod error;
pub mod events;
pub mod geo;
pub mod idempotency;
pub mod identity;
pub mod issues;
pub mod otp;
pub mod ports;
pub mod reports;
pub mod util;
pub mod validation;

pub type DomainResult<T> = Result<T, error::DomainError>;
