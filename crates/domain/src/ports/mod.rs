use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod cache;
pub mod dispatch;
pub mod idempotency;
pub mod issues;
pub mod messaging;
pub mod otp;
pub mod reports;
pub mod validation;
