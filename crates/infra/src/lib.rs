pub mod config;
pub mod dispatch;
pub mod logging;
pub mod messaging;
pub mod redis_stores;
pub mod repositories;
pub mod validation_client;
