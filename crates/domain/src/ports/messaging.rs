use super::BoxFuture;

/// Out-of-band delivery (SMS, push). Returns `false` on failure; callers log
/// and move on.
pub trait MessageSender: Send + Sync {
    fn send_message(&self, identifier: &str, text: &str) -> BoxFuture<'_, bool>;
}
