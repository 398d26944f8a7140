use pantau_domain::ports::BoxFuture;
use pantau_domain::ports::messaging::MessageSender;

/// Stand-in for an SMS gateway: writes each message to the log. Message text
/// (which carries the code) is only logged when `reveal_text` is set.
#[derive(Debug, Clone, Default)]
pub struct LogMessageSender {
    reveal_text: bool,
}

impl LogMessageSender {
    pub fn new(reveal_text: bool) -> Self {
        Self { reveal_text }
    }
}

impl MessageSender for LogMessageSender {
    fn send_message(&self, identifier: &str, text: &str) -> BoxFuture<'_, bool> {
        let recipient = mask_identifier(identifier);
        let text = self.reveal_text.then(|| text.to_string());
        Box::pin(async move {
            match text {
                Some(text) => tracing::info!(recipient = %recipient, text = %text, "message sent"),
                None => tracing::info!(recipient = %recipient, "message sent"),
            }
            true
        })
    }
}

/// Keeps the last four characters, e.g. `+62811223344` -> `********3344`.
pub fn mask_identifier(identifier: &str) -> String {
    let chars: Vec<char> = identifier.trim().chars().collect();
    let visible = chars.len().min(4);
    let hidden = chars.len() - visible;
    std::iter::repeat_n('*', hidden)
        .chain(chars[hidden..].iter().copied())
        .collect()
}
