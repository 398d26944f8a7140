use std::sync::Arc;

use serde::Serialize;

use crate::DomainResult;
use crate::issues::IssueStatus;
use crate::ports::BoxFuture;
use crate::reports::{Category, ReportStatus};

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DomainEvent {
    SnapReportSubmitted {
        report_id: String,
        category: Category,
    },
    SnapReportValidationRequested {
        report_id: String,
        task_id: String,
    },
    SnapReportStatusChanged {
        report_id: String,
        previous: ReportStatus,
        current: ReportStatus,
        issue_id: Option<String>,
    },
    IssueCreated {
        issue_id: String,
        category: Category,
        report_id: String,
    },
    IssueStatusChanged {
        issue_id: String,
        previous: IssueStatus,
        current: IssueStatus,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SnapReportSubmitted { .. } => "snap_report_submitted",
            Self::SnapReportValidationRequested { .. } => "snap_report_validation_requested",
            Self::SnapReportStatusChanged { .. } => "snap_report_status_changed",
            Self::IssueCreated { .. } => "issue_created",
            Self::IssueStatusChanged { .. } => "issue_status_changed",
        }
    }
}

pub trait DomainEventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> BoxFuture<'a, DomainResult<()>>;
}

/// In-process fan-out. Handlers run one after another on the publishing task,
/// so `publish` returns only once every handler is done. A failing handler is
/// logged and does not stop the others.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Vec<Arc<dyn DomainEventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn DomainEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub async fn publish(&self, event: DomainEvent) {
        tracing::debug!(event = event.name(), "publishing domain event");
        for handler in &self.handlers {
            if let Err(err) = handler.handle(&event).await {
                tracing::warn!(
                    event = event.name(),
                    handler = handler.name(),
                    error = %err,
                    "domain event handler failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    impl DomainEventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn handle<'a>(&'a self, event: &'a DomainEvent) -> BoxFuture<'a, DomainResult<()>> {
            Box::pin(async move {
                self.seen.lock().expect("recorder lock").push(event.name());
                Ok(())
            })
        }
    }

    struct Failing;

    impl DomainEventHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn handle<'a>(&'a self, _event: &'a DomainEvent) -> BoxFuture<'a, DomainResult<()>> {
            Box::pin(async { Err(DomainError::Unavailable("down".into())) })
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_later_handlers() {
        let recorder = Arc::new(Recorder::default());
        let bus = EventBus::new()
            .with_handler(Arc::new(Failing))
            .with_handler(recorder.clone());

        bus.publish(DomainEvent::IssueStatusChanged {
            issue_id: "issue-1".to_string(),
            previous: IssueStatus::Pending,
            current: IssueStatus::InProgress,
        })
        .await;

        assert_eq!(bus.handler_count(), 2);
        assert_eq!(
            *recorder.seen.lock().expect("recorder lock"),
            vec!["issue_status_changed"]
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(DomainEvent::IssueCreated {
            issue_id: "issue-1".to_string(),
            category: Category::Pothole,
            report_id: "report-1".to_string(),
        })
        .expect("serialize");
        assert_eq!(value["event_type"], "issue_created");
        assert_eq!(value["category"], "pothole");
    }
}
