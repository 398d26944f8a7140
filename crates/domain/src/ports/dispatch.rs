use std::fmt;

use thiserror::Error;

use super::BoxFuture;
use crate::DomainResult;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch queue closed")]
    Closed,
}

pub type WorkFuture = BoxFuture<'static, DomainResult<()>>;

/// Deferred unit of work. Only plain values are captured; collaborators are
/// built when the item starts running.
pub struct WorkItem {
    label: String,
    run: Box<dyn FnOnce() -> WorkFuture + Send>,
}

impl WorkItem {
    pub fn new<F>(label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> WorkFuture + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(run),
        }
    }

    /// `factory` is invoked right before `job`, on the executing task.
    pub fn scoped<S, F, J>(label: impl Into<String>, factory: F, job: J) -> Self
    where
        F: FnOnce() -> S + Send + 'static,
        J: FnOnce(S) -> WorkFuture + Send + 'static,
    {
        Self::new(label, move || job(factory()))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn start(self) -> WorkFuture {
        (self.run)()
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

pub trait WorkDispatcher: Send + Sync {
    fn dispatch(&self, item: WorkItem) -> Result<(), DispatchError>;
}
