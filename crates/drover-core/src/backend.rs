//! The `TaskBackend` trait -- the contract between the loop and whatever
//! stores tasks.
//!
//! Implementations may be file-backed or remote; the core never caches
//! results beyond a single loop iteration. The trait is object-safe so the
//! loop can hold `Arc<dyn TaskBackend>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DroverError;
use crate::task::{Task, TaskPriority, TaskStatus};

/// Input for creating a task through a backend.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: Option<TaskPriority>,
    pub feature: Option<String>,
    pub dependencies: Vec<String>,
    pub metadata: std::collections::BTreeMap<String, serde_json::Value>,
}

/// Optional timestamp fields set alongside a status update.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusFields {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusFields {
    pub fn started_now() -> Self {
        Self {
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    pub fn completed_now() -> Self {
        Self {
            started_at: None,
            completed_at: Some(Utc::now()),
        }
    }
}

/// Pluggable task storage.
///
/// A "ready" task is `pending` with every dependency `completed`;
/// `find_next_task` must never return anything else.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// The next ready task, or `None` when nothing is ready.
    async fn find_next_task(&self) -> Result<Option<Task>, DroverError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DroverError>;

    async fn list_pending_tasks(&self) -> Result<Vec<Task>, DroverError>;

    async fn list_completed_tasks(&self) -> Result<Vec<Task>, DroverError> {
        Ok(Vec::new())
    }

    async fn list_failed_tasks(&self) -> Result<Vec<Task>, DroverError> {
        Ok(Vec::new())
    }

    async fn create_task(&self, input: NewTask) -> Result<Task, DroverError>;

    /// Transition a task's status, setting the given timestamps.
    ///
    /// Implementations should reject transitions that violate
    /// [`TaskStatus::can_transition_to`].
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        fields: StatusFields,
    ) -> Result<(), DroverError>;
}

// Compile-time assertion: the backend must be usable as `dyn TaskBackend`.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskBackend) {}
};

/// Shared readiness rule for backend implementations: pending, with every
/// dependency completed in `all`.
pub fn is_ready(task: &Task, all: &[Task]) -> bool {
    if task.status != TaskStatus::Pending {
        return false;
    }
    task.dependencies.iter().all(|dep_id| {
        all.iter()
            .any(|t| &t.id == dep_id && t.status == TaskStatus::Completed)
    })
}
