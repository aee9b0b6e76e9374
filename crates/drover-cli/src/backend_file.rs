//! File-backed task backend.
//!
//! Tasks live in a single JSON array (by default `.drover/tasks.json`).
//! Every mutation rewrites the file atomically, so another process (or an
//! operator with an editor) can watch it safely. Suitable for single-host
//! loops; anything distributed belongs in a remote backend.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use drover_core::backend::{is_ready, NewTask, StatusFields, TaskBackend};
use drover_core::error::DroverError;
use drover_core::task::{Task, TaskPriority, TaskStatus};
use drover_state::write_atomic;

pub struct FileBackend {
    path: PathBuf,
    tasks: Mutex<Vec<Task>>,
}

impl FileBackend {
    /// Open a backend at `path`, creating an empty task list when the
    /// file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let tasks = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, tasks: &[Task]) -> Result<(), DroverError> {
        let bytes = serde_json::to_vec_pretty(tasks)
            .map_err(|e| DroverError::Backend(format!("serialize tasks: {e}")))?;
        write_atomic(&self.path, &bytes)
            .map_err(|e| DroverError::Backend(format!("persist tasks: {e}")))
    }

    /// Append a task with an explicit id (operator/seed path).
    pub fn seed(&self, task: Task) -> Result<(), DroverError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.iter().any(|t| t.id == task.id) {
            return Err(DroverError::Backend(format!(
                "duplicate task id '{}'",
                task.id
            )));
        }
        tasks.push(task);
        self.persist(&tasks)
    }
}

#[async_trait]
impl TaskBackend for FileBackend {
    async fn find_next_task(&self) -> Result<Option<Task>, DroverError> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut ready: Vec<(usize, &Task)> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| is_ready(t, &tasks))
            .collect();
        ready.sort_by_key(|(index, t)| (t.priority.rank(), *index));
        Ok(ready.first().map(|(_, t)| (*t).clone()))
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DroverError> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn list_pending_tasks(&self) -> Result<Vec<Task>, DroverError> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn list_completed_tasks(&self) -> Result<Vec<Task>, DroverError> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .cloned()
            .collect())
    }

    async fn list_failed_tasks(&self) -> Result<Vec<Task>, DroverError> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect())
    }

    async fn create_task(&self, input: NewTask) -> Result<Task, DroverError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let id = format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let mut task = Task::new(
            id,
            input.title,
            input.description,
            input.priority.unwrap_or(TaskPriority::Medium),
        );
        task.feature = input.feature;
        task.dependencies = input.dependencies;
        task.metadata = input.metadata;
        tasks.push(task.clone());
        self.persist(&tasks)?;
        Ok(task)
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        fields: StatusFields,
    ) -> Result<(), DroverError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| DroverError::Backend(format!("task {id} not found")))?;
        if !task.status.can_transition_to(status) {
            return Err(DroverError::Backend(format!(
                "invalid transition {} -> {} for task {id}",
                task.status, status
            )));
        }
        task.status = status;
        task.updated_at = chrono::Utc::now();
        if let Some(at) = fields.started_at {
            task.started_at = Some(at);
        }
        if let Some(at) = fields.completed_at {
            task.completed_at = Some(at);
        }
        self.persist(&tasks)
    }
}
