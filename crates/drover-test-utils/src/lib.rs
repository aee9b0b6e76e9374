//! Shared test fixtures for drover crates.
//!
//! Provides an in-memory [`TaskBackend`] with the same readiness
//! semantics as real backends, and helpers that fabricate agent CLIs as
//! executable shell scripts so engine and loop tests can run without any
//! real agent installed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use drover_core::backend::{is_ready, NewTask, StatusFields, TaskBackend};
use drover_core::error::DroverError;
use drover_core::task::{Task, TaskPriority, TaskStatus};

/// In-memory task backend. Ready tasks are served by priority rank, then
/// insertion order.
#[derive(Default)]
pub struct MemoryBackend {
    tasks: Mutex<Vec<Task>>,
    /// When set, every call fails; simulates a flaky backend.
    fail: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a task with an explicit id.
    pub fn add_task(&self, task: Task) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(task);
    }

    /// Make every backend call fail with the given message.
    pub fn set_failing(&self, message: Option<&str>) {
        *self.fail.lock().unwrap() = message.map(str::to_string);
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.status)
    }

    fn check_fail(&self) -> Result<(), DroverError> {
        match self.fail.lock().unwrap().as_ref() {
            Some(message) => Err(DroverError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TaskBackend for MemoryBackend {
    async fn find_next_task(&self) -> Result<Option<Task>, DroverError> {
        self.check_fail()?;
        let tasks = self.tasks.lock().unwrap();
        let mut ready: Vec<(usize, &Task)> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| is_ready(t, &tasks))
            .collect();
        ready.sort_by_key(|(index, t)| (t.priority.rank(), *index));
        Ok(ready.first().map(|(_, t)| (*t).clone()))
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DroverError> {
        self.check_fail()?;
        Ok(self.tasks.lock().unwrap().iter().find(|t| t.id == id).cloned())
    }

    async fn list_pending_tasks(&self) -> Result<Vec<Task>, DroverError> {
        self.check_fail()?;
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn list_completed_tasks(&self) -> Result<Vec<Task>, DroverError> {
        self.check_fail()?;
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .cloned()
            .collect())
    }

    async fn list_failed_tasks(&self) -> Result<Vec<Task>, DroverError> {
        self.check_fail()?;
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect())
    }

    async fn create_task(&self, input: NewTask) -> Result<Task, DroverError> {
        self.check_fail()?;
        let mut tasks = self.tasks.lock().unwrap();
        let id = format!("task-{}", tasks.len() + 1);
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
        Ok(task)
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        fields: StatusFields,
    ) -> Result<(), DroverError> {
        self.check_fail()?;
        let mut tasks = self.tasks.lock().unwrap();
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
        Ok(())
    }
}

/// Build a pending task with dependencies and metadata in one line.
pub fn pending_task(id: &str, priority: TaskPriority, deps: &[&str]) -> Task {
    let mut task = Task::new(id, format!("task {id}"), format!("work on {id}"), priority);
    task.dependencies = deps.iter().map(|s| s.to_string()).collect();
    task
}

/// Write an executable shell script posing as an agent CLI.
pub fn fake_cli(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake CLI script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake CLI script");
    }
    path
}

/// A fake CLI that appends its argv (one line per invocation) to
/// `record_file`, prints `stdout`, and exits with `exit_code`.
pub fn recording_cli(
    dir: &Path,
    name: &str,
    record_file: &Path,
    stdout: &str,
    exit_code: i32,
) -> PathBuf {
    let body = format!(
        "echo \"$@\" >> {record}\nprintf '%s' '{stdout}'\nexit {exit_code}",
        record = record_file.display(),
    );
    fake_cli(dir, name, &body)
}

/// A fake CLI whose behavior depends on how many times it has been
/// invoked: `first` on the first call, `rest` afterwards. A counter file
/// in `dir` keeps the invocation count.
pub fn sequenced_cli(dir: &Path, name: &str, first: &str, rest: &str) -> PathBuf {
    let counter = dir.join(format!(".{name}.count"));
    let body = format!(
        "count=$(cat {counter} 2>/dev/null || echo 0)\n\
         count=$((count + 1))\n\
         echo $count > {counter}\n\
         if [ \"$count\" -eq 1 ]; then\n{first}\nelse\n{rest}\nfi",
        counter = counter.display(),
    );
    fake_cli(dir, name, &body)
}

/// Model-string -> alias map helper for invoker tests.
pub fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
