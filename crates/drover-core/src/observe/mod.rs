//! Observability surface.
//!
//! The [`Observer`] subscribes to the hook bus, maintains an in-memory
//! projection of loop state plus a bounded ring of recent events, and
//! re-broadcasts everything as serialized [`EventFrame`]s for the SSE
//! endpoint. A file watcher feeds cross-process state-file changes into
//! the same stream so dashboards see updates regardless of which process
//! wrote them.

pub mod server;
pub mod watcher;

pub use server::{build_router, run_server, ServerState};
pub use watcher::StateFileWatcher;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::hooks::{HookBus, HookEvent, HookHandlers};

/// One event as seen by stream consumers.
#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    pub seq: u64,
    /// Event kind name, e.g. `task_start` or `file_change`.
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentTask {
    pub id: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
}

/// Read-model of the loop, updated from hook events.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectedState {
    pub namespace: Option<String>,
    pub iteration: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub loop_running: bool,
    pub current_task: Option<CurrentTask>,
    pub last_event_at: Option<DateTime<Utc>>,
}

struct ObserverInner {
    seq: AtomicU64,
    ring_capacity: usize,
    ring: Mutex<VecDeque<EventFrame>>,
    state: RwLock<ProjectedState>,
    tx: broadcast::Sender<EventFrame>,
}

/// Shared handle; clones observe the same projection and stream.
#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

impl Observer {
    pub fn new(ring_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ObserverInner {
                seq: AtomicU64::new(0),
                ring_capacity,
                ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
                state: RwLock::new(ProjectedState::default()),
                tx,
            }),
        }
    }

    /// Register on the bus as a catch-all plugin.
    pub fn install(&self, bus: &HookBus) {
        let observer = self.clone();
        bus.register(
            "observer",
            HookHandlers::new().any(move |event| {
                observer.record_hook(event);
                Ok(())
            }),
        );
    }

    /// Project one hook event and push it onto the stream.
    pub fn record_hook(&self, event: &HookEvent) {
        self.project(event);
        let payload = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        self.push_frame(event.kind().as_str().to_string(), payload);
    }

    /// Rebroadcast a state-file change noticed by the watcher.
    pub fn record_file_change(&self, path: &Path) {
        self.push_frame(
            "file_change".to_string(),
            serde_json::json!({ "path": path.display().to_string() }),
        );
    }

    fn project(&self, event: &HookEvent) {
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        state.last_event_at = Some(Utc::now());
        match event {
            HookEvent::LoopStart { namespace, iteration } => {
                state.namespace = Some(namespace.clone());
                state.iteration = *iteration;
                state.loop_running = true;
            }
            HookEvent::TaskStart { task_id, title, .. } => {
                state.current_task = Some(CurrentTask {
                    id: task_id.clone(),
                    title: title.clone(),
                    started_at: Utc::now(),
                });
            }
            HookEvent::TaskComplete { .. } => {
                state.completed += 1;
                state.current_task = None;
            }
            HookEvent::TaskFailed { .. } => {
                state.failed += 1;
                state.current_task = None;
            }
            HookEvent::TaskAbort { .. } => {
                state.current_task = None;
            }
            HookEvent::Step { iteration } => {
                state.iteration = *iteration;
            }
            HookEvent::LoopEnd { iterations, completed, failed } => {
                state.loop_running = false;
                state.iteration = *iterations;
                state.completed = *completed;
                state.failed = *failed;
                state.current_task = None;
            }
            _ => {}
        }
    }

    fn push_frame(&self, kind: String, payload: serde_json::Value) {
        let frame = EventFrame {
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            kind,
            timestamp: Utc::now(),
            payload,
        };
        {
            let mut ring = self.inner.ring.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() == self.inner.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(frame.clone());
        }
        // No subscribers is fine.
        let _ = self.inner.tx.send(frame);
    }

    pub fn recent(&self) -> Vec<EventFrame> {
        let ring = self.inner.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> ProjectedState {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.inner.tx.subscribe()
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("ring_capacity", &self.inner.ring_capacity)
            .finish()
    }
}
