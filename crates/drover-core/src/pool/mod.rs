//! Worker pools: named concurrency buckets with niceness and memory caps.
//!
//! A pool admits at most `size` concurrent slots. Overflow acquires queue
//! FIFO (bounded) and are woken one at a time as slots release. Slot
//! handles are RAII: dropping a [`SlotGuard`] releases the slot even on
//! cancellation. Spawned PIDs are tracked separately so the resource
//! monitor can police per-pool memory ceilings.

pub mod memory;
pub mod monitor;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::DroverError;
use crate::task::TaskPriority;

pub const DEFAULT_POOL: &str = "medium";

/// Configuration of one named pool.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrent slots.
    pub size: usize,
    /// Unix niceness applied to processes spawned under this pool.
    #[serde(default)]
    pub nice: i32,
    /// Resident-memory ceiling per process, policed by the monitor.
    pub memory_limit_mb: u64,
    /// Bound on the FIFO waiter queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    64
}

/// The stock pool set: high(2), medium(5), low(2), background(1).
pub fn default_pools() -> HashMap<String, PoolConfig> {
    let mut pools = HashMap::new();
    pools.insert(
        "high".to_string(),
        PoolConfig { size: 2, nice: 0, memory_limit_mb: 2048, queue_capacity: 64 },
    );
    pools.insert(
        "medium".to_string(),
        PoolConfig { size: 5, nice: 5, memory_limit_mb: 1024, queue_capacity: 64 },
    );
    pools.insert(
        "low".to_string(),
        PoolConfig { size: 2, nice: 10, memory_limit_mb: 512, queue_capacity: 64 },
    );
    pools.insert(
        "background".to_string(),
        PoolConfig { size: 1, nice: 15, memory_limit_mb: 256, queue_capacity: 64 },
    );
    pools
}

#[derive(Debug)]
struct ActiveSlot {
    task_id: Option<String>,
    acquired_at: Instant,
    pid: Option<u32>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    task_id: Option<String>,
    tx: oneshot::Sender<u64>,
}

#[derive(Default, Debug)]
struct PoolState {
    active: HashMap<u64, ActiveSlot>,
    waiters: VecDeque<Waiter>,
    shutdown: bool,
}

#[derive(Debug)]
struct PoolInner {
    name: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Remove a slot and hand it to the first live waiter, if any.
    fn release(self: &Arc<Self>, slot_id: u64, ids: &AtomicU64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Releasing a slot that is not active is a no-op.
        if state.active.remove(&slot_id).is_none() {
            return;
        }
        // Wake at most one waiter. The slot is inserted on the waiter's
        // behalf before the wake so the pool bound holds at every instant.
        while let Some(waiter) = state.waiters.pop_front() {
            let new_id = ids.fetch_add(1, Ordering::Relaxed);
            state.active.insert(
                new_id,
                ActiveSlot {
                    task_id: waiter.task_id.clone(),
                    acquired_at: Instant::now(),
                    pid: None,
                },
            );
            if waiter.tx.send(new_id).is_ok() {
                return;
            }
            // Waiter gave up (timed out); undo and try the next one.
            state.active.remove(&new_id);
        }
    }
}

/// RAII slot handle. Dropping it releases the slot and wakes a waiter.
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<PoolInner>,
    slot_id: u64,
    ids: Arc<AtomicU64>,
}

impl SlotGuard {
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Associate the spawned process with this slot.
    pub fn set_pid(&self, pid: u32) {
        let mut state = self.pool.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = state.active.get_mut(&self.slot_id) {
            slot.pid = Some(pid);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(self.slot_id, &self.ids);
    }
}

struct TrackedProcess {
    pool: String,
    task_id: Option<String>,
    over_limit_since: Option<Instant>,
}

type TerminateHandler = Arc<dyn Fn(u32, String) + Send + Sync>;

/// Owner of all pools plus the tracked-PID table the monitor reads.
pub struct WorkerPoolManager {
    pools: HashMap<String, Arc<PoolInner>>,
    default_pool: String,
    acquire_timeout: Option<Duration>,
    ids: Arc<AtomicU64>,
    tracked: Mutex<HashMap<u32, TrackedProcess>>,
    terminate_handler: RwLock<Option<TerminateHandler>>,
}

impl WorkerPoolManager {
    pub fn new(
        configs: HashMap<String, PoolConfig>,
        acquire_timeout: Option<Duration>,
    ) -> Result<Self, DroverError> {
        if configs.is_empty() {
            return Err(DroverError::ConfigInvalid {
                reason: "at least one worker pool is required".to_string(),
            });
        }
        for (name, config) in &configs {
            if config.size == 0 {
                return Err(DroverError::ConfigInvalid {
                    reason: format!("pool '{name}' must have size >= 1"),
                });
            }
        }
        let default_pool = if configs.contains_key(DEFAULT_POOL) {
            DEFAULT_POOL.to_string()
        } else {
            // Deterministic fallback when the stock "medium" pool is absent.
            let mut names: Vec<&String> = configs.keys().collect();
            names.sort();
            names[0].clone()
        };
        let pools = configs
            .into_iter()
            .map(|(name, config)| {
                let inner = Arc::new(PoolInner {
                    name: name.clone(),
                    config,
                    state: Mutex::new(PoolState::default()),
                });
                (name, inner)
            })
            .collect();
        Ok(Self {
            pools,
            default_pool,
            acquire_timeout,
            ids: Arc::new(AtomicU64::new(1)),
            tracked: Mutex::new(HashMap::new()),
            terminate_handler: RwLock::new(None),
        })
    }

    pub fn with_defaults() -> Self {
        // default_pools() is non-empty with positive sizes.
        Self::new(default_pools(), None).unwrap_or_else(|_| unreachable!())
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn has_pool(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    /// Pick a pool for a task: its feature tag when a pool of that name
    /// exists, otherwise by priority (critical/high run in "high", low in
    /// "low", everything else in the default pool).
    pub fn pool_for_task(&self, feature: Option<&str>, priority: Option<TaskPriority>) -> String {
        if let Some(feature) = feature {
            if self.has_pool(feature) {
                return feature.to_string();
            }
        }
        let by_priority = match priority {
            Some(TaskPriority::Critical) | Some(TaskPriority::High) => "high",
            Some(TaskPriority::Low) => "low",
            _ => self.default_pool.as_str(),
        };
        if self.has_pool(by_priority) {
            by_priority.to_string()
        } else {
            self.default_pool.clone()
        }
    }

    fn pool(&self, name: &str) -> Arc<PoolInner> {
        self.pools
            .get(name)
            .or_else(|| self.pools.get(&self.default_pool))
            .cloned()
            // new() guarantees the default pool exists.
            .unwrap_or_else(|| unreachable!())
    }

    pub fn nice_for(&self, name: &str) -> i32 {
        self.pool(name).config.nice
    }

    pub fn memory_limit_mb(&self, name: &str) -> u64 {
        self.pool(name).config.memory_limit_mb
    }

    pub fn active_count(&self, name: &str) -> usize {
        let pool = self.pool(name);
        let state = pool.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.len()
    }

    pub fn waiting_count(&self, name: &str) -> usize {
        let pool = self.pool(name);
        let state = pool.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiters.len()
    }

    /// Acquire a slot in `pool_name`, suspending FIFO when the pool is
    /// full. Fails with [`DroverError::PoolSlotTimeout`] when a configured
    /// acquire timeout elapses or the waiter queue is at capacity.
    pub async fn acquire(
        &self,
        pool_name: &str,
        task_id: Option<String>,
    ) -> Result<SlotGuard, DroverError> {
        let pool = self.pool(pool_name);

        let (waiter_id, mut rx) = {
            let mut state = pool.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.shutdown {
                return Err(DroverError::Cancelled(format!(
                    "pool '{}' is shutting down",
                    pool.name
                )));
            }
            if state.active.len() < pool.config.size {
                let slot_id = self.ids.fetch_add(1, Ordering::Relaxed);
                state.active.insert(
                    slot_id,
                    ActiveSlot {
                        task_id,
                        acquired_at: Instant::now(),
                        pid: None,
                    },
                );
                return Ok(SlotGuard {
                    pool: Arc::clone(&pool),
                    slot_id,
                    ids: Arc::clone(&self.ids),
                });
            }
            if state.waiters.len() >= pool.config.queue_capacity {
                return Err(DroverError::PoolSlotTimeout {
                    pool: pool.name.clone(),
                    reason: format!(
                        "waiter queue is at capacity ({})",
                        pool.config.queue_capacity
                    ),
                });
            }
            let (tx, rx) = oneshot::channel();
            let waiter_id = self.ids.fetch_add(1, Ordering::Relaxed);
            state.waiters.push_back(Waiter {
                id: waiter_id,
                task_id,
                tx,
            });
            (waiter_id, rx)
        };

        let timeout = self.acquire_timeout;
        let slot_id = match timeout {
            None => rx.await.map_err(|_| {
                DroverError::Cancelled(format!("pool '{}' is shutting down", pool.name))
            })?,
            Some(window) => {
                tokio::select! {
                    granted = &mut rx => granted.map_err(|_| {
                        DroverError::Cancelled(format!("pool '{}' is shutting down", pool.name))
                    })?,
                    _ = tokio::time::sleep(window) => {
                        let mut state = pool.state.lock().unwrap_or_else(|e| e.into_inner());
                        let still_queued = state.waiters.iter().any(|w| w.id == waiter_id);
                        if still_queued {
                            state.waiters.retain(|w| w.id != waiter_id);
                            return Err(DroverError::PoolSlotTimeout {
                                pool: pool.name.clone(),
                                reason: format!("no slot within {}ms", window.as_millis()),
                            });
                        }
                        drop(state);
                        // A grant raced the timeout; give the slot back.
                        if let Ok(slot_id) = rx.try_recv() {
                            pool.release(slot_id, &self.ids);
                        }
                        return Err(DroverError::PoolSlotTimeout {
                            pool: pool.name.clone(),
                            reason: format!("no slot within {}ms", window.as_millis()),
                        });
                    }
                }
            }
        };

        Ok(SlotGuard {
            pool,
            slot_id,
            ids: Arc::clone(&self.ids),
        })
    }

    /// Register a spawned process for resource monitoring.
    pub fn track_process(&self, pid: u32, pool_name: &str, task_id: Option<String>) {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        tracked.insert(
            pid,
            TrackedProcess {
                pool: pool_name.to_string(),
                task_id,
                over_limit_since: None,
            },
        );
    }

    pub fn untrack_process(&self, pid: u32) {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        tracked.remove(&pid);
    }

    /// `(pid, pool)` pairs currently under watch.
    pub fn tracked_snapshot(&self) -> Vec<(u32, String)> {
        let tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        tracked.iter().map(|(pid, t)| (*pid, t.pool.clone())).collect()
    }

    /// Callback invoked when a process must die for exceeding its budget.
    pub fn set_terminate_handler(&self, handler: TerminateHandler) {
        let mut slot = self.terminate_handler.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    /// Note an over-limit observation. Once a process has been over its
    /// ceiling for longer than `grace`, it is untracked and the terminate
    /// handler fires with a human-readable reason.
    pub(crate) fn note_over_limit(&self, pid: u32, rss_mb: u64, limit_mb: u64, grace: Duration) {
        let fire = {
            let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
            match tracked.get_mut(&pid) {
                None => None,
                Some(entry) => {
                    let since = *entry.over_limit_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= grace {
                        let task = entry.task_id.clone();
                        tracked.remove(&pid);
                        Some((
                            format!(
                                "resident memory {rss_mb} MiB exceeded the {limit_mb} MiB limit"
                            ),
                            task,
                        ))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some((reason, task_id)) = fire {
            tracing::warn!(pid, task_id = ?task_id, %reason, "terminating process over memory budget");
            let handler = {
                let guard = self.terminate_handler.read().unwrap_or_else(|e| e.into_inner());
                guard.clone()
            };
            if let Some(handler) = handler {
                handler(pid, reason);
            }
        }
    }

    pub(crate) fn clear_over_limit(&self, pid: u32) {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = tracked.get_mut(&pid) {
            entry.over_limit_since = None;
        }
    }

    /// Untrack every PID and fail all waiters with a cancellation error.
    pub fn shutdown(&self) {
        {
            let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
            tracked.clear();
        }
        for pool in self.pools.values() {
            let mut state = pool.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutdown = true;
            state.active.clear();
            // Dropping the senders fails every queued receiver.
            state.waiters.clear();
        }
    }
}

impl std::fmt::Debug for WorkerPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.pools.keys().collect();
        names.sort();
        f.debug_struct("WorkerPoolManager")
            .field("pools", &names)
            .field("default_pool", &self.default_pool)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}
