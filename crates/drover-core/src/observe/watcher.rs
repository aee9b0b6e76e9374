//! State-file watcher.
//!
//! Watches the checkpoint directory and per-namespace state files and
//! feeds change events into the [`Observer`] stream, so dashboards see
//! writes made by other processes (a second loop, an operator edit) the
//! same way they see in-process hook events. notify runs its own thread;
//! dropping the watcher stops it.

use std::path::PathBuf;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::Observer;

pub struct StateFileWatcher {
    _watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
}

impl StateFileWatcher {
    /// Watch the given files/directories. Paths that do not exist yet are
    /// covered by watching their parent directory.
    pub fn start(paths: Vec<PathBuf>, observer: Observer) -> notify::Result<Self> {
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        for path in &event.paths {
                            observer.record_file_change(path);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "state-file watcher error");
                }
            })?;

        let mut watched = Vec::new();
        for path in paths {
            let (target, mode) = if path.is_dir() {
                (path.clone(), RecursiveMode::Recursive)
            } else if path.exists() {
                (path.clone(), RecursiveMode::NonRecursive)
            } else if let Some(parent) = path.parent().filter(|p| p.exists()) {
                (parent.to_path_buf(), RecursiveMode::NonRecursive)
            } else {
                tracing::debug!(path = %path.display(), "skipping unwatchable path");
                continue;
            };
            match watcher.watch(&target, mode) {
                Ok(()) => {
                    if !watched.contains(&target) {
                        watched.push(target);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %target.display(), error = %e, "failed to watch path");
                }
            }
        }

        Ok(Self {
            _watcher: watcher,
            watched,
        })
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched
    }
}

impl std::fmt::Debug for StateFileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateFileWatcher")
            .field("watched", &self.watched)
            .finish()
    }
}
