//! `drover serve` -- the observability HTTP/SSE endpoint.
//!
//! Runs standalone: it reads the same task file and state directory a
//! loop writes, and rebroadcasts state-file changes through the watcher,
//! so dashboards work whether or not the loop runs in this process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use drover_core::observe::{run_server, Observer, ServerState, StateFileWatcher};
use drover_core::TaskBackend;
use drover_state::StateLayout;

use crate::backend_file::FileBackend;
use crate::config::ConfigFile;

pub struct ServeArgs {
    pub project_dir: PathBuf,
    pub namespace: String,
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub tasks_file: Option<PathBuf>,
}

pub async fn run(config: ConfigFile, args: ServeArgs) -> Result<()> {
    let layout = StateLayout::new(&args.project_dir, &args.namespace);
    layout.ensure_dirs()?;

    let tasks_path = args
        .tasks_file
        .unwrap_or_else(|| layout.root().join("tasks.json"));
    let backend = Arc::new(
        FileBackend::open(&tasks_path)
            .with_context(|| format!("failed to open task file {}", tasks_path.display()))?,
    );

    let observer = Observer::new(512);
    let _watcher = StateFileWatcher::start(layout.watched_paths(), observer.clone())
        .context("failed to start state-file watcher")?;

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let port = args.port.unwrap_or(config.server.port);

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.cancel();
        }
    });

    run_server(
        ServerState {
            observer,
            backend: backend as Arc<dyn TaskBackend>,
        },
        &bind,
        port,
        cancel,
    )
    .await
}
