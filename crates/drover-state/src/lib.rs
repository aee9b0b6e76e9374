//! Persisted state for drover task loops.
//!
//! Everything under the hidden `.drover/` project directory lives here:
//! per-namespace loop state, checksummed checkpoints, the monitor registry
//! of live loops, per-run log paths, and the optional wisdom store of
//! learned error patterns. All writes go through [`atomic::write_atomic`]
//! (temp file + rename) so readers in other processes never observe a
//! partial file.

pub mod atomic;
pub mod checkpoint;
pub mod layout;
pub mod loop_state;
pub mod monitor;
pub mod wisdom;

pub use atomic::write_atomic;
pub use checkpoint::{Checkpoint, CheckpointStore, SelectorCursor};
pub use layout::StateLayout;
pub use loop_state::{LoopMetrics, LoopState, LoopStateStore};
pub use monitor::{MonitorEntry, MonitorStateStore};
pub use wisdom::{WisdomEntry, WisdomStore};
