//! Checkpoint store and run locking

pub mod lock;
pub mod store;

pub use lock::{LockInfo, RunLock, LOCK_FILE};
pub use store::{Checkpoint, CheckpointName, CheckpointStore, WEIGHTS_DIR};
