pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::{ConflictPolicy, RemoteConfig, RootPair, SyncConfig};
pub use crate::core::{Direction, SyncEngine, SyncPlan, SyncStats};
pub use crate::error::{ConfigError, SyncError};
