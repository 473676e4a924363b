pub mod config;
pub mod constants;
pub mod db;
pub mod errors;
pub mod operation_tracker;
pub mod retention;
pub mod scheduler;
pub mod snapshot;

// Re-export commonly used types
pub use config::{Config, ConfigManager, NetworkConfig};
pub use db::{Database, DatabaseEngine, FileStore, FileStoreEngine};
pub use errors::SnapshotError;
pub use operation_tracker::OperationTracker;
pub use retention::{CleanupConfig, CleanupResult};
pub use scheduler::SnapshotScheduler;
pub use snapshot::{EngineConfig, SnapshotManager, SnapshotReport};
