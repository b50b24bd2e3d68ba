pub mod config;
pub mod operations;
pub mod processor;

pub use config::BackupConfig;
pub use operations::{BackupSummary, IntegrityStatus, RestoreReport};
pub use processor::{BackupProcessorInput, BackupProcessorOutput, StartupReport};
