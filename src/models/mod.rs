pub mod config;
pub mod execution;

pub use config::DaemonConfig;
pub use execution::{Execution, ExecutionStatus};
