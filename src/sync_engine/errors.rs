//! Failure classes that decide how the process terminates.

use thiserror::Error;

/// Errors that end a sync run.
///
/// They travel inside `anyhow::Error` chains and are recovered with
/// `downcast_ref` at the top level to pick the exit code.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unrecoverable storage failure: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_) => 2,
            SyncError::Auth(_) => 3,
            SyncError::Storage(_) => 4,
        }
    }
}

/// Maps any error coming out of a run to a process exit code.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SyncError>())
        .map(SyncError::exit_code)
        .unwrap_or(1)
}
