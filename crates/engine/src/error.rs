use thiserror::Error;

use herald_common::error::AppError;
use herald_common::types::Channel;

use crate::validation::ValidationError;

/// Request-level scheduling failures. Nothing is created when one of these is returned.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("batch is empty")]
    EmptyBatch,

    #[error("batch of {size} messages exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("no provider configured for channel '{channel}'")]
    MissingProviderConfig { channel: Channel },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ScheduleError> for AppError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::EmptyBatch | ScheduleError::BatchTooLarge { .. } => {
                AppError::BatchRejected(err.to_string())
            }
            ScheduleError::MissingProviderConfig { .. } => AppError::Config(err.to_string()),
            ScheduleError::Invalid(e) => AppError::Validation(e.to_string()),
            ScheduleError::Internal(e) => AppError::Internal(e.to_string()),
        }
    }
}
