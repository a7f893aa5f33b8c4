pub mod blackout;
pub mod error;
pub mod pacing;
pub mod queue;
pub mod receipts;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod validation;

pub use error::ScheduleError;
pub use scheduler::{BatchOutcome, BatchScheduler, SchedulingPolicy};
