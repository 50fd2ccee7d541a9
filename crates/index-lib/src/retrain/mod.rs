//! Background retraining: request queue, monitor, and worker pool

mod queue;
mod scheduler;

pub use scheduler::{RetrainingScheduler, RetrainingStats, TrainingDataSource};
