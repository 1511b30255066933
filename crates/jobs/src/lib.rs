mod jobs;
pub mod scheduler;

pub use jobs::RebuildPipeline;
pub use scheduler::{Job, RunHandle, Scheduler};
