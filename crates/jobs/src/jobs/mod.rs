mod rebuild;

pub use rebuild::RebuildPipeline;
