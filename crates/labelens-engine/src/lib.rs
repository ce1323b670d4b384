pub mod config;
pub mod intent;
pub mod pipeline;
pub mod providers;
pub mod research;
pub mod retry;
pub mod throttle;
pub mod ui;
pub mod vision;

pub use config::EngineConfig;
pub use pipeline::{PipelineState, ScanPipeline, StageContext};
