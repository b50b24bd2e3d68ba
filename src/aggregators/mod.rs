pub mod aggregation_block;
pub mod checkpoint;
pub mod config;
pub mod merge;
pub mod processor;
pub mod rolling;
pub mod rotation;
pub mod time_series;

// Re-export commonly used types
pub use aggregation_block::{resample, AggregationBlock, Candle, MovingAverage};
pub use config::AggregatorsConfig;
pub use merge::{merge_views, resolve_prior, PriorView};
pub use processor::{
    AggregationPassArgs, AggregatorsProcessorInput, AggregatorsProcessorOutput, PassSummary,
    RotationCheckArgs,
};
pub use rolling::annotate;
pub use rotation::RotationOutcome;
pub use time_series::Resolution;
