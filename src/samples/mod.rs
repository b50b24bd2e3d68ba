pub mod loader;
pub mod shard;
pub mod source;
pub mod types;

pub use loader::{ShardError, ShardLoader};
pub use shard::{ShardName, ShardWriter};
pub use source::SampleSource;
pub use types::{Sample, SampleSeries, ShardLoad, SnapshotRecord};
