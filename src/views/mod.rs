pub mod publisher;
pub mod types;

pub use publisher::{publish_index, publish_view, IndexDocument, PublishReport, INDEX_KEY};
pub use types::{Cadence, RotationPolicy, ViewSpec, ViewWindow};
