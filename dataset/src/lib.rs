//! Columnar dataset model: versioned descriptors, chained datasets,
//! hash-partitioned slices, and the writer that produces them.

pub mod column;
pub mod dataset;
pub mod descriptor;
pub mod id;
pub mod memo;
pub mod value;
pub mod writer;

pub use dataset::{Dataset, NewColumn};
pub use descriptor::{ColumnDescriptor, DatasetDescriptor, Version, CURRENT_VERSION};
pub use id::DatasetId;
pub use value::{ColumnCodec, ColumnTypeRegistry, Value};
pub use writer::DatasetWriter;
