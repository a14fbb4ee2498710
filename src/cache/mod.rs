//! Read cache: a second append-only ring holding copies of cold records.

mod read_cache;
mod stats;

pub use read_cache::ReadCache;
pub use stats::{ReadCacheStats, ReadCacheStatsSummary};
