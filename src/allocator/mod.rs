//! Hybrid log allocator: the authoritative record ring.

mod hybrid_log;

pub use hybrid_log::{HybridLog, HybridLogConfig, PageSpan};
