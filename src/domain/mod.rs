//! Domain layer types and invariants.

pub mod entry;
pub mod error;
pub mod keys;
pub mod payload;
pub mod records;
pub mod references;

pub use entry::{CacheEntry, EntryPolicy, EntryStatus};
pub use keys::{CacheKey, KeyScope, QueryParams, ResourceKind};
pub use records::{DurableRecord, ScanFilter};
pub use references::ReferenceTable;
