//! sbs-core: BaseStation decoding and live per-aircraft aggregation.
//!
//! No async, no network: decoding, merge rules, the aggregate cache and
//! the storage trait. `sbs-server` wires these to a TCP feed, SQLite and HTTP.

pub mod cache;
pub mod config;
pub mod plane;
pub mod sbs;
pub mod store;
pub mod types;

// Re-export commonly used types at crate root
pub use cache::{persist, AggregateCache};
pub use plane::{PlaneAggregate, PlaneDetail, PlaneSummary};
pub use sbs::{decode_line, DecodeError};
pub use store::{MemoryStore, PlaneStore, StoreError, StoreResult};
pub use types::*;
