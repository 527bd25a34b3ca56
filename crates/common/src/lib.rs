//! # Tracker Common Crate
//!
//! Shared building blocks for the storage tracker.
//!
//! ## Modules
//! - `ids`: identifier newtypes and day arithmetic
//! - `cid`: content addressing helpers
//! - `cache`: time-windowed in-process cache
//! - `config`: configuration loading

pub mod cache;
pub mod cid;
pub mod config;
pub mod ids;

pub use cache::{Cache, TtlCache};
pub use config::{ConfigError, TrackerConfig};
pub use ids::{
    day_end, day_of, day_start, Day, FileId, NodeId, OwnerId, ParseError, TaskId, Timestamp,
    unix_now, SECS_PER_DAY,
};
