//! PackDB Storage Core
//!
//! Embedded columnar storage:
//! - Fixed-capacity packs of typed column blocks with per-pack zone maps
//! - A pk-ordered pack directory used for placement and iteration
//! - A write journal with tombstones, merged into packs by flush
//! - AND/OR condition trees with zone-map pruning and exact bitmaps
//! - Forward, reverse and lookup iterators with journal overlay
//! - Compaction and secondary indexes
//!
//! Persistence goes through [`Store`], a bucketed transactional wrapper
//! around sled.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bitset;
pub mod block;
pub mod cache;
pub mod codec;
pub mod condition;
pub mod index;
pub mod info;
pub mod journal;
pub mod package;
pub mod packindex;
pub mod query;
pub mod result;
pub mod store;
pub mod tree;

mod iterator;
mod table;

pub use condition::{Condition, FilterMode};
pub use iterator::ScanStats;
pub use query::{Query, SortOrder};
pub use result::{QueryResult, StreamAction};
pub use store::{Store, Tx};
pub use table::{Table, TableStats, TableStatsSnapshot};
pub use tree::{ConditionTree, ConditionTreeNode};

pub use tokio_util::sync::CancellationToken;
