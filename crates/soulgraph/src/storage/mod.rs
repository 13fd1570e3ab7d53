mod adapter;
mod feed;
mod memory;
mod sql_utils;
mod sqlite;

pub use adapter::{GraphAdapter, SyncGraphAdapter};
pub use feed::{ChangeFeed, ChangesetFeed, changelog_entries};
pub use memory::MemoryAdapter;
pub use sqlite::{DbPool, SqliteAdapter, SqliteTransaction};
