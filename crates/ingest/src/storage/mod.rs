//! Storage traits and implementations
//!
//! Watermarks and report rows sit behind traits so the orchestrator and
//! save handler can run against SQLite in production and memory in tests.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{ReportStore, WatermarkStore};
