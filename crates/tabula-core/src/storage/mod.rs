//! Dataset access
//!
//! SQLite is the bundled execution capability. Other engines plug in through
//! [`QueryExecutor`](crate::capability::QueryExecutor).

pub mod schema;
pub mod sqlite;

pub use schema::{ColumnInfo, DatasetSchema, TableInfo};
pub use sqlite::SqliteExecutor;
