//! Read-only execution backends for guarded SQL.

mod clickhouse;
mod error;
mod sqlite;

use askdb_types::Row;
use async_trait::async_trait;

pub use clickhouse::{ClickHouseBackend, ClickHouseConfig};
pub use error::{WarehouseError, WarehouseResult};
pub use sqlite::SqliteBackend;

/// Executes already-guarded SQL and returns rows as JSON objects.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether string literals and quoted identifiers for this backend treat
    /// `\` as an escape.
    fn escapes_backslashes(&self) -> bool {
        false
    }

    async fn run(&self, sql: &str) -> WarehouseResult<Vec<Row>>;
}
