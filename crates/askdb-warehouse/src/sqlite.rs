use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use askdb_types::Row;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde_json::{Number, Value};
use tokio::sync::Mutex;

use crate::{QueryBackend, WarehouseResult};

const DEMO_FIXTURES: &str = include_str!("../fixtures/demo.sql");

/// SQLite-backed warehouse. Used for local runs and tests.
///
/// The connection is switched to `query_only` once seeded, so a statement that
/// slipped past validation still cannot write.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteBackend {
    /// In-memory database seeded with the demo workspace.
    pub fn demo() -> WarehouseResult<Self> {
        Self::from_script(DEMO_FIXTURES)
    }

    pub fn from_script(script: &str) -> WarehouseResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(script)?;
        Self::finish(conn)
    }

    pub async fn from_script_file(path: &Path) -> WarehouseResult<Self> {
        let script = tokio::fs::read_to_string(path).await?;
        Self::from_script(&script)
    }

    pub fn open_read_only(path: &Path) -> WarehouseResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::finish(conn)
    }

    fn finish(conn: Connection) -> WarehouseResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "query_only", true)?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }
}

#[async_trait]
impl QueryBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn run(&self, sql: &str) -> WarehouseResult<Vec<Row>> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        // Armed only once we hold the connection, so an abandoned call
        // interrupts its own statement and nobody else's.
        let mut interrupt = InterruptOnDrop {
            handle: Arc::clone(&self.interrupt),
            armed: true,
        };
        let sql = sql.to_string();
        let rows = tokio::task::spawn_blocking(move || query_rows(&conn, &sql)).await??;
        interrupt.armed = false;
        Ok(rows)
    }
}

struct InterruptOnDrop {
    handle: Arc<InterruptHandle>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("interrupting abandoned sqlite statement");
            self.handle.interrupt();
        }
    }
}

fn query_rows(conn: &Connection, sql: &str) -> WarehouseResult<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            record.insert(column.clone(), json_value(row.get_ref(idx)?));
        }
        out.push(record);
    }
    Ok(out)
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::from(n),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn demo_fixtures_are_queryable() {
        let backend = SqliteBackend::demo().expect("demo db");
        let rows = backend
            .run("SELECT name, budget FROM projects WHERE projects.org_id = 'acme' ORDER BY id LIMIT 2")
            .await
            .expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("Warehouse Migration"));
        assert_eq!(rows[0]["budget"], json!(48000.0));
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, vec!["name", "budget"]);
    }

    #[tokio::test]
    async fn nulls_and_integers_map_to_json() {
        let backend = SqliteBackend::demo().expect("demo db");
        let rows = backend
            .run("SELECT id, assignee_id FROM tasks WHERE id = 7")
            .await
            .expect("rows");
        assert_eq!(rows[0]["id"], json!(7));
        assert_eq!(rows[0]["assignee_id"], Value::Null);
    }

    #[tokio::test]
    async fn writes_are_refused() {
        let backend = SqliteBackend::demo().expect("demo db");
        let err = backend
            .run("DELETE FROM projects")
            .await
            .expect_err("query_only connection");
        assert!(err.to_string().contains("sqlite"), "{err}");
        let rows = backend
            .run("SELECT count(*) AS n FROM projects")
            .await
            .expect("rows");
        assert_eq!(rows[0]["n"], json!(6));
    }

    #[tokio::test]
    async fn opens_existing_file_read_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warehouse.db");
        {
            let conn = Connection::open(&path).expect("create");
            conn.execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1), (2);")
                .expect("seed");
        }
        let backend = SqliteBackend::open_read_only(&path).expect("open");
        let rows = backend.run("SELECT id FROM t").await.expect("rows");
        assert_eq!(rows.len(), 2);
        assert!(backend.run("INSERT INTO t VALUES (3)").await.is_err());
    }
}
