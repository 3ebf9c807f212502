use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use askdb_guard::{guard, GuardOptions, SchemaCatalog};
use askdb_types::{ToolResult, ToolSchema};
use askdb_warehouse::QueryBackend;

use crate::cache::{cache_key, QueryCache};
use crate::format::{format_failure, format_rejection, format_rows, format_timeout};
use crate::{Tool, ToolContext};

pub const EXECUTE_SQL: &str = "execute_sql";
pub const DESCRIBE_SCHEMA: &str = "describe_schema";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecuteSqlArgs {
    query: String,
}

/// Guard, then run, then format one model-authored query.
pub struct ExecuteSqlTool {
    catalog: Arc<SchemaCatalog>,
    backend: Arc<dyn QueryBackend>,
    cache: Arc<dyn QueryCache>,
    max_rows: u64,
    query_timeout: Duration,
}

impl ExecuteSqlTool {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        backend: Arc<dyn QueryBackend>,
        cache: Arc<dyn QueryCache>,
        max_rows: u64,
        query_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            backend,
            cache,
            max_rows,
            query_timeout,
        }
    }
}

#[async_trait]
impl Tool for ExecuteSqlTool {
    fn schema(&self) -> ToolSchema {
        let tables = self.catalog.table_names().join(", ");
        ToolSchema {
            name: EXECUTE_SQL.to_string(),
            description: format!(
                "Run one read-only SELECT statement against the workspace data. \
                 Available tables: {tables}. Results are limited to {} rows.",
                self.max_rows
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "A single SELECT statement (CTEs allowed)."
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let args: ExecuteSqlArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(err) => {
                return Ok(ToolResult::text(format!(
                    "Invalid arguments for {EXECUTE_SQL}: {err}"
                )))
            }
        };

        let options = GuardOptions::new(ctx.tenant_id.as_str(), self.max_rows)
            .with_backslash_escapes(self.backend.escapes_backslashes());
        let guarded = match guard(&args.query, &options, &self.catalog) {
            Ok(guarded) => guarded,
            Err(violation) => {
                return Ok(ToolResult {
                    output: format_rejection(violation.code(), &violation.to_string()),
                    metadata: json!({"status": "rejected", "code": violation.code()}),
                })
            }
        };

        let key = cache_key(&ctx.tenant_id, &guarded.sql);
        if let Some(rows) = self.cache.get(&key).await {
            tracing::debug!(tenant_id = %ctx.tenant_id, "query cache hit");
            return Ok(ToolResult {
                output: format_rows(&rows),
                metadata: json!({
                    "status": "ok",
                    "cached": true,
                    "row_count": rows.len(),
                    "guard": guarded,
                }),
            });
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.query_timeout, self.backend.run(&guarded.sql)) => outcome,
            _ = ctx.cancel.cancelled() => {
                return Ok(ToolResult {
                    output: "Query cancelled.".to_string(),
                    metadata: json!({"status": "cancelled"}),
                });
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Err(_) => {
                tracing::warn!(
                    tenant_id = %ctx.tenant_id,
                    backend = self.backend.name(),
                    timeout_ms = self.query_timeout.as_millis() as u64,
                    "query timed out"
                );
                Ok(ToolResult {
                    output: format_timeout(self.query_timeout.as_millis()),
                    metadata: json!({"status": "timeout", "duration_ms": duration_ms}),
                })
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    tenant_id = %ctx.tenant_id,
                    backend = self.backend.name(),
                    error = %err,
                    "query failed"
                );
                Ok(ToolResult {
                    output: format_failure(&err.to_string()),
                    metadata: json!({"status": "failed", "duration_ms": duration_ms}),
                })
            }
            Ok(Ok(rows)) => {
                let output = format_rows(&rows);
                let row_count = rows.len();
                self.cache.put(&key, rows).await;
                Ok(ToolResult {
                    output,
                    metadata: json!({
                        "status": "ok",
                        "cached": false,
                        "row_count": row_count,
                        "duration_ms": duration_ms,
                        "guard": guarded,
                    }),
                })
            }
        }
    }
}

/// Lists tables and columns. The tenant column is never shown.
pub struct DescribeSchemaTool {
    catalog: Arc<SchemaCatalog>,
}

impl DescribeSchemaTool {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for DescribeSchemaTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: DESCRIBE_SCHEMA.to_string(),
            description: "List the queryable tables and their columns.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let mut listing = serde_json::Map::new();
        for (table, columns) in self.catalog.describe() {
            listing.insert(table.to_string(), json!(columns));
        }
        Ok(ToolResult::text(serde_json::to_string_pretty(&listing)?))
    }
}
