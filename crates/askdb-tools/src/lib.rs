use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use askdb_guard::SchemaCatalog;
use askdb_types::{ToolResult, ToolSchema};
use askdb_warehouse::QueryBackend;

pub mod cache;
pub mod format;
mod sql;

pub use cache::{cache_key, NoopCache, QueryCache, TtlLruCache};
pub use sql::{DescribeSchemaTool, ExecuteSqlTool, DESCRIBE_SCHEMA, EXECUTE_SQL};

/// Per-request facts every tool call runs under.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tenant_id: String,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult>;
}

#[derive(Debug, Clone)]
pub struct SqlToolSettings {
    pub max_rows: u64,
    pub query_timeout: Duration,
}

impl Default for SqlToolSettings {
    fn default() -> Self {
        Self {
            max_rows: 100,
            query_timeout: Duration::from_millis(15_000),
        }
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for tool in tools {
            map.insert(tool.schema().name, tool);
        }
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    /// `execute_sql` and `describe_schema` over one backend.
    pub fn sql_tools(
        catalog: Arc<SchemaCatalog>,
        backend: Arc<dyn QueryBackend>,
        cache: Arc<dyn QueryCache>,
        settings: SqlToolSettings,
    ) -> Self {
        Self::new(vec![
            Arc::new(ExecuteSqlTool::new(
                catalog.clone(),
                backend,
                cache,
                settings.max_rows,
                settings.query_timeout,
            )),
            Arc::new(DescribeSchemaTool::new(catalog)),
        ])
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Runs `name` with the raw argument text the model produced. Unknown
    /// tools and malformed arguments come back as tool output, not errors.
    pub async fn execute(
        &self,
        name: &str,
        raw_args: &str,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolResult> {
        let tool = self.tools.read().await.get(name).cloned();
        let Some(tool) = tool else {
            return Ok(ToolResult::text(format!("Unknown tool: {name}")));
        };
        let args = match parse_tool_args(raw_args) {
            Ok(args) => args,
            Err(reason) => {
                return Ok(ToolResult::text(format!(
                    "Invalid arguments for {name}: {reason}"
                )))
            }
        };
        tool.execute(args, ctx).await
    }
}

fn parse_tool_args(raw: &str) -> Result<Value, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("arguments must be a JSON object".to_string()),
        Err(err) => Err(format!("arguments are not valid JSON ({err})")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Checks that every schema is closed the way strict function calling
/// requires: objects list all properties as required and forbid extras.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let fail = |reason: &str| ToolSchemaValidationError {
        tool_name: tool_name.to_string(),
        path: path.to_string(),
        reason: reason.to_string(),
    };
    let Some(obj) = value.as_object() else {
        return Err(fail("schema node must be an object"));
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("array") => {
            let Some(items) = obj.get("items") else {
                return Err(fail("array schema missing items"));
            };
            validate_schema_node(tool_name, &format!("{path}.items"), items)?;
        }
        Some("object") => {
            if obj.get("additionalProperties") != Some(&Value::Bool(false)) {
                return Err(fail("object schema must set additionalProperties to false"));
            }
            let props = obj
                .get("properties")
                .and_then(Value::as_object)
                .ok_or_else(|| fail("object schema missing properties"))?;
            let required: Vec<&str> = obj
                .get("required")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            for (key, child) in props {
                if !required.contains(&key.as_str()) {
                    return Err(fail(&format!("property `{key}` must be required")));
                }
                validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
            }
        }
        _ => {}
    }
    Ok(())
}
