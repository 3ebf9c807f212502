use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Function-calling declaration handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ToolResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: Value::Object(Default::default()),
        }
    }
}

/// One result row. Column order follows the backend's projection order.
pub type Row = serde_json::Map<String, Value>;
