use askdb_types::Row;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{QueryBackend, WarehouseError, WarehouseResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub url: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Server-side execution limit, in seconds.
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
}

fn default_user() -> String {
    "default".to_string()
}

fn default_max_execution_time() -> u64 {
    15
}

/// ClickHouse over its HTTP interface, with `readonly=1` on every request.
pub struct ClickHouseBackend {
    client: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseBackend {
    pub fn new(config: ClickHouseConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("readonly", "1".to_string()),
            ("max_execution_time", self.config.max_execution_time.to_string()),
            ("output_format_json_quote_64bit_integers", "0".to_string()),
        ];
        if let Some(database) = &self.config.database {
            params.push(("database", database.clone()));
        }
        params
    }
}

#[async_trait]
impl QueryBackend for ClickHouseBackend {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn escapes_backslashes(&self) -> bool {
        true
    }

    async fn run(&self, sql: &str) -> WarehouseResult<Vec<Row>> {
        let mut req = self
            .client
            .post(&self.config.url)
            .query(&self.query_params())
            .header("X-ClickHouse-User", &self.config.user)
            .body(format!("{sql} FORMAT JSON"));
        if let Some(password) = &self.config.password {
            req = req.header("X-ClickHouse-Key", password);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(WarehouseError::Backend {
                status: status.as_u16(),
                message: truncate_for_error(body.trim(), 500),
            });
        }
        parse_json_format(&body)
    }
}

/// Extracts `data` from a `FORMAT JSON` response body.
pub(crate) fn parse_json_format(body: &str) -> WarehouseResult<Vec<Row>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| WarehouseError::InvalidResponse(format!("invalid json: {err}")))?;
    let Some(data) = value.get("data").and_then(Value::as_array) else {
        return Err(WarehouseError::InvalidResponse(
            "missing `data` array".to_string(),
        ));
    };
    data.iter()
        .map(|row| match row {
            Value::Object(map) => Ok(map.clone()),
            other => Err(WarehouseError::InvalidResponse(format!(
                "expected row object, got {other}"
            ))),
        })
        .collect()
}

fn truncate_for_error(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        let head: String = input.chars().take(max_chars).collect();
        format!("{head}...")
    }
}
