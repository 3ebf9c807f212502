use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use askdb_guard::{SchemaCatalog, TableDef, DEFAULT_TENANT_COLUMN};
use askdb_providers::{ProviderConfig, ProvidersConfig};
use askdb_warehouse::ClickHouseConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub max_rows: u64,
    pub tenant_column: String,
    pub allowed_schemas: Vec<String>,
    /// Replaces the built-in demo tables when set.
    pub tables: Option<Vec<TableDef>>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_rows: 100,
            tenant_column: DEFAULT_TENANT_COLUMN.to_string(),
            allowed_schemas: vec!["public".to_string()],
            tables: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_tool_calls: usize,
    pub request_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub parallel_tool_calls: bool,
    pub history_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 5,
            request_timeout_ms: 120_000,
            query_timeout_ms: 15_000,
            parallel_tool_calls: false,
            history_window: 10,
        }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// `path` opens an existing database read-only; `script` seeds an
    /// in-memory one. With neither, the demo fixtures are loaded.
    Sqlite {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        script: Option<PathBuf>,
    },
    Clickhouse(ClickHouseConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: None,
            script: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: 60,
            max_entries: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Bearer token accepted by the development tenant resolver.
    pub api_token: Option<String>,
    /// Honour `?provider=` / `?model=` on the chat route. Off by default.
    pub allow_model_override: bool,
}

impl AppConfig {
    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
        }
    }

    pub fn catalog(&self) -> SchemaCatalog {
        let tables = match &self.guard.tables {
            Some(tables) => tables.clone(),
            None => SchemaCatalog::builtin().tables().to_vec(),
        };
        SchemaCatalog::new(tables, self.guard.tenant_column.clone())
            .with_allowed_schemas(self.guard.allowed_schemas.clone())
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: file, then environment, then command line.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    layers: ConfigLayers,
}

impl ConfigStore {
    pub async fn load(path: Option<&Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        Ok(Self::from_layers(
            path.map(Path::to_path_buf),
            file,
            env_layer(|key| std::env::var(key).ok()),
            cli_overrides.unwrap_or_else(empty_object),
        ))
    }

    fn from_layers(path: Option<PathBuf>, file: Value, env: Value, cli: Value) -> Self {
        Self {
            path,
            layers: ConfigLayers { file, env, cli },
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> anyhow::Result<AppConfig> {
        serde_json::from_value(self.get_effective_value()).context("invalid configuration")
    }

    pub fn get_effective_value(&self) -> Value {
        let mut merged = empty_object();
        deep_merge(&mut merged, &self.layers.file);
        deep_merge(&mut merged, &self.layers.env);
        deep_merge(&mut merged, &self.layers.cli);
        merged
    }

    /// Every layer, with provider keys masked.
    pub fn get_layers_value(&self) -> Value {
        let mut value = json!({
            "file": self.layers.file,
            "env": self.layers.env,
            "cli": self.layers.cli,
        });
        if let Some(layers) = value.as_object_mut() {
            for layer in layers.values_mut() {
                mask_api_keys(layer);
            }
        }
        value
    }
}

/// `$ASKDB_CONFIG`, else `<config dir>/askdb/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ASKDB_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("askdb").join("config.json"))
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str::<Value>(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn mask_api_keys(layer: &mut Value) {
    let Some(providers) = layer.get_mut("providers").and_then(Value::as_object_mut) else {
        return;
    };
    for provider in providers.values_mut() {
        if let Some(cfg) = provider.as_object_mut() {
            if cfg.contains_key("api_key") {
                cfg.insert("api_key".to_string(), json!("***"));
            }
        }
    }
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(provider) = var("ASKDB_DEFAULT_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider }));
    }
    if let Some(max_rows) = var("ASKDB_MAX_ROWS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "guard": { "max_rows": max_rows } }));
    }
    if let Some(column) = var("ASKDB_TENANT_COLUMN") {
        deep_merge(&mut root, &json!({ "guard": { "tenant_column": column } }));
    }
    for (key, field) in [
        ("ASKDB_MAX_TOOL_CALLS", "max_tool_calls"),
        ("ASKDB_REQUEST_TIMEOUT_MS", "request_timeout_ms"),
        ("ASKDB_QUERY_TIMEOUT_MS", "query_timeout_ms"),
        ("ASKDB_HISTORY_WINDOW", "history_window"),
    ] {
        if let Some(n) = var(key).and_then(|v| v.trim().parse::<u64>().ok()) {
            deep_merge(&mut root, &json!({ "agent": { field: n } }));
        }
    }
    if let Some(parallel) = var("ASKDB_PARALLEL_TOOL_CALLS").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "agent": { "parallel_tool_calls": parallel } }));
    }
    if let Some(enabled) = var("ASKDB_CACHE").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "cache": { "enabled": enabled } }));
    }
    if let Some(token) = var("ASKDB_API_TOKEN") {
        deep_merge(&mut root, &json!({ "server": { "api_token": token } }));
    }
    if let Some(allow) = var("ASKDB_ALLOW_MODEL_OVERRIDE").and_then(|v| parse_bool_like(&v)) {
        deep_merge(
            &mut root,
            &json!({ "server": { "allow_model_override": allow } }),
        );
    }

    if let Some(url) = var("ASKDB_CLICKHOUSE_URL") {
        let mut backend = json!({ "kind": "clickhouse", "url": url });
        for (key, field) in [
            ("ASKDB_CLICKHOUSE_DATABASE", "database"),
            ("ASKDB_CLICKHOUSE_USER", "user"),
            ("ASKDB_CLICKHOUSE_PASSWORD", "password"),
        ] {
            if let Some(v) = var(key) {
                backend[field] = json!(v);
            }
        }
        root["backend"] = backend;
    } else if let Some(path) = var("ASKDB_SQLITE_PATH") {
        root["backend"] = json!({ "kind": "sqlite", "path": path });
    }

    for (provider, key_env, url, model) in [
        ("openai", "OPENAI_API_KEY", "https://api.openai.com/v1", "gpt-4o-mini"),
        (
            "openrouter",
            "OPENROUTER_API_KEY",
            "https://openrouter.ai/api/v1",
            "openai/gpt-4o-mini",
        ),
        (
            "groq",
            "GROQ_API_KEY",
            "https://api.groq.com/openai/v1",
            "llama-3.3-70b-versatile",
        ),
        (
            "mistral",
            "MISTRAL_API_KEY",
            "https://api.mistral.ai/v1",
            "mistral-small-latest",
        ),
        (
            "together",
            "TOGETHER_API_KEY",
            "https://api.together.xyz/v1",
            "meta-llama/Llama-3.3-70B-Instruct-Turbo",
        ),
    ] {
        if let Some(api_key) = var(key_env) {
            deep_merge(
                &mut root,
                &json!({
                    "providers": {
                        provider: {
                            "api_key": api_key,
                            "url": url,
                            "default_model": model
                        }
                    }
                }),
            );
        }
    }
    if let Some(url) = var("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({ "providers": { "ollama": { "url": url } } }),
        );
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
