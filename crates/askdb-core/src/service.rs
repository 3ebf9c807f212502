use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use askdb_guard::SchemaCatalog;
use askdb_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use askdb_providers::ProviderRegistry;
use askdb_tools::{NoopCache, QueryCache, SqlToolSettings, ToolRegistry, TtlLruCache};
use askdb_warehouse::{ClickHouseBackend, QueryBackend, SqliteBackend};
use askdb_wire::Chunk;

use crate::agent_loop::{AgentLoop, LoopOutcome, RunInput};
use crate::chunks::ChunkEmitter;
use crate::config::{AgentConfig, AppConfig, BackendConfig, CacheConfig};
use crate::instructions::system_instructions;
use crate::request::ValidatedRequest;

const CHUNK_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub max_tool_calls: usize,
    pub request_timeout: Duration,
    pub parallel_tool_calls: bool,
    pub history_window: usize,
    pub max_rows: u64,
}

impl ChatSettings {
    pub fn from_config(agent: &AgentConfig, max_rows: u64) -> Self {
        Self {
            max_tool_calls: agent.max_tool_calls,
            request_timeout: agent.request_timeout(),
            parallel_tool_calls: agent.parallel_tool_calls,
            history_window: agent.history_window,
            max_rows,
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default(), 100)
    }
}

/// Provider and model requested for one chat.
#[derive(Debug, Clone, Default)]
pub struct ModelHint {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

/// Entry point for chat requests: validated input in, chunk stream out.
#[derive(Clone)]
pub struct ChatService {
    agent: AgentLoop,
    catalog: Arc<SchemaCatalog>,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(
        providers: ProviderRegistry,
        tools: ToolRegistry,
        catalog: Arc<SchemaCatalog>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            agent: AgentLoop::new(providers, tools),
            catalog,
            settings,
        }
    }

    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(config.catalog());
        let backend = build_backend(&config.backend).await?;
        let cache = build_cache(&config.cache);
        let tools = ToolRegistry::sql_tools(
            catalog.clone(),
            backend,
            cache,
            SqlToolSettings {
                max_rows: config.guard.max_rows,
                query_timeout: config.agent.query_timeout(),
            },
        );
        let providers = ProviderRegistry::new(config.providers_config());
        Ok(Self::new(
            providers,
            tools,
            catalog,
            ChatSettings::from_config(&config.agent, config.guard.max_rows),
        ))
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    /// Starts the loop on its own task. The stream ends after the terminal
    /// chunk, or without one once `cancel` fires.
    pub fn start(
        &self,
        tenant_id: &str,
        request: ValidatedRequest,
        hint: ModelHint,
        cancel: CancellationToken,
    ) -> ReceiverStream<Chunk> {
        let (emitter, rx) = ChunkEmitter::channel(CHUNK_CHANNEL_CAPACITY, cancel.clone());
        let (input, deadline) = self.prepare(tenant_id, request, hint);
        let agent = self.agent.clone();
        tokio::spawn(async move {
            agent.run(input, cancel, deadline, &emitter).await;
        });
        ReceiverStream::new(rx)
    }

    /// Runs a request to completion on the current task and collects every
    /// chunk it produced.
    pub async fn run_to_end(
        &self,
        tenant_id: &str,
        request: ValidatedRequest,
        hint: ModelHint,
        cancel: CancellationToken,
    ) -> (LoopOutcome, Vec<Chunk>) {
        let (emitter, mut rx) = ChunkEmitter::channel(CHUNK_CHANNEL_CAPACITY, cancel.clone());
        let (input, deadline) = self.prepare(tenant_id, request, hint);
        let collector = tokio::spawn(async move {
            let mut chunks = Vec::new();
            while let Some(chunk) = rx.recv().await {
                chunks.push(chunk);
            }
            chunks
        });
        let outcome = self.agent.run(input, cancel, deadline, &emitter).await;
        drop(emitter);
        let chunks = collector.await.unwrap_or_default();
        (outcome, chunks)
    }

    fn prepare(
        &self,
        tenant_id: &str,
        request: ValidatedRequest,
        hint: ModelHint,
    ) -> (RunInput, tokio::time::Instant) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let question = redact_text(&request.content);
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "chat.start",
                component: "chat.service",
                request_id: Some(&request_id),
                tenant_id: Some(tenant_id),
                provider_id: hint.provider_id.as_deref(),
                model_id: hint.model_id.as_deref(),
                status: Some("start"),
                detail: Some(&question),
                ..Default::default()
            },
        );

        let input = RunInput {
            request_id,
            tenant_id: tenant_id.to_string(),
            instructions: system_instructions(
                &self.catalog,
                request.preferred_table.as_deref(),
                self.settings.max_rows,
                Utc::now(),
            ),
            turns: request.turns(),
            max_tool_calls: self.settings.max_tool_calls,
            parallel_tool_calls: self.settings.parallel_tool_calls,
            provider_id: hint.provider_id,
            model_id: hint.model_id,
        };
        let deadline = tokio::time::Instant::now() + self.settings.request_timeout;
        (input, deadline)
    }
}

pub async fn build_backend(config: &BackendConfig) -> anyhow::Result<Arc<dyn QueryBackend>> {
    let backend: Arc<dyn QueryBackend> = match config {
        BackendConfig::Sqlite {
            path: Some(path), ..
        } => Arc::new(SqliteBackend::open_read_only(path)?),
        BackendConfig::Sqlite {
            path: None,
            script: Some(script),
        } => Arc::new(SqliteBackend::from_script_file(script).await?),
        BackendConfig::Sqlite {
            path: None,
            script: None,
        } => Arc::new(SqliteBackend::demo()?),
        BackendConfig::Clickhouse(cfg) => Arc::new(ClickHouseBackend::new(cfg.clone())),
    };
    tracing::info!(backend = backend.name(), "query backend ready");
    Ok(backend)
}

pub fn build_cache(config: &CacheConfig) -> Arc<dyn QueryCache> {
    if config.enabled {
        Arc::new(TtlLruCache::new(
            Duration::from_secs(config.ttl_seconds),
            config.max_entries,
        ))
    } else {
        Arc::new(NoopCache)
    }
}
