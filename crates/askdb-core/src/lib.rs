pub mod agent_loop;
pub mod chunks;
pub mod config;
pub mod instructions;
pub mod request;
pub mod service;

pub use agent_loop::{AgentLoop, LoopOutcome, RunInput, TerminationReason};
pub use chunks::ChunkEmitter;
pub use config::{
    default_config_path, AgentConfig, AppConfig, BackendConfig, CacheConfig, ConfigStore,
    GuardConfig, ServerConfig,
};
pub use instructions::system_instructions;
pub use request::{ChatRequest, HistoryEntry, RequestError, ValidatedRequest, MAX_CONTENT_CHARS};
pub use service::{build_backend, build_cache, ChatService, ChatSettings, ModelHint};
