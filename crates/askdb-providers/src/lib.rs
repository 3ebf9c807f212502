use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use askdb_types::{ModelInfo, ProviderInfo, TokenUsage, ToolSchema, Turn};

mod openai;
mod scripted;

pub use openai::{OpenAICompatibleProvider, SseDecoder};
pub use scripted::{RecordedRound, ScriptStep, ScriptedProvider};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        args_delta: String,
    },
    ToolCallEnd {
        id: String,
    },
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

/// Per-round knobs forwarded to the model.
#[derive(Debug, Clone, Default)]
pub struct RoundOptions {
    pub tools: Vec<ToolSchema>,
    /// Whether the model may request several calls in one round.
    pub parallel_tool_calls: bool,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn stream(
        &self,
        turns: Vec<Turn>,
        model_override: Option<&str>,
        options: RoundOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        let providers = build_providers(&config);
        Self::from_providers(providers, config.default_provider)
    }

    pub fn from_providers(
        providers: Vec<Arc<dyn Provider>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(default_provider)),
        }
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

struct OpenAIFlavor {
    id: &'static str,
    name: &'static str,
    default_url: &'static str,
    default_model: &'static str,
    use_api_key: bool,
}

const OPENAI_FLAVORS: [OpenAIFlavor; 6] = [
    OpenAIFlavor {
        id: "openai",
        name: "OpenAI",
        default_url: "https://api.openai.com/v1",
        default_model: "gpt-4o-mini",
        use_api_key: true,
    },
    OpenAIFlavor {
        id: "openrouter",
        name: "OpenRouter",
        default_url: "https://openrouter.ai/api/v1",
        default_model: "openai/gpt-4o-mini",
        use_api_key: true,
    },
    OpenAIFlavor {
        id: "groq",
        name: "Groq",
        default_url: "https://api.groq.com/openai/v1",
        default_model: "llama-3.3-70b-versatile",
        use_api_key: true,
    },
    OpenAIFlavor {
        id: "mistral",
        name: "Mistral",
        default_url: "https://api.mistral.ai/v1",
        default_model: "mistral-small-latest",
        use_api_key: true,
    },
    OpenAIFlavor {
        id: "together",
        name: "Together",
        default_url: "https://api.together.xyz/v1",
        default_model: "meta-llama/Llama-3.3-70B-Instruct-Turbo",
        use_api_key: true,
    },
    OpenAIFlavor {
        id: "ollama",
        name: "Ollama",
        default_url: "http://127.0.0.1:11434/v1",
        default_model: "qwen2.5:7b",
        use_api_key: false,
    },
];

pub const SUPPORTED_PROVIDER_IDS: [&str; 6] =
    ["openai", "openrouter", "groq", "mistral", "together", "ollama"];

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    for flavor in &OPENAI_FLAVORS {
        let Some(entry) = config.providers.get(flavor.id) else {
            continue;
        };
        let api_key = if flavor.use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider(flavor.id))
        } else {
            None
        };
        providers.push(Arc::new(OpenAICompatibleProvider::new(
            flavor.id,
            flavor.name,
            entry.url.as_deref().unwrap_or(flavor.default_url),
            api_key,
            entry.default_model.as_deref().unwrap_or(flavor.default_model),
        )));
    }

    if providers.is_empty() {
        tracing::warn!("no model provider configured, answering with the local echo provider");
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

pub fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Offline fallback: repeats the latest user turn and never calls tools.
struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn stream(
        &self,
        turns: Vec<Turn>,
        _model_override: Option<&str>,
        _options: RoundOptions,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let question = turns
            .iter()
            .rev()
            .find_map(|turn| match turn {
                Turn::User { content } => Some(content.as_str()),
                _ => None,
            })
            .unwrap_or_default();
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(format!("Echo: {question}"))),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: None,
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn cfg(provider_ids: &[&str], default_provider: Option<&str>) -> ProvidersConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some("sk-test".to_string()),
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        ProvidersConfig {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openai")));
        let provider = registry
            .select_provider(Some("openrouter"))
            .await
            .expect("provider");
        assert_eq!(provider.info().id, "openrouter");
        assert_eq!(provider.info().default_model_id(), Some("openrouter-model"));
    }

    #[tokio::test]
    async fn uses_default_provider_when_explicit_provider_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai", "groq"], Some("groq")));
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "groq");
    }

    #[tokio::test]
    async fn falls_back_to_first_provider_when_default_provider_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai"], Some("anthropic")));
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "openai");
    }

    #[tokio::test]
    async fn explicit_unknown_provider_errors() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None));
        let err = registry
            .select_provider(Some("openruter"))
            .await
            .err()
            .expect("expected error");
        assert!(err
            .to_string()
            .contains("provider `openruter` is not configured"));
    }

    #[tokio::test]
    async fn empty_config_falls_back_to_echo() {
        let registry = ProviderRegistry::new(ProvidersConfig::default());
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "local");

        let mut stream = provider
            .stream(
                vec![Turn::system("rules"), Turn::user("how many projects?")],
                None,
                RoundOptions::default(),
                CancellationToken::new(),
            )
            .await
            .expect("stream");
        let first = stream.next().await.expect("chunk").expect("ok");
        assert_eq!(
            first,
            StreamChunk::TextDelta("Echo: how many projects?".to_string())
        );
    }
}
