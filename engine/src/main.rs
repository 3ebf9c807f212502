use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use askdb_core::{default_config_path, AppConfig, ChatRequest, ChatService, ConfigStore, ModelHint};
use askdb_guard::{guard, GuardOptions};
use askdb_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use askdb_providers::SUPPORTED_PROVIDER_IDS;
use askdb_server::{serve, AppState, HeaderTenantResolver};

#[derive(Parser, Debug)]
#[command(name = "askdb-engine")]
#[command(about = "Ask questions about your data in plain language")]
struct Cli {
    /// Configuration file (JSON). Defaults to $ASKDB_CONFIG or the user config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory for JSONL log files.
    #[arg(long, global = true, env = "ASKDB_LOGS_DIR")]
    logs_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Default)]
struct ModelArgs {
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_tool_calls: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the streaming chat endpoint over HTTP.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Ask one question and print the streamed chunks as NDJSON.
    Ask {
        question: String,
        #[arg(long, env = "ASKDB_TENANT")]
        tenant: String,
        #[arg(long)]
        table: Option<String>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Show how a query would be rewritten for a tenant.
    Guard {
        sql: String,
        #[arg(long, env = "ASKDB_TENANT")]
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().or_else(default_config_path);

    match cli.command {
        Command::Serve {
            hostname,
            port,
            model,
        } => {
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Server, &resolve_logs_dir(cli.logs_dir), 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("server jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("server logging initialized: {:?}", log_info);

            let config = load_config(config_path, model).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            if config.server.api_token.is_none() {
                tracing::warn!("no api token configured; every caller is accepted");
            }
            let tenants = Arc::new(HeaderTenantResolver::new(config.server.api_token.clone()));
            let chat = ChatService::from_config(&config).await?;
            let state =
                AppState::new(chat, tenants).with_model_override(config.server.allow_model_override);
            serve(addr, state).await?;
        }
        Command::Ask {
            question,
            tenant,
            table,
            model,
        } => {
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Cli, &resolve_logs_dir(cli.logs_dir), 14)?;
            let provider = normalize_and_validate_provider(model.provider.clone())?;
            let model_id = model.model.clone();
            let config = load_config(config_path, model).await?;
            let chat = ChatService::from_config(&config).await?;
            let request = ChatRequest {
                content: question,
                preferred_table: table,
                history: Vec::new(),
            }
            .validate(chat.catalog(), config.agent.history_window)?;

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });
            let mut chunks = chat.start(
                tenant.trim(),
                request,
                ModelHint {
                    provider_id: provider,
                    model_id,
                },
                cancel,
            );
            let mut failed = false;
            let mut stdout = std::io::stdout();
            while let Some(chunk) = chunks.next().await {
                failed = chunk.is_error();
                stdout.write_all(chunk.to_ndjson_line().as_bytes())?;
                stdout.flush()?;
            }
            if failed {
                anyhow::bail!("request failed");
            }
        }
        Command::Guard { sql, tenant } => {
            let config = load_config(config_path, ModelArgs::default()).await?;
            let catalog = config.catalog();
            let options = GuardOptions::new(tenant.trim(), config.guard.max_rows);
            match guard(&sql, &options, &catalog) {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(violation) => {
                    anyhow::bail!("{}: {}", violation.code(), violation);
                }
            }
        }
    }

    Ok(())
}

async fn load_config(path: Option<PathBuf>, model: ModelArgs) -> anyhow::Result<AppConfig> {
    let provider = normalize_and_validate_provider(model.provider)?;
    let overrides =
        build_cli_overrides(model.api_key, provider, model.model, model.max_tool_calls)?;
    let store = ConfigStore::load(path.as_deref(), overrides).await?;
    store.get()
}

fn resolve_logs_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    let root = dirs::data_local_dir()
        .map(|dir| dir.join("askdb"))
        .unwrap_or_else(|| PathBuf::from(".askdb"));
    canonical_logs_dir_from_root(&root)
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    max_tool_calls: Option<usize>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() && max_tool_calls.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // Key and model apply to the named provider, else to openai.
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    if let Some(n) = max_tool_calls {
        root.insert(
            "agent".to_string(),
            serde_json::json!({ "max_tool_calls": n }),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_cli_overrides_targets_named_provider() {
        let overrides = build_cli_overrides(
            Some("gsk-test".to_string()),
            Some("groq".to_string()),
            Some("llama-3.3-70b-versatile".to_string()),
            None,
        )
        .expect("overrides")
        .expect("some");

        assert_eq!(overrides["default_provider"], json!("groq"));
        assert_eq!(overrides["providers"]["groq"]["api_key"], json!("gsk-test"));
        assert!(overrides.get("agent").is_none());
    }

    #[test]
    fn build_cli_overrides_defaults_model_and_key_to_openai_without_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            None,
            Some("gpt-4o-mini".to_string()),
            Some(3),
        )
        .expect("overrides")
        .expect("some");

        assert!(overrides.get("default_provider").is_none());
        assert_eq!(
            overrides["providers"]["openai"]["default_model"],
            json!("gpt-4o-mini")
        );
        assert_eq!(overrides["agent"]["max_tool_calls"], json!(3));
    }

    #[test]
    fn build_cli_overrides_is_none_without_flags() {
        assert!(build_cli_overrides(None, None, None, None)
            .expect("overrides")
            .is_none());
    }

    #[test]
    fn normalize_and_validate_provider_accepts_known_values_case_insensitive() {
        let provider =
            normalize_and_validate_provider(Some(" OpenRouter ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("openrouter"));
    }

    #[test]
    fn normalize_and_validate_provider_rejects_unknown_value() {
        let err = normalize_and_validate_provider(Some("anthropic".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `anthropic`"));
    }

    #[test]
    fn cli_parses_ask_with_tenant() {
        let cli = Cli::try_parse_from([
            "askdb-engine",
            "ask",
            "how many open tasks?",
            "--tenant",
            "acme",
            "--max-tool-calls",
            "2",
        ])
        .expect("parse");
        match cli.command {
            Command::Ask {
                question,
                tenant,
                model,
                ..
            } => {
                assert_eq!(question, "how many open tasks?");
                assert_eq!(tenant, "acme");
                assert_eq!(model.max_tool_calls, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
