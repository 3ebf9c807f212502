use std::collections::VecDeque;

use async_stream::try_stream;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use askdb_types::{ModelInfo, ProviderInfo, Turn};

use crate::{ChunkStream, Provider, RoundOptions, StreamChunk};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(StreamChunk),
    /// Fails the stream after the preceding steps were delivered.
    Fail(String),
    /// Refuses the request before any chunk is produced. Only meaningful as
    /// the first step of a round.
    Reject(String),
    /// Never yields again.
    Stall,
}

/// What the provider was asked for in one round.
#[derive(Debug, Clone)]
pub struct RecordedRound {
    pub turns: Vec<Turn>,
    pub tool_names: Vec<String>,
    pub parallel_tool_calls: bool,
}

/// Replays canned rounds in order. Used to drive the loop without a network.
pub struct ScriptedProvider {
    rounds: Mutex<VecDeque<Vec<ScriptStep>>>,
    recorded: Mutex<Vec<RecordedRound>>,
}

impl ScriptedProvider {
    pub fn new(rounds: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// A round that requests each `(id, name, arguments)` call, then stops.
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Vec<ScriptStep> {
        let mut steps = Vec::new();
        for (id, name, arguments) in calls {
            steps.push(ScriptStep::Chunk(StreamChunk::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            }));
            steps.push(ScriptStep::Chunk(StreamChunk::ToolCallDelta {
                id: id.to_string(),
                args_delta: arguments.to_string(),
            }));
            steps.push(ScriptStep::Chunk(StreamChunk::ToolCallEnd {
                id: id.to_string(),
            }));
        }
        steps.push(ScriptStep::Chunk(StreamChunk::Done {
            finish_reason: "tool_calls".to_string(),
            usage: None,
        }));
        steps
    }

    /// A round that streams `parts` as text deltas, then stops.
    pub fn text(parts: &[&str]) -> Vec<ScriptStep> {
        let mut steps: Vec<ScriptStep> = parts
            .iter()
            .map(|part| ScriptStep::Chunk(StreamChunk::TextDelta(part.to_string())))
            .collect();
        steps.push(ScriptStep::Chunk(StreamChunk::Done {
            finish_reason: "stop".to_string(),
            usage: None,
        }));
        steps
    }

    pub async fn recorded(&self) -> Vec<RecordedRound> {
        self.recorded.lock().await.clone()
    }

    pub async fn remaining_rounds(&self) -> usize {
        self.rounds.lock().await.len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: vec![ModelInfo {
                id: "script-1".to_string(),
                provider_id: "scripted".to_string(),
                display_name: "Scripted Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn stream(
        &self,
        turns: Vec<Turn>,
        _model_override: Option<&str>,
        options: RoundOptions,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        self.recorded.lock().await.push(RecordedRound {
            turns,
            tool_names: options.tools.iter().map(|t| t.name.clone()).collect(),
            parallel_tool_calls: options.parallel_tool_calls,
        });

        let Some(steps) = self.rounds.lock().await.pop_front() else {
            anyhow::bail!("scripted provider has no more rounds");
        };
        if let Some(ScriptStep::Reject(message)) = steps.first() {
            anyhow::bail!("{message}");
        }

        let stream = try_stream! {
            for step in steps {
                match step {
                    ScriptStep::Chunk(chunk) => yield chunk,
                    ScriptStep::Fail(message) => Err(anyhow::anyhow!(message))?,
                    ScriptStep::Reject(_) => {}
                    ScriptStep::Stall => futures::future::pending::<()>().await,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn replays_rounds_in_order_and_records_requests() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_calls(&[("c1", "execute_sql", "{\"query\":\"SELECT 1\"}")]),
            ScriptedProvider::text(&["done"]),
        ]);

        let stream = provider
            .stream(
                vec![Turn::user("q")],
                None,
                RoundOptions {
                    tools: Vec::new(),
                    parallel_tool_calls: true,
                },
                CancellationToken::new(),
            )
            .await
            .expect("stream");
        let chunks: Vec<StreamChunk> = stream.map(|c| c.expect("chunk")).collect().await;
        assert_eq!(chunks.len(), 4);
        assert_eq!(provider.remaining_rounds().await, 1);

        let recorded = provider.recorded().await;
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].parallel_tool_calls);
    }

    #[tokio::test]
    async fn reject_fails_before_streaming() {
        let provider = ScriptedProvider::new(vec![vec![ScriptStep::Reject(
            "status 401 Unauthorized".to_string(),
        )]]);
        let err = provider
            .stream(
                Vec::new(),
                None,
                RoundOptions::default(),
                CancellationToken::new(),
            )
            .await
            .err()
            .expect("rejected");
        assert!(err.to_string().contains("401"));
    }
}
