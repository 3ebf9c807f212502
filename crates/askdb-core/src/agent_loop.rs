use std::time::Instant as StdInstant;

use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use askdb_observability::{emit_event, ObservabilityEvent, ProcessKind};
use askdb_providers::{ChunkStream, Provider, ProviderRegistry, RoundOptions, StreamChunk};
use askdb_tools::{validate_tool_schemas, ToolContext, ToolRegistry};
use askdb_types::Turn;
use askdb_wire::Chunk;

use crate::chunks::ChunkEmitter;

pub const PROVIDER_ERROR_MESSAGE: &str =
    "Something went wrong while generating a response. Please try again.";
pub const TIMEOUT_MESSAGE: &str = "The request took too long to complete. Please try again.";
pub const TOOL_CAP_NOTE: &str =
    "I reached the limit of queries I can run for one question, so this answer may be incomplete.";
pub const TOOL_CAP_MESSAGE: &str =
    "I reached the limit of queries I can run for one question before finding an answer. \
     Try asking something narrower.";
pub const EMPTY_ANSWER_MESSAGE: &str =
    "I couldn't come up with an answer to that. Try rephrasing the question.";
pub const BUDGET_EXHAUSTED_OUTPUT: &str =
    "Tool call limit reached. Do not call more tools; answer with what you have.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    MaxToolCalls,
    Aborted,
    Timeout,
    Error,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Completed => "completed",
            TerminationReason::MaxToolCalls => "max_tool_calls",
            TerminationReason::Aborted => "aborted",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunInput {
    pub request_id: String,
    pub tenant_id: String,
    pub instructions: String,
    /// History plus the new user turn.
    pub turns: Vec<Turn>,
    pub max_tool_calls: usize,
    pub parallel_tool_calls: bool,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub reason: TerminationReason,
    pub tool_call_count: usize,
    /// Text of the final chunk, when one was sent with content.
    pub text: Option<String>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    call_id: String,
    name: String,
    arguments: String,
    complete: bool,
}

enum RoundEnd {
    Finished(Vec<PendingToolCall>),
    Aborted,
    TimedOut,
    Failed(anyhow::Error),
}

/// Drives the model through rounds of text and tool calls until the request
/// terminates.
#[derive(Clone)]
pub struct AgentLoop {
    providers: ProviderRegistry,
    tools: ToolRegistry,
}

impl AgentLoop {
    pub fn new(providers: ProviderRegistry, tools: ToolRegistry) -> Self {
        Self { providers, tools }
    }

    pub async fn run(
        &self,
        input: RunInput,
        cancel: CancellationToken,
        deadline: Instant,
        emitter: &ChunkEmitter,
    ) -> LoopOutcome {
        let started = StdInstant::now();
        let log = LoopLog {
            request_id: &input.request_id,
            tenant_id: &input.tenant_id,
            provider_id: input.provider_id.as_deref(),
            model_id: input.model_id.as_deref(),
            started,
        };
        let mut count = 0usize;

        let outcome = self
            .drive(&input, &cancel, deadline, emitter, &log, &mut count)
            .await;

        let level = match outcome.reason {
            TerminationReason::Error | TerminationReason::Timeout => Level::WARN,
            _ => Level::INFO,
        };
        log.emit(
            level,
            "loop.finish",
            outcome.reason.as_str(),
            None,
            Some(count),
            None,
        );
        outcome
    }

    async fn drive(
        &self,
        input: &RunInput,
        cancel: &CancellationToken,
        deadline: Instant,
        emitter: &ChunkEmitter,
        log: &LoopLog<'_>,
        count: &mut usize,
    ) -> LoopOutcome {
        let tool_schemas = self.tools.list().await;
        if let Err(err) = validate_tool_schemas(&tool_schemas) {
            let detail = err.to_string();
            log.emit(
                Level::ERROR,
                "loop.error",
                "failed",
                Some("TOOL_SCHEMA_INVALID"),
                Some(0),
                Some(&detail),
            );
            return fail(emitter, TerminationReason::Error, PROVIDER_ERROR_MESSAGE, 0).await;
        }

        let provider = match self
            .providers
            .select_provider(input.provider_id.as_deref())
            .await
        {
            Ok(provider) => provider,
            Err(err) => {
                let detail = err.to_string();
                log.emit(
                    Level::ERROR,
                    "provider.call.error",
                    "failed",
                    Some("PROVIDER_NOT_CONFIGURED"),
                    Some(0),
                    Some(&detail),
                );
                return fail(emitter, TerminationReason::Error, PROVIDER_ERROR_MESSAGE, 0).await;
            }
        };

        let mut turns = Vec::with_capacity(input.turns.len() + 1);
        turns.push(Turn::system(input.instructions.clone()));
        turns.extend(input.turns.iter().cloned());
        let mut accumulated = String::new();

        loop {
            if cancel.is_cancelled() {
                return aborted(*count);
            }
            if Instant::now() >= deadline {
                return fail(emitter, TerminationReason::Timeout, TIMEOUT_MESSAGE, *count).await;
            }
            if *count >= input.max_tool_calls {
                let text = if accumulated.trim().is_empty() {
                    TOOL_CAP_MESSAGE.to_string()
                } else {
                    format!("{}\n\n{TOOL_CAP_NOTE}", accumulated.trim_end())
                };
                return finish(emitter, TerminationReason::MaxToolCalls, text, *count).await;
            }

            let remaining = input.max_tool_calls - *count;
            let options = RoundOptions {
                tools: tool_schemas.clone(),
                parallel_tool_calls: input.parallel_tool_calls && remaining > 1,
            };
            accumulated.clear();

            let round = self
                .stream_round(
                    provider.as_ref(),
                    turns.clone(),
                    input.model_id.as_deref(),
                    options,
                    cancel,
                    deadline,
                    emitter,
                    &mut accumulated,
                    log,
                )
                .await;

            let calls = match round {
                RoundEnd::Finished(calls) => calls,
                RoundEnd::Aborted => return aborted(*count),
                RoundEnd::TimedOut => {
                    return fail(emitter, TerminationReason::Timeout, TIMEOUT_MESSAGE, *count).await
                }
                RoundEnd::Failed(err) => {
                    let error_text = err.to_string();
                    let error_code = provider_error_code(&error_text);
                    let detail = truncate_text(&error_text, 500);
                    log.emit(
                        Level::ERROR,
                        "provider.call.error",
                        "failed",
                        Some(error_code),
                        Some(*count),
                        Some(&detail),
                    );
                    if cancel.is_cancelled() {
                        return aborted(*count);
                    }
                    return fail(emitter, TerminationReason::Error, PROVIDER_ERROR_MESSAGE, *count)
                        .await;
                }
            };

            if calls.is_empty() {
                let text = if accumulated.trim().is_empty() {
                    EMPTY_ANSWER_MESSAGE.to_string()
                } else {
                    accumulated.clone()
                };
                return finish(emitter, TerminationReason::Completed, text, *count).await;
            }

            if !accumulated.trim().is_empty() {
                turns.push(Turn::assistant(accumulated.clone()));
            }

            let ctx = ToolContext {
                tenant_id: input.tenant_id.clone(),
                cancel: cancel.child_token(),
            };
            let mut call_turns = Vec::new();
            let mut output_turns = Vec::new();
            for call in calls {
                if cancel.is_cancelled() {
                    return aborted(*count);
                }
                if *count >= input.max_tool_calls {
                    // Keep the sequence well-formed for the provider.
                    tracing::info!(
                        target: "askdb.loop",
                        request_id = %input.request_id,
                        tool = %call.name,
                        "tool call dropped, budget exhausted"
                    );
                    output_turns.push(Turn::ToolOutput {
                        call_id: call.call_id.clone(),
                        output: BUDGET_EXHAUSTED_OUTPUT.to_string(),
                    });
                    call_turns.push(Turn::ToolCall {
                        call_id: call.call_id,
                        name: call.name,
                        arguments: call.arguments,
                    });
                    break;
                }

                let tool_name = normalize_tool_name(&call.name);
                let tool_started = StdInstant::now();
                let executed = tokio::select! {
                    _ = cancel.cancelled() => return aborted(*count),
                    _ = tokio::time::sleep_until(deadline) => {
                        // Dropping the call abandons the in-flight query.
                        *count += 1;
                        tracing::warn!(
                            target: "askdb.loop",
                            request_id = %input.request_id,
                            tool = %tool_name,
                            "request deadline reached during tool call"
                        );
                        return fail(emitter, TerminationReason::Timeout, TIMEOUT_MESSAGE, *count)
                            .await;
                    }
                    executed = self.tools.execute(&tool_name, &call.arguments, &ctx) => executed,
                };
                let output = match executed {
                    Ok(result) => {
                        let status = result
                            .metadata
                            .get("status")
                            .and_then(|v| v.as_str())
                            .unwrap_or("ok");
                        tracing::info!(
                            target: "askdb.loop",
                            request_id = %input.request_id,
                            tool = %tool_name,
                            status,
                            duration_ms = tool_started.elapsed().as_millis() as u64,
                            "tool call finished"
                        );
                        result.output
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "askdb.loop",
                            request_id = %input.request_id,
                            tool = %tool_name,
                            error = %err,
                            "tool call failed"
                        );
                        format!("Tool `{tool_name}` failed: {err}")
                    }
                };
                *count += 1;
                output_turns.push(Turn::ToolOutput {
                    call_id: call.call_id.clone(),
                    output,
                });
                call_turns.push(Turn::ToolCall {
                    call_id: call.call_id,
                    name: tool_name,
                    arguments: call.arguments,
                });
            }
            turns.extend(call_turns);
            turns.extend(output_turns);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_round(
        &self,
        provider: &dyn Provider,
        turns: Vec<Turn>,
        model_id: Option<&str>,
        options: RoundOptions,
        cancel: &CancellationToken,
        deadline: Instant,
        emitter: &ChunkEmitter,
        accumulated: &mut String,
        log: &LoopLog<'_>,
    ) -> RoundEnd {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let opened: anyhow::Result<ChunkStream> = tokio::select! {
            _ = cancel.cancelled() => return RoundEnd::Aborted,
            _ = &mut sleep => return RoundEnd::TimedOut,
            opened = provider.stream(turns, model_id, options, cancel.clone()) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => return RoundEnd::Failed(err),
        };

        let mut pending: Vec<PendingToolCall> = Vec::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return RoundEnd::Aborted,
                _ = &mut sleep => return RoundEnd::TimedOut,
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return RoundEnd::Failed(err),
            };
            match chunk {
                StreamChunk::TextDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    if accumulated.is_empty() {
                        log.emit(
                            Level::DEBUG,
                            "provider.call.first_byte",
                            "streaming",
                            None,
                            None,
                            None,
                        );
                    }
                    accumulated.push_str(&delta);
                    emitter.content(accumulated).await;
                }
                StreamChunk::ReasoningDelta(_) => {}
                StreamChunk::ToolCallStart { id, name } => {
                    let call = pending_entry(&mut pending, id);
                    if call.name.is_empty() {
                        call.name = name;
                    }
                }
                StreamChunk::ToolCallDelta { id, args_delta } => {
                    pending_entry(&mut pending, id)
                        .arguments
                        .push_str(&args_delta);
                }
                StreamChunk::ToolCallEnd { id } => {
                    pending_entry(&mut pending, id).complete = true;
                }
                StreamChunk::Done { .. } => break,
            }
        }

        let calls = pending
            .into_iter()
            .filter(|call| !call.name.trim().is_empty())
            .map(|mut call| {
                if !call.complete {
                    tracing::debug!(
                        target: "askdb.loop",
                        call_id = %call.call_id,
                        "tool call closed by end of stream"
                    );
                    call.complete = true;
                }
                call
            })
            .collect();
        RoundEnd::Finished(calls)
    }
}

fn pending_entry(pending: &mut Vec<PendingToolCall>, id: String) -> &mut PendingToolCall {
    let index = match pending.iter().position(|call| call.call_id == id) {
        Some(index) => index,
        None => {
            pending.push(PendingToolCall {
                call_id: id,
                ..PendingToolCall::default()
            });
            pending.len() - 1
        }
    };
    &mut pending[index]
}

async fn finish(
    emitter: &ChunkEmitter,
    reason: TerminationReason,
    text: String,
    count: usize,
) -> LoopOutcome {
    emitter.finish(Chunk::content(text.clone())).await;
    LoopOutcome {
        reason,
        tool_call_count: count,
        text: Some(text),
    }
}

async fn fail(
    emitter: &ChunkEmitter,
    reason: TerminationReason,
    message: &str,
    count: usize,
) -> LoopOutcome {
    emitter.finish(Chunk::error(message)).await;
    LoopOutcome {
        reason,
        tool_call_count: count,
        text: None,
    }
}

fn aborted(count: usize) -> LoopOutcome {
    LoopOutcome {
        reason: TerminationReason::Aborted,
        tool_call_count: count,
        text: None,
    }
}

struct LoopLog<'a> {
    request_id: &'a str,
    tenant_id: &'a str,
    provider_id: Option<&'a str>,
    model_id: Option<&'a str>,
    started: StdInstant,
}

impl LoopLog<'_> {
    fn emit(
        &self,
        level: Level,
        event: &str,
        status: &str,
        error_code: Option<&str>,
        tool_call_count: Option<usize>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            ProcessKind::Server,
            ObservabilityEvent {
                event,
                component: "agent.loop",
                request_id: Some(self.request_id),
                tenant_id: Some(self.tenant_id),
                provider_id: self.provider_id,
                model_id: self.model_id,
                status: Some(status),
                error_code,
                tool_call_count: tool_call_count.map(|n| n as u64),
                duration_ms: Some(self.started.elapsed().as_millis() as u64),
                detail,
            },
        );
    }
}

fn truncate_text(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        None => input.to_string(),
        Some((cut, _)) => format!("{}...<truncated>", &input[..cut]),
    }
}

fn provider_error_code(error_text: &str) -> &'static str {
    let lower = error_text.to_lowercase();
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return "RATE_LIMIT_EXCEEDED";
    }
    if lower.contains("context length")
        || lower.contains("context_length")
        || lower.contains("maximum context")
        || lower.contains("token limit")
    {
        return "CONTEXT_LENGTH_EXCEEDED";
    }
    if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("invalid api key")
        || lower.contains("401")
        || lower.contains("403")
    {
        return "AUTHENTICATION_ERROR";
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return "TIMEOUT";
    }
    if lower.contains("server error")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
    {
        return "PROVIDER_SERVER_ERROR";
    }
    "PROVIDER_REQUEST_FAILED"
}

fn normalize_tool_name(name: &str) -> String {
    match name.trim().to_lowercase().replace('-', "_").as_str() {
        "sql" | "run_sql" | "query" | "executesql" => "execute_sql".to_string(),
        "schema" | "describeschema" | "list_tables" => "describe_schema".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_provider_errors() {
        assert_eq!(
            provider_error_code("provider stream request failed with status 429 Too Many Requests"),
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(
            provider_error_code("status 401 Unauthorized: invalid api key"),
            "AUTHENTICATION_ERROR"
        );
        assert_eq!(
            provider_error_code("This model's maximum context length is 8192 tokens"),
            "CONTEXT_LENGTH_EXCEEDED"
        );
        assert_eq!(provider_error_code("operation timed out"), "TIMEOUT");
        assert_eq!(
            provider_error_code("status 503 Service Unavailable"),
            "PROVIDER_SERVER_ERROR"
        );
        assert_eq!(provider_error_code("connection reset"), "PROVIDER_REQUEST_FAILED");
    }

    #[test]
    fn normalizes_tool_name_aliases() {
        assert_eq!(normalize_tool_name(" Execute-SQL "), "execute_sql");
        assert_eq!(normalize_tool_name("run_sql"), "execute_sql");
        assert_eq!(normalize_tool_name("list_tables"), "describe_schema");
        assert_eq!(normalize_tool_name("drop_all"), "drop_all");
    }

    #[test]
    fn truncate_text_respects_char_boundaries() {
        assert_eq!(truncate_text("héllo", 10), "héllo");
        assert_eq!(truncate_text("héllo", 2), "hé...<truncated>");
    }

    #[test]
    fn pending_calls_keep_receipt_order() {
        let mut pending = Vec::new();
        pending_entry(&mut pending, "b".to_string()).name = "execute_sql".to_string();
        pending_entry(&mut pending, "a".to_string()).name = "describe_schema".to_string();
        pending_entry(&mut pending, "b".to_string())
            .arguments
            .push_str("{}");
        let ids: Vec<&str> = pending.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(pending[0].arguments, "{}");
    }
}
