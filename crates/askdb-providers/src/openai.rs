use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use askdb_types::{ModelInfo, ProviderInfo, TokenUsage, Turn};

use crate::{ChunkStream, Provider, RoundOptions, StreamChunk};

/// Chat-completions provider for OpenAI and the APIs that mirror it.
pub struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new(
        id: &str,
        name: &str,
        base_url: &str,
        api_key: Option<String>,
        default_model: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_url: normalize_base(base_url),
            api_key,
            default_model: default_model.to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn stream(
        &self,
        turns: Vec<Turn>,
        model_override: Option<&str>,
        options: RoundOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let url = format!("{}/chat/completions", self.base_url);
        let body = request_body(model, &turns, &options);

        let mut req = self.client.post(url).json(&body);
        if self.id == "openrouter" {
            req = req.header("X-Title", "askdb");
        }
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = tokio::select! {
            resp = req.send() => resp?,
            _ = cancel.cancelled() => anyhow::bail!("provider request cancelled"),
        };
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|value| extract_openai_error(&value))
                .unwrap_or_else(|| truncate_for_error(&text, 500));
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                detail
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut decoder = SseDecoder::default();
            let mut cancelled = false;
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    cancelled = true;
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                }
                let chunk = chunk?;
                for item in decoder.push(&chunk) {
                    yield item?;
                }
                if decoder.is_finished() {
                    break;
                }
            }
            // Some servers close the body without a `[DONE]` sentinel.
            if !cancelled && !decoder.is_finished() {
                for item in decoder.finish() {
                    yield item?;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

pub(crate) fn request_body(model: &str, turns: &[Turn], options: &RoundOptions) -> Value {
    let mut body = json!({
        "model": model,
        "messages": wire_messages(turns),
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if !options.tools.is_empty() {
        let tools = options
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                        "strict": true,
                    }
                })
            })
            .collect::<Vec<_>>();
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = json!("auto");
        body["parallel_tool_calls"] = json!(options.parallel_tool_calls);
    }
    body
}

/// Maps turns onto chat messages. Consecutive tool calls collapse into one
/// assistant message, as the API requires.
pub(crate) fn wire_messages(turns: &[Turn]) -> Vec<Value> {
    let mut out = Vec::with_capacity(turns.len());
    let mut pending_calls: Vec<Value> = Vec::new();

    for turn in turns {
        if let Turn::ToolCall {
            call_id,
            name,
            arguments,
        } = turn
        {
            pending_calls.push(json!({
                "id": call_id,
                "type": "function",
                "function": {"name": name, "arguments": arguments},
            }));
            continue;
        }
        flush_tool_calls(&mut out, &mut pending_calls);
        let message = match turn {
            Turn::System { content } | Turn::User { content } | Turn::Assistant { content } => {
                json!({"role": turn.role(), "content": content})
            }
            Turn::ToolOutput { call_id, output } => {
                json!({"role": "tool", "tool_call_id": call_id, "content": output})
            }
            Turn::ToolCall { .. } => continue,
        };
        out.push(message);
    }
    flush_tool_calls(&mut out, &mut pending_calls);
    out
}

fn flush_tool_calls(out: &mut Vec<Value>, pending: &mut Vec<Value>) {
    if pending.is_empty() {
        return;
    }
    out.push(json!({
        "role": "assistant",
        "content": Value::Null,
        "tool_calls": std::mem::take(pending),
    }));
}

/// Incremental decoder for a chat-completions SSE body.
///
/// Tool-call fragments are keyed by their `index`; only the first fragment of
/// a call carries its id and name. Open calls are closed when the choice
/// reports a finish reason.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    open_calls: Vec<(u64, String)>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl SseDecoder {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<anyhow::Result<StreamChunk>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let frame = String::from_utf8_lossy(&frame);
            for line in frame.lines() {
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                self.decode_payload(payload.trim(), &mut out);
            }
        }
        out
    }

    /// Flushes state when the body ends without a `[DONE]` frame.
    pub fn finish(&mut self) -> Vec<anyhow::Result<StreamChunk>> {
        let mut out = Vec::new();
        self.decode_payload("[DONE]", &mut out);
        out
    }

    fn decode_payload(&mut self, payload: &str, out: &mut Vec<anyhow::Result<StreamChunk>>) {
        if self.finished {
            return;
        }
        if payload == "[DONE]" {
            self.close_open_calls(out);
            self.finished = true;
            out.push(Ok(StreamChunk::Done {
                finish_reason: self
                    .finish_reason
                    .take()
                    .unwrap_or_else(|| "stop".to_string()),
                usage: self.usage.take(),
            }));
            return;
        }

        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            tracing::debug!("skipping undecodable stream frame");
            return;
        };
        if let Some(detail) = extract_openai_error(&value) {
            self.finished = true;
            out.push(Err(anyhow::anyhow!(detail)));
            return;
        }
        if let Some(usage) = extract_usage(&value) {
            self.usage = Some(usage);
        }

        let choices = value
            .get("choices")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for choice in choices {
            let delta = choice.get("delta").cloned().unwrap_or_default();

            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(Ok(StreamChunk::TextDelta(text.to_string())));
                }
            }
            if let Some(text) = delta.get("reasoning").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(Ok(StreamChunk::ReasoningDelta(text.to_string())));
                }
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in tool_calls {
                    self.decode_tool_call(call, out);
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                if !reason.is_empty() {
                    self.close_open_calls(out);
                    self.finish_reason = Some(reason.to_string());
                }
            }
        }
    }

    fn decode_tool_call(&mut self, call: &Value, out: &mut Vec<anyhow::Result<StreamChunk>>) {
        let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
        let function = call.get("function").cloned().unwrap_or_default();

        if let Some(id) = call.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) {
            if !self.open_calls.iter().any(|(_, open)| open == id) {
                let name = function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.open_calls.retain(|(idx, _)| *idx != index);
                self.open_calls.push((index, id.to_string()));
                out.push(Ok(StreamChunk::ToolCallStart {
                    id: id.to_string(),
                    name,
                }));
            }
        }

        let Some(id) = self
            .open_calls
            .iter()
            .find(|(idx, _)| *idx == index)
            .map(|(_, id)| id.clone())
        else {
            return;
        };
        let args_delta = function
            .get("arguments")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !args_delta.is_empty() {
            out.push(Ok(StreamChunk::ToolCallDelta {
                id,
                args_delta: args_delta.to_string(),
            }));
        }
    }

    fn close_open_calls(&mut self, out: &mut Vec<anyhow::Result<StreamChunk>>) {
        for (_, id) in self.open_calls.drain(..) {
            out.push(Ok(StreamChunk::ToolCallEnd { id }));
        }
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        let head: String = input.chars().take(max_chars).collect();
        format!("{head}...")
    }
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage").filter(|u| u.is_object())?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_error(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use askdb_types::ToolSchema;

    fn decode_all(body: &str) -> Vec<StreamChunk> {
        let mut decoder = SseDecoder::default();
        decoder
            .push(body.as_bytes())
            .into_iter()
            .map(|item| item.expect("chunk"))
            .collect()
    }

    #[test]
    fn tool_call_fragments_are_stitched_by_index() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"execute_sql\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"query\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"SELECT 1\\\"}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let chunks = decode_all(body);
        assert_eq!(
            chunks,
            vec![
                StreamChunk::ToolCallStart {
                    id: "call_a".to_string(),
                    name: "execute_sql".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: "call_a".to_string(),
                    args_delta: "{\"query\":".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: "call_a".to_string(),
                    args_delta: "\"SELECT 1\"}".to_string()
                },
                StreamChunk::ToolCallEnd {
                    id: "call_a".to_string()
                },
                StreamChunk::Done {
                    finish_reason: "tool_calls".to_string(),
                    usage: None
                },
            ]
        );
    }

    #[test]
    fn frames_split_across_reads_are_buffered() {
        let mut decoder = SseDecoder::default();
        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(first.is_empty());
        let second = decoder.push(b"lo\"}}]}\n\ndata: [DONE]\n\n");
        let chunks: Vec<StreamChunk> = second.into_iter().map(|c| c.expect("ok")).collect();
        assert_eq!(chunks[0], StreamChunk::TextDelta("Hello".to_string()));
        assert!(decoder.is_finished());
    }

    #[test]
    fn usage_frame_is_reported_on_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"3 projects\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":4,\"total_tokens\":14}}\n\n",
            "data: [DONE]\n\n",
        );
        let chunks = decode_all(body);
        assert_eq!(
            chunks.last(),
            Some(&StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: Some(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 4,
                    total_tokens: 14
                })
            })
        );
    }

    #[test]
    fn error_frames_surface_as_errors() {
        let mut decoder = SseDecoder::default();
        let items = decoder.push(b"data: {\"error\":{\"message\":\"Rate limit reached\"}}\n\n");
        let err = items
            .into_iter()
            .next()
            .expect("item")
            .expect_err("error frame");
        assert!(err.to_string().contains("Rate limit"));
        assert!(decoder.is_finished());
    }

    #[test]
    fn consecutive_tool_calls_share_one_assistant_message() {
        let turns = vec![
            Turn::system("rules"),
            Turn::user("q"),
            Turn::ToolCall {
                call_id: "a".to_string(),
                name: "execute_sql".to_string(),
                arguments: "{}".to_string(),
            },
            Turn::ToolCall {
                call_id: "b".to_string(),
                name: "describe_schema".to_string(),
                arguments: "{}".to_string(),
            },
            Turn::ToolOutput {
                call_id: "a".to_string(),
                output: "Result: 3".to_string(),
            },
        ];
        let messages = wire_messages(&turns);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["tool_calls"].as_array().map(Vec::len), Some(2));
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "a");
    }

    #[test]
    fn tools_are_declared_strict() {
        let options = RoundOptions {
            tools: vec![ToolSchema {
                name: "execute_sql".to_string(),
                description: "Run SQL".to_string(),
                input_schema: json!({"type": "object"}),
            }],
            parallel_tool_calls: false,
        };
        let body = request_body("gpt-4o-mini", &[Turn::user("q")], &options);
        assert_eq!(body["tools"][0]["function"]["strict"], true);
        assert_eq!(body["parallel_tool_calls"], false);
        assert_eq!(body["tool_choice"], "auto");
    }
}
