use std::sync::Arc;
use std::time::Duration;

use askdb_core::agent_loop::{
    BUDGET_EXHAUSTED_OUTPUT, EMPTY_ANSWER_MESSAGE, PROVIDER_ERROR_MESSAGE, TIMEOUT_MESSAGE,
    TOOL_CAP_MESSAGE, TOOL_CAP_NOTE,
};
use askdb_core::{
    ChatRequest, ChatService, ChatSettings, ModelHint, TerminationReason, ValidatedRequest,
};
use askdb_guard::SchemaCatalog;
use askdb_providers::{Provider, ProviderRegistry, ScriptStep, ScriptedProvider, StreamChunk};
use askdb_tools::{NoopCache, SqlToolSettings, ToolRegistry};
use askdb_types::{Row, Turn};
use askdb_warehouse::{QueryBackend, SqliteBackend, WarehouseResult};
use askdb_wire::Chunk;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn settings(max_tool_calls: usize) -> ChatSettings {
    ChatSettings {
        max_tool_calls,
        ..ChatSettings::default()
    }
}

fn service(
    rounds: Vec<Vec<ScriptStep>>,
    settings: ChatSettings,
) -> (ChatService, Arc<ScriptedProvider>) {
    let catalog = Arc::new(SchemaCatalog::builtin());
    let provider = Arc::new(ScriptedProvider::new(rounds));
    let providers =
        ProviderRegistry::from_providers(vec![provider.clone() as Arc<dyn Provider>], None);
    let tools = ToolRegistry::sql_tools(
        catalog.clone(),
        Arc::new(SqliteBackend::demo().expect("demo backend")),
        Arc::new(NoopCache),
        SqlToolSettings::default(),
    );
    (ChatService::new(providers, tools, catalog, settings), provider)
}

fn request(content: &str) -> ValidatedRequest {
    ChatRequest {
        content: content.to_string(),
        preferred_table: None,
        history: Vec::new(),
    }
    .validate(&SchemaCatalog::builtin(), 10)
    .expect("valid request")
}

fn sql(query: &str) -> String {
    json!({ "query": query }).to_string()
}

fn text_then_call(text: &str, id: &str, args: &str) -> Vec<ScriptStep> {
    let mut steps = vec![ScriptStep::Chunk(StreamChunk::TextDelta(text.to_string()))];
    steps.extend(ScriptedProvider::tool_calls(&[(id, "execute_sql", args)]));
    steps
}

fn tool_outputs(turns: &[Turn]) -> Vec<&str> {
    turns
        .iter()
        .filter_map(|turn| match turn {
            Turn::ToolOutput { output, .. } => Some(output.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn two_queries_then_an_answer() {
    let projects = sql("SELECT count(*) AS n FROM projects");
    let open_tasks = sql("SELECT count(*) AS n FROM tasks WHERE status = 'open'");
    let (service, provider) = service(
        vec![
            ScriptedProvider::tool_calls(&[("c1", "execute_sql", &projects)]),
            ScriptedProvider::tool_calls(&[("c2", "execute_sql", &open_tasks)]),
            ScriptedProvider::text(&["Acme has ", "4 projects."]),
        ],
        settings(5),
    );

    let (outcome, chunks) = service
        .run_to_end(
            "acme",
            request("How many projects do we have?"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.reason, TerminationReason::Completed);
    assert_eq!(outcome.tool_call_count, 2);
    let last = chunks.last().expect("terminal chunk");
    assert_eq!(last.text(), Some("Acme has 4 projects."));
    assert_eq!(last.error, None);
    assert_eq!(last.detected_table_intent, None);
    assert!(chunks.iter().all(|c| !c.is_error()));
    assert_eq!(chunks[0].text(), Some("Acme has "));

    let recorded = provider.recorded().await;
    assert_eq!(recorded.len(), 3);
    assert!(matches!(
        &recorded[0].turns[0],
        Turn::System { content } if content.contains("Tables:")
    ));
    assert_eq!(
        recorded[0].tool_names,
        vec!["describe_schema".to_string(), "execute_sql".to_string()]
    );
    assert_eq!(tool_outputs(&recorded[1].turns), vec!["Result: 4"]);
    let third = tool_outputs(&recorded[2].turns);
    assert_eq!(third.len(), 2);
    assert!(third[1].starts_with("Result: "), "{}", third[1]);
}

#[tokio::test]
async fn tool_cap_ends_with_a_non_error_chunk() {
    let query = sql("SELECT count(*) FROM invoices");
    let (service, provider) = service(
        vec![
            text_then_call("Checking invoices.", "c1", &query),
            text_then_call("Still looking.", "c2", &query),
            ScriptedProvider::text(&["never requested"]),
        ],
        ChatSettings {
            parallel_tool_calls: true,
            ..settings(2)
        },
    );

    let (outcome, chunks) = service
        .run_to_end(
            "acme",
            request("Total invoiced?"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.reason, TerminationReason::MaxToolCalls);
    assert_eq!(outcome.tool_call_count, 2);
    let last = chunks.last().expect("terminal chunk");
    assert_eq!(last.error, None);
    assert_eq!(
        last.text(),
        Some(format!("Still looking.\n\n{TOOL_CAP_NOTE}").as_str())
    );
    assert_eq!(provider.remaining_rounds().await, 1);

    let recorded = provider.recorded().await;
    assert!(recorded[0].parallel_tool_calls);
    assert!(!recorded[1].parallel_tool_calls);
}

#[tokio::test]
async fn budget_overrun_inside_a_batch_drops_the_rest() {
    let query = sql("SELECT count(*) FROM tasks");
    let (service, provider) = service(
        vec![ScriptedProvider::tool_calls(&[
            ("c1", "execute_sql", &query),
            ("c2", "execute_sql", &query),
            ("c3", "execute_sql", &query),
        ])],
        settings(1),
    );

    let (outcome, chunks) = service
        .run_to_end(
            "acme",
            request("How many tasks?"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.reason, TerminationReason::MaxToolCalls);
    assert_eq!(outcome.tool_call_count, 1);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text(), Some(TOOL_CAP_MESSAGE));
    assert_eq!(provider.recorded().await.len(), 1);
}

#[tokio::test]
async fn calls_within_budget_all_run() {
    let query = sql("SELECT count(*) FROM tasks");
    let (service, provider) = service(
        vec![
            ScriptedProvider::tool_calls(&[
                ("c1", "execute_sql", &query),
                ("c2", "execute_sql", &query),
            ]),
            ScriptedProvider::text(&["done"]),
        ],
        settings(3),
    );
    let (outcome, _) = service
        .run_to_end(
            "acme",
            request("q"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(outcome.tool_call_count, 2);
    let recorded = provider.recorded().await;
    let outputs = tool_outputs(&recorded[1].turns);
    assert_eq!(outputs.len(), 2);
    assert!(!outputs.contains(&BUDGET_EXHAUSTED_OUTPUT));
}

#[tokio::test]
async fn guard_rejections_and_bad_calls_go_back_to_the_model() {
    let (service, provider) = service(
        vec![
            vec![
                ScriptStep::Chunk(StreamChunk::ToolCallStart {
                    id: "c1".to_string(),
                    name: "execute_sql".to_string(),
                }),
                ScriptStep::Chunk(StreamChunk::ToolCallDelta {
                    id: "c1".to_string(),
                    args_delta: "{\"query\": \"SELECT * FROM ".to_string(),
                }),
                ScriptStep::Chunk(StreamChunk::ToolCallStart {
                    id: "c2".to_string(),
                    name: "drop_everything".to_string(),
                }),
                ScriptStep::Chunk(StreamChunk::ToolCallDelta {
                    id: "c1".to_string(),
                    args_delta: "secrets\"}".to_string(),
                }),
                ScriptStep::Chunk(StreamChunk::ToolCallEnd { id: "c1".to_string() }),
                ScriptStep::Chunk(StreamChunk::ToolCallEnd { id: "c2".to_string() }),
                ScriptStep::Chunk(StreamChunk::Done {
                    finish_reason: "tool_calls".to_string(),
                    usage: None,
                }),
            ],
            ScriptedProvider::tool_calls(&[("c3", "execute_sql", "{\"query\": ")]),
            ScriptedProvider::text(&["I can't access that table."]),
        ],
        settings(5),
    );

    let (outcome, chunks) = service
        .run_to_end(
            "acme",
            request("Show secrets"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.reason, TerminationReason::Completed);
    assert_eq!(outcome.tool_call_count, 3);
    assert_eq!(chunks.last().and_then(Chunk::text), Some("I can't access that table."));

    let recorded = provider.recorded().await;
    assert_eq!(
        tool_outputs(&recorded[1].turns),
        vec![
            "Query rejected (DISALLOWED_TABLE): table `secrets` is not available for querying",
            "Unknown tool: drop_everything",
        ]
    );
    let third = tool_outputs(&recorded[2].turns);
    assert!(third[2].starts_with("Invalid arguments for execute_sql"), "{}", third[2]);
}

#[tokio::test]
async fn empty_completion_still_sends_a_terminal_chunk() {
    let (service, _) = service(vec![ScriptedProvider::text(&[])], settings(5));
    let (outcome, chunks) = service
        .run_to_end(
            "acme",
            request("hello?"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(outcome.reason, TerminationReason::Completed);
    assert_eq!(chunks, vec![Chunk::content(EMPTY_ANSWER_MESSAGE)]);
}

#[tokio::test]
async fn provider_rejection_is_sanitized() {
    let (service, _) = service(
        vec![vec![ScriptStep::Reject(
            "provider stream request failed with status 401 Unauthorized: sk-live-123".to_string(),
        )]],
        settings(5),
    );
    let (outcome, chunks) = service
        .run_to_end(
            "acme",
            request("q"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(outcome.reason, TerminationReason::Error);
    assert_eq!(chunks, vec![Chunk::error(PROVIDER_ERROR_MESSAGE)]);
}

#[tokio::test]
async fn mid_stream_failure_ends_with_one_error_chunk() {
    let (service, _) = service(
        vec![vec![
            ScriptStep::Chunk(StreamChunk::TextDelta("Half an ans".to_string())),
            ScriptStep::Fail("connection reset by peer".to_string()),
        ]],
        settings(5),
    );
    let (outcome, chunks) = service
        .run_to_end(
            "acme",
            request("q"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(outcome.reason, TerminationReason::Error);
    assert_eq!(
        chunks,
        vec![Chunk::content("Half an ans"), Chunk::error(PROVIDER_ERROR_MESSAGE)]
    );
}

#[tokio::test(start_paused = true)]
async fn request_deadline_produces_timeout_chunk() {
    let (service, _) = service(
        vec![vec![ScriptStep::Stall]],
        ChatSettings {
            request_timeout: Duration::from_secs(2),
            ..settings(5)
        },
    );
    let (outcome, chunks) = service
        .run_to_end(
            "acme",
            request("q"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(outcome.reason, TerminationReason::Timeout);
    assert_eq!(chunks, vec![Chunk::error(TIMEOUT_MESSAGE)]);
}

struct HangingBackend;

#[async_trait::async_trait]
impl QueryBackend for HangingBackend {
    fn name(&self) -> &'static str {
        "hanging"
    }

    async fn run(&self, _sql: &str) -> WarehouseResult<Vec<Row>> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn request_deadline_interrupts_a_running_query() {
    let catalog = Arc::new(SchemaCatalog::builtin());
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_calls(&[("c1", "execute_sql", &sql("SELECT id FROM projects"))]),
        ScriptedProvider::text(&["never reached"]),
    ]));
    let tools = ToolRegistry::sql_tools(
        catalog.clone(),
        Arc::new(HangingBackend),
        Arc::new(NoopCache),
        SqlToolSettings {
            max_rows: 100,
            query_timeout: Duration::from_secs(60),
        },
    );
    let service = ChatService::new(
        ProviderRegistry::from_providers(vec![provider.clone() as Arc<dyn Provider>], None),
        tools,
        catalog,
        ChatSettings {
            request_timeout: Duration::from_secs(2),
            ..settings(5)
        },
    );

    let started = tokio::time::Instant::now();
    let (outcome, chunks) = service
        .run_to_end(
            "acme",
            request("q"),
            ModelHint::default(),
            CancellationToken::new(),
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.reason, TerminationReason::Timeout);
    assert_eq!(outcome.tool_call_count, 1);
    assert_eq!(chunks, vec![Chunk::error(TIMEOUT_MESSAGE)]);
    assert_eq!(provider.recorded().await.len(), 1);
}

#[tokio::test]
async fn abort_stops_the_stream_without_a_terminal_chunk() {
    let (service, _) = service(
        vec![vec![
            ScriptStep::Chunk(StreamChunk::TextDelta("Working on it".to_string())),
            ScriptStep::Stall,
        ]],
        settings(5),
    );
    let cancel = CancellationToken::new();
    let mut stream = service.start("acme", request("q"), ModelHint::default(), cancel.clone());

    let first = stream.next().await.expect("first chunk");
    assert_eq!(first.text(), Some("Working on it"));
    cancel.cancel();

    let rest = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream ends after abort");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn history_reaches_the_model_before_the_question() {
    let (service, provider) = service(vec![ScriptedProvider::text(&["ok"])], settings(5));
    let request = ChatRequest {
        content: "and globex?".to_string(),
        preferred_table: Some("projects".to_string()),
        history: serde_json::from_value(json!([
            {"role": "user", "content": "how many projects?"},
            {"role": "assistant", "content": "Something broke", "isError": true},
            {"role": "assistant", "content": "You have 4."}
        ]))
        .expect("history"),
    }
    .validate(&SchemaCatalog::builtin(), 10)
    .expect("valid");

    service
        .run_to_end("acme", request, ModelHint::default(), CancellationToken::new())
        .await;

    let turns = &provider.recorded().await[0].turns;
    assert_eq!(
        &turns[1..],
        &[
            Turn::user("how many projects?"),
            Turn::assistant("You have 4."),
            Turn::user("and globex?"),
        ]
    );
    assert!(matches!(&turns[0], Turn::System { content } if content.contains("`projects` table")));
}
