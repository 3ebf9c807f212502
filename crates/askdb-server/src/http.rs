use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{body::Body, Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use askdb_core::{ChatRequest, ModelHint};
use askdb_wire::NDJSON_CONTENT_TYPE;

use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

fn error_response(status: StatusCode, error: impl Into<String>, code: &str) -> Response {
    (
        status,
        Json(ErrorEnvelope {
            error: error.into(),
            code: Some(code.to_string()),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize, Default)]
struct ChatQuery {
    provider: Option<String>,
    model: Option<String>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "askdb listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat", post(chat))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn chat(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let tenant = match state.tenants.resolve(&headers).await {
        Ok(tenant) => tenant,
        Err(err) => {
            let status = match err {
                crate::TenantError::Unauthenticated => StatusCode::UNAUTHORIZED,
                crate::TenantError::MissingTenant => StatusCode::FORBIDDEN,
            };
            return error_response(status, err.to_string(), err.code());
        }
    };

    if !state.allow_model_override && (query.provider.is_some() || query.model.is_some()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "provider and model selection is disabled on this server",
            "MODEL_OVERRIDE_DISABLED",
        );
    }

    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                rejection.body_text(),
                "INVALID_REQUEST",
            )
        }
    };
    let settings = state.chat.settings();
    let validated = match request.validate(state.chat.catalog(), settings.history_window) {
        Ok(validated) => validated,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string(), err.code()),
    };

    let cancel = CancellationToken::new();
    // Dropped with the response body, so a client disconnect cancels the run.
    let disconnect = cancel.clone().drop_guard();
    let chunks = state.chat.start(
        &tenant.tenant_id,
        validated,
        ModelHint {
            provider_id: query.provider,
            model_id: query.model,
        },
        cancel,
    );
    let body = chunks.map(move |chunk| {
        let _ = &disconnect;
        Ok::<String, Infallible>(chunk.to_ndjson_line())
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use askdb_core::{ChatService, ChatSettings};
    use askdb_guard::SchemaCatalog;
    use askdb_providers::{Provider, ProviderRegistry, ScriptStep, ScriptedProvider};
    use askdb_tools::{NoopCache, SqlToolSettings, ToolRegistry};
    use askdb_warehouse::SqliteBackend;
    use askdb_wire::Chunk;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::{HeaderTenantResolver, TENANT_HEADER};

    fn test_state(rounds: Vec<Vec<ScriptStep>>) -> AppState {
        let catalog = Arc::new(SchemaCatalog::builtin());
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(rounds));
        let tools = ToolRegistry::sql_tools(
            catalog.clone(),
            Arc::new(SqliteBackend::demo().expect("demo backend")),
            Arc::new(NoopCache),
            SqlToolSettings::default(),
        );
        let chat = ChatService::new(
            ProviderRegistry::from_providers(vec![provider], None),
            tools,
            catalog,
            ChatSettings::default(),
        );
        AppState::new(
            chat,
            Arc::new(HeaderTenantResolver::new(Some("test-token".to_string()))),
        )
    }

    fn chat_request(body: &str, token: Option<&str>, tenant: Option<&str>) -> Request<Body> {
        chat_request_to("/api/chat", body, token, tenant)
    }

    fn chat_request_to(
        uri: &str,
        body: &str,
        token: Option<&str>,
        tenant: Option<&str>,
    ) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    async fn json_body(resp: Response) -> Value {
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&body).expect("json")
    }

    #[tokio::test]
    async fn health_route_is_open() {
        let app = app_router(test_state(Vec::new()));
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_requires_token_then_tenant() {
        let body = r#"{"content":"how many projects?"}"#;

        let resp = app_router(test_state(Vec::new()))
            .oneshot(chat_request(body, None, Some("acme")))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["code"], "AUTH_REQUIRED");

        let resp = app_router(test_state(Vec::new()))
            .oneshot(chat_request(body, Some("test-token"), None))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["code"], "TENANT_REQUIRED");
    }

    #[tokio::test]
    async fn invalid_bodies_are_rejected_before_streaming() {
        let resp = app_router(test_state(Vec::new()))
            .oneshot(chat_request(
                r#"{"content":"   "}"#,
                Some("test-token"),
                Some("acme"),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "INVALID_CONTENT");

        let resp = app_router(test_state(Vec::new()))
            .oneshot(chat_request(
                r#"{"content":"q","preferredTable":"secrets"}"#,
                Some("test-token"),
                Some("acme"),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "INVALID_PREFERRED_TABLE");

        let resp = app_router(test_state(Vec::new()))
            .oneshot(chat_request("{", Some("test-token"), Some("acme")))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn chat_streams_ndjson_chunks() {
        let state = test_state(vec![
            ScriptedProvider::tool_calls(&[(
                "c1",
                "execute_sql",
                r#"{"query":"SELECT count(*) AS n FROM projects"}"#,
            )]),
            ScriptedProvider::text(&["You have ", "2 projects."]),
        ]);
        let resp = app_router(state)
            .oneshot(chat_request(
                r#"{"content":"how many projects?"}"#,
                Some("test-token"),
                Some("globex"),
            ))
            .await
            .expect("response");

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some(NDJSON_CONTENT_TYPE)
        );
        assert_eq!(
            resp.headers()
                .get(header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok()),
            Some("no-cache, no-transform")
        );

        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        let chunks: Vec<Chunk> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("chunk line"))
            .collect();
        assert!(chunks.len() >= 2);
        let last = chunks.last().expect("terminal chunk");
        assert_eq!(last.text(), Some("You have 2 projects."));
        assert_eq!(last.error, None);
    }

    #[tokio::test]
    async fn provider_failure_is_reported_in_band() {
        let state = test_state(vec![vec![ScriptStep::Reject(
            "status 500 upstream exploded".to_string(),
        )]]);
        let resp = app_router(state)
            .oneshot(chat_request(
                r#"{"content":"q"}"#,
                Some("test-token"),
                Some("acme"),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let chunk: Chunk = serde_json::from_str(lines[0]).expect("chunk");
        assert!(chunk.is_error());
        assert!(!lines[0].contains("exploded"));
    }

    #[tokio::test]
    async fn model_selection_requires_opt_in() {
        let body = r#"{"content":"q"}"#;
        let uri = "/api/chat?provider=scripted&model=gpt-4o";

        let resp = app_router(test_state(vec![ScriptedProvider::text(&["hi"])]))
            .oneshot(chat_request_to(uri, body, Some("test-token"), Some("acme")))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "MODEL_OVERRIDE_DISABLED");

        let state = test_state(vec![ScriptedProvider::text(&["hi"])]).with_model_override(true);
        let resp = app_router(state)
            .oneshot(chat_request_to(uri, body, Some("test-token"), Some("acme")))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
