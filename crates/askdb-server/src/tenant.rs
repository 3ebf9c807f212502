use async_trait::async_trait;
use axum::http::header;
use axum::http::HeaderMap;
use thiserror::Error;

pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenantError {
    #[error("missing or invalid API token")]
    Unauthenticated,
    #[error("no organization is associated with this request")]
    MissingTenant,
}

impl TenantError {
    pub fn code(&self) -> &'static str {
        match self {
            TenantError::Unauthenticated => "AUTH_REQUIRED",
            TenantError::MissingTenant => "TENANT_REQUIRED",
        }
    }
}

/// Maps an incoming request to the organization it acts for.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> Result<TenantContext, TenantError>;
}

/// Development resolver: a shared bearer token plus an `x-tenant-id` header.
/// With no token configured every caller is accepted.
pub struct HeaderTenantResolver {
    api_token: Option<String>,
}

impl HeaderTenantResolver {
    pub fn new(api_token: Option<String>) -> Self {
        Self {
            api_token: api_token.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[async_trait]
impl TenantResolver for HeaderTenantResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Result<TenantContext, TenantError> {
        if let Some(expected) = &self.api_token {
            if extract_bearer_token(headers).as_deref() != Some(expected.as_str()) {
                return Err(TenantError::Unauthenticated);
            }
        }
        let tenant_id = headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| is_valid_tenant_id(v))
            .ok_or(TenantError::MissingTenant)?;
        Ok(TenantContext {
            tenant_id: tenant_id.to_string(),
        })
    }
}

fn is_valid_tenant_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
