use std::sync::Arc;

use askdb_core::ChatService;

mod http;
mod tenant;

pub use http::{app_router, serve};
pub use tenant::{HeaderTenantResolver, TenantContext, TenantError, TenantResolver, TENANT_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub tenants: Arc<dyn TenantResolver>,
    /// Whether callers may pick the provider and model per request.
    pub allow_model_override: bool,
}

impl AppState {
    pub fn new(chat: ChatService, tenants: Arc<dyn TenantResolver>) -> Self {
        Self {
            chat,
            tenants,
            allow_model_override: false,
        }
    }

    pub fn with_model_override(mut self, allow: bool) -> Self {
        self.allow_model_override = allow;
        self
    }
}
