use crate::methods::MethodCallHandler;
use crate::registry::SessionRegistry;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Live sessions (texture id → session)
    pub registry: Arc<SessionRegistry>,

    /// Dispatcher for `POST /methods`
    pub methods: Arc<MethodCallHandler>,
}

impl AppState {
    pub fn new(methods: MethodCallHandler) -> Self {
        Self {
            registry: Arc::clone(methods.registry()),
            methods: Arc::new(methods),
        }
    }
}
