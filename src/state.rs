//! Shared application state.

use std::sync::Arc;

use tracing::warn;

use crate::config::ServerConfig;
use crate::core::credentials::CredentialBroker;
use crate::core::session::SessionRegistry;
use crate::core::tasks::{TaskClient, task_tool_registry};
use crate::core::tools::{Dispatcher, ToolRegistry};

/// State shared across handlers via axum's `State` extractor.
pub struct AppState {
    pub config: ServerConfig,
    pub broker: CredentialBroker,
    pub sessions: Arc<SessionRegistry>,
    pub dispatcher: Dispatcher,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: ServerConfig) -> SharedState {
        let broker = CredentialBroker::new(
            &config.openai_api_key,
            &config.realtime_model,
            &config.voice,
        );
        let tools = match &config.ticktick_access_token {
            Some(token) => task_tool_registry(TaskClient::new(&config.ticktick_base_url, token)),
            None => {
                warn!("TICKTICK_ACCESS_TOKEN not set, starting with no tools registered");
                ToolRegistry::builder().build()
            }
        };
        let dispatcher = Dispatcher::new(tools, config.tool_timeout);
        Arc::new(Self {
            config,
            broker,
            sessions: SessionRegistry::new(),
            dispatcher,
        })
    }
}
