use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::agent::response_loop::{LoopLimits, ResponseLoop};
use crate::agent::{AgentEvent, PersonaAgent};
use crate::chat::ChatServices;
use crate::config::AgentConfig;
use crate::llm_client::{ModelClient, OpenAiModelClient};
use crate::session::lifecycle::{LifecycleSettings, SessionLifecycleManager};
use crate::session::recovery::{spawn_recovery_sweep, SweepHandle};
use crate::session::{SessionStore, SqliteSessionStore};
use crate::tools::http::FetchUrlTool;
use crate::tools::search::{SearchProvider, WebSearchTool};
use crate::tools::send_message::SendMessageTool;
use crate::tools::{Tool, ToolRegistry};

/// Long-lived pieces shared by every persona invocation in this process.
pub struct AgentRuntime {
    pub config: AgentConfig,
    pub store: Arc<SqliteSessionStore>,
    pub tool_registry: Arc<ToolRegistry>,
    pub model: Arc<dyn ModelClient>,
}

pub struct AgentRuntimeBuilder {
    config: AgentConfig,
    model: Option<Arc<dyn ModelClient>>,
    search: Option<Arc<dyn SearchProvider>>,
    tools: Vec<Arc<dyn Tool>>,
}

impl AgentRuntimeBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            model: None,
            search: None,
            tools: Vec::new(),
        }
    }

    /// Use this model instead of the configured OpenAI-compatible endpoint.
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Enables the `web_search` tool.
    pub fn with_search_provider(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(provider);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub async fn build(self) -> Result<AgentRuntime> {
        let config = self.config;

        let store = Arc::new(
            SqliteSessionStore::open(&config.database_path, config.max_db_connections)
                .with_context(|| {
                    format!("Failed to open session database at {}", config.database_path)
                })?,
        );

        let tool_registry = Arc::new(ToolRegistry::new());
        register_builtin_tools(tool_registry.clone(), &config, self.search).await?;
        for tool in self.tools {
            tool_registry.register(tool).await;
        }

        let model = match self.model {
            Some(model) => model,
            None => Arc::new(OpenAiModelClient::from_config(&config)),
        };

        tracing::info!(
            server_id = %config.server_id,
            database = %config.database_path,
            tools = ?tool_registry.list_names().await,
            "Agent runtime ready"
        );

        Ok(AgentRuntime {
            config,
            store,
            tool_registry,
            model,
        })
    }
}

impl AgentRuntime {
    pub async fn bootstrap(config: AgentConfig) -> Result<Self> {
        AgentRuntimeBuilder::new(config).build().await
    }

    /// Wire a [`PersonaAgent`] to the host's chat services.
    pub fn persona_agent(
        &self,
        chat: &ChatServices,
        events: Option<Sender<AgentEvent>>,
    ) -> PersonaAgent {
        let response_loop = ResponseLoop::new(
            self.model.clone(),
            self.tool_registry.clone(),
            LoopLimits::from_config(&self.config),
        );
        let lifecycle = SessionLifecycleManager::new(
            self.store.clone(),
            response_loop,
            chat,
            LifecycleSettings::from_config(&self.config),
        );
        let agent = PersonaAgent::new(chat, lifecycle);
        match events {
            Some(events) => agent.with_events(events),
            None => agent,
        }
    }

    pub fn spawn_recovery_sweep(&self) -> SweepHandle {
        let store: Arc<dyn SessionStore> = self.store.clone();
        spawn_recovery_sweep(
            store,
            self.config.recovery_sweep_interval(),
            self.config.stale_after(),
        )
    }
}

pub async fn register_builtin_tools(
    registry: Arc<ToolRegistry>,
    config: &AgentConfig,
    search: Option<Arc<dyn SearchProvider>>,
) -> Result<()> {
    registry.register(Arc::new(SendMessageTool::new())).await;
    registry
        .register(Arc::new(FetchUrlTool::new(config.fetch_timeout())))
        .await;
    match search {
        Some(provider) => {
            registry
                .register(Arc::new(WebSearchTool::new(provider)))
                .await
        }
        None => tracing::debug!("No search provider configured; web_search disabled"),
    }
    Ok(())
}
