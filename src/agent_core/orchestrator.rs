//! Query orchestrator — the per-request pipeline.
//!
//! 1. **Validate** — reject malformed requests before any provider call
//! 2. **Route** — complexity analysis, then tier and reasoning selection
//! 3. **Prepare** — session, replayed history, memory facts, system prompt
//! 4. **Run** — the tool-calling loop against the selected provider
//! 5. **Record** — append the turn and upsert a memory fact (best effort)
//!
//! `prepare` and `run` are split so the streaming path can emit the
//! `session` and `tools` frames before the loop starts.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::complexity::{ComplexityAnalysis, ComplexityAnalyzer};
use super::errors::AgentError;
use super::memory::MemoryStore;
use super::prompt::{build_system_prompt, PromptContext};
use super::router::{ForceModel, Router, RoutingDecision};
use super::sql_executor::ConnectionRegistry;
use super::tool_catalog::ToolCatalog;
use super::tool_executor::{validate_identifier, validate_table_name, ToolExecutor};
use super::tool_loop::{LoopEvent, LoopOutcome, ToolLoop};
use super::types::SessionMode;
use crate::config::{OrchestratorConfig, ProviderConfig, ProviderKind};
use crate::inference::types::{ChatMessage, CredentialScope, Credentials, ProviderRequest};
use crate::inference::{build_adapter, effective_credentials, ModelProvider};
use crate::stream::frames::RoutingInfo;

/// Scope used for memory facts when no connection is bound.
const DEFAULT_SCOPE: &str = "default";

/// Floor for the importance of remembered question/SQL pairs.
const MIN_FACT_IMPORTANCE: f64 = 0.3;

// ─── Request / Response ─────────────────────────────────────────────────────

/// Unified query request (`POST /api/ai/query` and the stream variant).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub query: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub connection_id: Option<String>,
    pub schema: Option<String>,
    pub tables: Vec<String>,
    pub session_id: Option<String>,
    pub use_memory: Option<bool>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub force_model: Option<String>,
    pub use_thinking_mode: Option<bool>,
    pub api_key: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl QueryRequest {
    /// Credentials from the request fields, shaped for the provider kind.
    fn credentials(&self, kind: ProviderKind) -> Result<Credentials, AgentError> {
        let present = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();

        let bearer = present(&self.access_token).map(|access_token| Credentials::Bearer {
            access_token,
            refresh_token: present(&self.refresh_token),
        });
        let access_keys = match (present(&self.access_key_id), present(&self.secret_access_key)) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials::AccessKeys {
                access_key_id,
                secret_access_key,
                region: present(&self.region),
            }),
            (None, None) => None,
            _ => {
                return Err(AgentError::validation(
                    "access_key_id and secret_access_key must be given together",
                ))
            }
        };
        let api_key = present(&self.api_key).map(Credentials::ApiKey);

        let ordered = match kind {
            ProviderKind::RemoteAgent => [bearer, api_key, access_keys],
            ProviderKind::DirectSimple => [access_keys, api_key, bearer],
            ProviderKind::OpenAi | ProviderKind::Anthropic => [api_key, bearer, access_keys],
        };
        Ok(ordered.into_iter().flatten().next().unwrap_or_default())
    }
}

/// Non-streaming response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub complexity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingInfo>,
    pub incomplete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResponse {
    pub fn failure(error: &AgentError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

// ─── Prepared Query ─────────────────────────────────────────────────────────

/// Session binding reported in the `session` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBinding {
    pub session_id: Option<String>,
    pub connection_id: Option<String>,
    pub mode: SessionMode,
}

/// Everything resolved before the first provider call.
pub struct PreparedQuery {
    pub query: String,
    pub analysis: ComplexityAnalysis,
    pub decision: RoutingDecision,
    pub session: SessionBinding,
    provider: Arc<dyn ModelProvider>,
    request: ProviderRequest,
    scope: CredentialScope,
    tools: ToolExecutor,
    use_memory: bool,
}

impl PreparedQuery {
    /// Tool names declared to the model this request.
    pub fn tool_names(&self) -> Vec<String> {
        self.request.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

/// A finished pipeline run.
#[derive(Debug, Clone)]
pub struct QueryAnswer {
    pub outcome: LoopOutcome,
    pub analysis: ComplexityAnalysis,
    pub decision: RoutingDecision,
    pub session_id: Option<String>,
}

impl QueryAnswer {
    pub fn into_response(self) -> QueryResponse {
        QueryResponse {
            success: true,
            message: self.outcome.final_text,
            sql: self.outcome.sql,
            thinking: self.outcome.thinking,
            complexity: self.analysis.score,
            routing: Some(self.decision.info()),
            incomplete: self.outcome.incomplete,
            session_id: self.session_id,
            error: None,
        }
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

struct ProviderEntry {
    config: ProviderConfig,
    adapter: Arc<dyn ModelProvider>,
}

/// Shared across requests; holds only immutable state plus the store handle.
pub struct QueryOrchestrator {
    config: Arc<OrchestratorConfig>,
    catalog: Arc<ToolCatalog>,
    connections: ConnectionRegistry,
    memory: Option<Arc<MemoryStore>>,
    analyzer: ComplexityAnalyzer,
    router: Router,
    providers: HashMap<String, ProviderEntry>,
}

impl QueryOrchestrator {
    /// Orchestrator without providers; see `with_provider` and `from_config`.
    pub fn new(
        config: OrchestratorConfig,
        connections: ConnectionRegistry,
        memory: Option<Arc<MemoryStore>>,
    ) -> Self {
        let threshold = config.routing.complexity_threshold;
        Self {
            config: Arc::new(config),
            catalog: Arc::new(ToolCatalog::standard()),
            connections,
            memory,
            analyzer: ComplexityAnalyzer::new(threshold),
            router: Router::new(threshold),
            providers: HashMap::new(),
        }
    }

    /// Build every configured provider adapter.
    pub fn from_config(
        config: OrchestratorConfig,
        connections: ConnectionRegistry,
        memory: Option<Arc<MemoryStore>>,
    ) -> Result<Self, AgentError> {
        let mut orchestrator = Self::new(config, connections, memory);
        let providers: Vec<(String, ProviderConfig)> = orchestrator
            .config
            .providers
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .collect();
        for (name, cfg) in providers {
            let adapter = build_adapter(&name, &cfg, &orchestrator.config.identity)?;
            orchestrator = orchestrator.with_provider(&name, cfg, Arc::new(adapter));
        }
        tracing::info!(
            providers = ?orchestrator.provider_names(),
            connections = ?orchestrator.connections.ids(),
            memory = orchestrator.memory.is_some(),
            "query orchestrator ready"
        );
        Ok(orchestrator)
    }

    pub fn with_provider(
        mut self,
        name: &str,
        config: ProviderConfig,
        adapter: Arc<dyn ModelProvider>,
    ) -> Self {
        self.providers
            .insert(name.to_string(), ProviderEntry { config, adapter });
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    // ─── Pipeline ───────────────────────────────────────────────────────

    /// Non-streaming entry point.
    pub async fn execute(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryAnswer, AgentError> {
        let prepared = self.prepare(request)?;
        self.run(prepared, None, cancel).await
    }

    /// Validate, route, and resolve everything needed for the loop.
    pub fn prepare(&self, req: QueryRequest) -> Result<PreparedQuery, AgentError> {
        let query = req.query.trim().to_string();
        if query.is_empty() {
            return Err(AgentError::validation("query must not be empty"));
        }
        if let Some(t) = req.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(AgentError::validation(format!(
                    "temperature must be between 0 and 2 (got {t})"
                )));
            }
        }
        if req.max_tokens == Some(0) {
            return Err(AgentError::validation("max_tokens must be greater than 0"));
        }
        if let Some(ref schema) = req.schema {
            validate_identifier(schema).map_err(|_| {
                AgentError::validation(format!("invalid schema name: '{schema}'"))
            })?;
        }
        for table in &req.tables {
            validate_table_name(table)
                .map_err(|_| AgentError::validation(format!("invalid table name: '{table}'")))?;
        }
        let force_model = match req.force_model.as_deref() {
            Some(s) => ForceModel::parse(s)?,
            None => ForceModel::Auto,
        };

        let provider_name = req
            .provider
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.config.default_provider.clone());
        let entry = self.providers.get(&provider_name).ok_or_else(|| {
            AgentError::validation(format!("unknown provider: '{provider_name}'"))
        })?;

        let credentials = effective_credentials(
            &entry.config,
            &provider_name,
            req.credentials(entry.config.kind)?,
        )?;

        let connection = self.connections.resolve(req.connection_id.as_deref())?;
        let (connection_id, executor) = match connection {
            Some((id, executor)) => (Some(id), Some(executor)),
            None => (None, None),
        };
        let tools = ToolExecutor::new(Arc::clone(&self.catalog), executor, &self.config.tool_loop);

        let analysis = self.analyzer.analyze(&query, &req.tables);
        let decision = self.router.route(&analysis, force_model, req.use_thinking_mode);

        let mode = SessionMode::for_tables(&req.tables);
        let scope_name = connection_id.as_deref().unwrap_or(DEFAULT_SCOPE);
        let memory = self
            .memory
            .as_ref()
            .filter(|_| self.config.memory.enabled && req.use_memory.unwrap_or(true));
        let use_memory = memory.is_some();

        let session_id = memory.and_then(|m| {
            m.create_or_reuse_session(req.session_id.as_deref(), scope_name, mode)
        });
        let history = match (memory, session_id.as_deref()) {
            (Some(m), Some(id)) => m.history(id),
            _ => Vec::new(),
        };
        let facts = memory.map(|m| m.top_facts(scope_name)).unwrap_or_default();

        let tools_available = entry.adapter.supports_tools() && tools.has_connection();
        let system_prompt = build_system_prompt(&PromptContext {
            connection_id: connection_id.as_deref(),
            schema: req.schema.as_deref(),
            tables: &req.tables,
            tools_available,
            use_thinking: decision.use_thinking,
            facts: &facts,
        });

        let mut messages = history;
        messages.push(ChatMessage::user(query.clone()));

        let request = ProviderRequest {
            model: req.model.clone().filter(|m| !m.trim().is_empty()),
            tier: decision.tier,
            system_prompt,
            messages,
            tools: if tools_available {
                self.catalog.specs().to_vec()
            } else {
                Vec::new()
            },
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            thinking: decision.use_thinking,
            session_id: session_id.clone(),
        };

        tracing::info!(
            provider = %provider_name,
            tier = decision.tier.as_str(),
            thinking = decision.use_thinking,
            complexity = analysis.score,
            reason = %decision.reason,
            connection = ?connection_id,
            session_id = ?session_id,
            history = request.messages.len() - 1,
            tools = request.tools.len(),
            "query routed"
        );

        Ok(PreparedQuery {
            query,
            analysis,
            decision,
            session: SessionBinding {
                session_id,
                connection_id,
                mode,
            },
            provider: Arc::clone(&entry.adapter),
            request,
            scope: CredentialScope::new(credentials),
            tools,
            use_memory,
        })
    }

    /// Drive the loop and record the turn. Nothing is persisted on failure.
    pub async fn run(
        &self,
        prepared: PreparedQuery,
        events: Option<mpsc::Sender<LoopEvent>>,
        cancel: CancellationToken,
    ) -> Result<QueryAnswer, AgentError> {
        let PreparedQuery {
            query,
            analysis,
            decision,
            session,
            provider,
            request,
            mut scope,
            tools,
            use_memory,
        } = prepared;

        let mut tool_loop = ToolLoop::new(
            provider.as_ref(),
            &tools,
            self.config.tool_loop.max_rounds,
            cancel,
        );
        if let Some(tx) = events {
            tool_loop = tool_loop.with_events(tx);
        }
        let outcome = tool_loop.run(request, &mut scope).await?;

        if use_memory {
            self.record(&query, &session, &analysis, &outcome);
        }

        Ok(QueryAnswer {
            outcome,
            analysis,
            decision,
            session_id: session.session_id,
        })
    }

    fn record(
        &self,
        query: &str,
        session: &SessionBinding,
        analysis: &ComplexityAnalysis,
        outcome: &LoopOutcome,
    ) {
        let Some(ref memory) = self.memory else {
            return;
        };
        if let Some(ref id) = session.session_id {
            let mut messages = vec![ChatMessage::user(query)];
            messages.extend(outcome.messages.iter().cloned());
            memory.append_turn(id, &messages);
        }
        if let (Some(sql), false) = (&outcome.sql, outcome.incomplete) {
            let scope = session.connection_id.as_deref().unwrap_or(DEFAULT_SCOPE);
            let fact = format!("Question: {query}\nSQL: {sql}");
            memory.upsert_long_term_memory(&fact, scope, analysis.score.max(MIN_FACT_IMPORTANCE));
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
