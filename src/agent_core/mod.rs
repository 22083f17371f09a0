//! Agent Core — orchestration layer for the query service.
//!
//! Submodules:
//! - `complexity`: Heuristic query complexity scoring
//! - `router`: Tier and reasoning-mode selection from the complexity score
//! - `tool_catalog`: The fixed set of data tools declared to models
//! - `tool_executor`: Read-only enforcement, masking, and bounded-parallel dispatch
//! - `sql_executor`: SQL backend seam plus the SQLite reference executor
//! - `tool_loop`: Model ⇄ tool round driver with round cap and cancellation
//! - `prompt`: System prompt assembly
//! - `memory`: Sessions, turns, and long-term facts (best effort)
//! - `database`: SQLite persistence behind the memory store
//! - `tokens`: Token estimation for history budgets
//! - `orchestrator`: The per-request pipeline
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod complexity;
pub mod database;
pub mod errors;
pub mod memory;
pub mod orchestrator;
pub mod prompt;
pub mod router;
pub mod sql_executor;
pub mod tokens;
pub mod tool_catalog;
pub mod tool_executor;
pub mod tool_loop;
pub mod types;

// Re-exports for convenience
pub use complexity::{ComplexityAnalysis, ComplexityAnalyzer};
pub use database::AgentDatabase;
pub use errors::AgentError;
pub use memory::MemoryStore;
pub use orchestrator::{QueryOrchestrator, QueryRequest, QueryResponse};
pub use router::{ForceModel, Router, RoutingDecision};
pub use sql_executor::{ConnectionRegistry, SqlExecutor, SqliteExecutor};
pub use tool_catalog::ToolCatalog;
pub use tool_executor::ToolExecutor;
pub use tool_loop::{LoopEvent, LoopOutcome, ToolLoop};
pub use types::{MemoryFact, Session, SessionMode, Turn};
