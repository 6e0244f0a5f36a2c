// src/lib.rs

// Import the top-level `crewforge` module.
pub mod crewforge;

// Re-export the submodules at the crate root so callers write
// `crewforge::engine::Engine` instead of `crewforge::crewforge::engine::Engine`.
pub use crewforge::{
    client_wrapper, clients, completion, config, engine, event, extractor, project_store,
    publisher, registry, routing, server, workflow,
};

// Re-exporting key items for easier external access.
pub use crewforge::client_wrapper::{
    ClientWrapper, Completion, LlmError, LlmErrorKind, Message, Role,
};
pub use crewforge::config::EngineConfig;
pub use crewforge::engine::Engine;
pub use crewforge::event::WorkflowEvent;
pub use crewforge::workflow::{AgentRole, AgentSpec, WorkflowRequest, WorkflowStatus};
