//! # Cadence Core
//!
//! Domain types, collaborator traits, and error definitions for the Cadence
//! agent execution core. This crate has **no framework dependencies**: it
//! defines the model that every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (language model, tool registry, permission
//! gate, stream observer) is a trait here. The agent crate composes them;
//! concrete providers and tools live elsewhere. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted/mock implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod message;
pub mod observer;
pub mod permission;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Conversation, ConversationId, Message, MessageToolCall, Role};
pub use observer::{ChannelObserver, NoopObserver, StdoutObserver, StreamObserver};
pub use permission::{
    AllowAll, CachingGate, DelegatingGate, PermissionDecision, PermissionGate, PolicyGate,
};
pub use provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta,
    ToolDefinition, Usage,
};
pub use tool::{Tool, ToolCallRequest, ToolParams, ToolRegistry, ToolResult};
