//! Agent execution runtime.
//!
//! Orchestrates turn-based conversations between a user, a streaming
//! language-model backend, and a set of registered tools. The model's
//! streamed output is assembled into text and tool calls; tools run
//! sequentially with their results appended to the durable session
//! context; the loop continues until the model completes without
//! requesting a tool. Sessions live behind the [`store::SessionStore`]
//! trait and survive process restarts.
//!
//! The model itself is pluggable via [`model::ModelBackend`]; the runtime
//! contains no provider-specific code.

pub mod config;
pub mod core;
pub mod model;
pub mod session;
pub mod store;
pub mod tools;

pub use config::RuntimeConfig;
pub use config::TurnPolicy;
pub use core::agent::create_event_channel;
pub use core::agent::AgentEventRx;
pub use core::agent::AgentEventTx;
pub use core::agent::AgentRuntime;
pub use core::errors::ErrorKind;
pub use core::errors::RuntimeError;
pub use core::errors::RuntimeResult;
pub use core::events::AgentEvent;
pub use core::events::ToolOutput;
pub use model::ModelBackend;
pub use model::ModelError;
pub use model::ModelEvent;
pub use model::ModelStream;
pub use model::Summarizer;
pub use session::ContentBlock;
pub use session::Message;
pub use session::MessageContent;
pub use session::Role;
pub use session::Session;
pub use session::TurnRecord;
pub use store::FileStore;
pub use store::MemoryStore;
pub use store::SessionStore;
pub use tools::ToolDescriptor;
pub use tools::ToolRegistry;
pub use tools::ToolSchema;
