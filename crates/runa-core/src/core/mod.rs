//! Core runtime: agent loop, stream assembly, context management,
//! events, and the error taxonomy.

pub mod agent;
pub(crate) mod assembler;
pub mod context;
pub mod errors;
pub mod events;
