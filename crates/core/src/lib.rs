//! # voxrelay Core
//!
//! Domain types, traits, and error definitions for the voxrelay response
//! pipeline. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (delivery surface, worker pool, speech sink)
//! is defined as a trait here. Implementations live with the host-platform
//! integration, outside this workspace. This enables:
//! - Testing the whole pipeline against in-process fakes
//! - Swapping host platforms without touching pipeline logic
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod surface;
pub mod worker;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{ConversationTurn, Message, Role, SessionKey, ToolDefinition, ToolInvocation};
pub use surface::{DeliverySurface, MessageHandle, SpeechSink};
pub use worker::{WorkerHandle, WorkerPool};
