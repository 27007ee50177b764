//! # ctxguard Core
//!
//! Domain types and error definitions for the ctxguard context resilience
//! engine. This crate defines the context tree every other crate operates
//! on, the error taxonomy of each pipeline stage, and the event bus that
//! carries lifecycle notifications.

pub mod error;
pub mod event;
pub mod node;

// Re-export key types at crate root for ergonomics
pub use error::{
    CompressionError, Error, NodeError, ReconstructionError, ResistError, Result,
};
pub use event::{EngineEvent, EventBus};
pub use node::{MAX_DEPTH, Node, NodePath, PathSegment, Scalar, digest_hex};
