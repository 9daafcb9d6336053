//! Core abstractions for the cell-relay execution proxy.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope`/`Payload` - Wire protocol messages
//! - `ExecutionRecord` - Per-request metadata for logging and history
//! - `OutboundStore` - Broadcast + history delivery buffer for the client
//! - `Engine` trait - Seam to the wrapped execution engine

pub mod engine;
pub mod outbound;
pub mod protocol;
pub mod record;

pub use engine::{Engine, EngineChannels, EngineError};
pub use outbound::OutboundStore;
pub use protocol::{
    Envelope, ErrorOutput, ExecuteReply, ExecuteRequest, ExecutionState, Header, Payload,
    ReplyStatus, RichOutput, StreamName,
};
pub use record::{ExecutionRecord, RecordStatus};
