//! Core types for mysqlwire.
//!
//! This crate provides the pieces that do not depend on the wire protocol:
//!
//! - `Error` and its per-category payloads
//! - `TaskChain`, the sequencer that runs asynchronous steps one at a time
//! - `Outcome` and `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{CancelReason, Cx, Outcome, PanicPayload};

pub mod chain;
pub mod error;

pub use chain::{
    ChainOutcome, FailurePolicy, StepContext, StepFailure, StepFuture, StopHandle, Task,
    TaskChain, TaskState,
};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ProgrammingError,
    ProgrammingErrorKind, ProtocolError, ServerError,
};
