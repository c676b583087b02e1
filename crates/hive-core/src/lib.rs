//! hive-core — shared types, wire format, configuration, and auth primitives.
//! All other Hive crates depend on this one.

pub mod config;
pub mod crypto;
pub mod message;
pub mod task;
pub mod wire;

pub use message::{Envelope, Message, MessageKind};
pub use task::{FailureKind, Requirements, Strategy, TaskOutcome, TaskPayload};
