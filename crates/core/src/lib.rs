//! `requeue-core`: shared building blocks for the retry/dead-letter engine.
//!
//! This crate holds **pure** data types (no broker or process concerns): the
//! message/record model, the reserved header set, the typed processing failure,
//! the clock abstraction and the process-wide configuration.

pub mod clock;
pub mod config;
pub mod error;
pub mod failure;
pub mod headers;
pub mod message;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OverlapPolicy, RequeueConfig, Topics};
pub use error::{ConfigError, HeaderError};
pub use failure::{FailureReason, ProcessingFailure};
pub use headers::Headers;
pub use message::{Message, Record};
