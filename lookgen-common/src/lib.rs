//! Shared types for the lookgen services
//!
//! Provides the common error type, the engine event bus, and configuration
//! loading used by lookgen-engine (and any future lookgen modules).

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
pub use events::{EngineEvent, EventBus};
