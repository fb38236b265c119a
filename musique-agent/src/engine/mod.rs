//! Connection orchestration
//!
//! **Module Structure:**
//! - `collaborators.rs`: interfaces to the backend, push service and device
//! - `core.rs`: Engine lifecycle and the connect/stream/backoff loop

pub mod collaborators;
mod core;

pub use self::core::{Collaborators, Engine, EngineSettings};
pub use collaborators::{Credentials, LoginClient, PushChannel, PushConnector, StreamResolver};
