//! # Musique Common Library
//!
//! Shared code for the Musique agent crates:
//! - Configuration types and resolution (TOML file, environment, CLI overrides)
//! - Fade curve definitions
//! - Common error type

pub mod config;
pub mod error;
pub mod fade_curves;

pub use config::{AdPolicy, AgentConfig, ConnectionMode};
pub use error::{Error, Result};
pub use fade_curves::FadeCurve;
