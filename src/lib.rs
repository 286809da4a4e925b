//! pyimage: compile `pyproject.toml` build targets into multi-stage
//! container build scripts and drive them across target platforms.
//!
//! Data flows one way: manifest model -> resolver -> script compiler ->
//! build orchestrator -> external build-graph engine.

pub mod cli;
pub mod core;
pub mod engine;
pub mod error;
pub mod stages;

pub use error::{Error, Result};
