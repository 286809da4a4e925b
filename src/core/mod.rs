//! Core logic: manifest types, parsing, version solving, resolution,
//! script compilation and multi-platform orchestration.

pub mod codegen;
pub mod executor;
pub mod expand;
pub mod options;
pub mod parser;
pub mod platform;
pub mod resolver;
pub mod types;
pub mod version;
