//! Crate-level error type.
//!
//! Each layer owns a `thiserror` enum; this one aggregates them so library
//! users can `?` across the whole pipeline.

use thiserror::Error;

use crate::core::codegen::CompileError;
use crate::core::executor::BuildError;
use crate::core::options::OptionsError;
use crate::core::parser::ManifestError;
use crate::core::resolver::ResolveError;

/// Any failure of a pyimage invocation.
#[derive(Debug, Error)]
pub enum Error {
    /// The manifest could not be read or decoded.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The manifest decoded but no consistent configuration exists.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The resolved configuration could not be rendered.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Frontend options were malformed.
    #[error(transparent)]
    Options(#[from] OptionsError),

    /// A platform build failed.
    #[error(transparent)]
    Build(#[from] BuildError),
}

pub type Result<T> = std::result::Result<T, Error>;
