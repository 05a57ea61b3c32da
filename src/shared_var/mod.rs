//! Shared variables - named, distributed state with access control
//!
//! This module owns the metadata side of shared variables: who may write
//! them and who wants to hear about writes. Storing the values is left to
//! the caller.

mod info;
mod registry;

pub use info::*;
pub use registry::*;

use thiserror::Error;

/// Shared variable errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedVarError {
    #[error("Unknown shared variable: {0}")]
    UnknownVariable(String),

    #[error("Module '{module}' may not write shared variable '{variable}'")]
    WriteDenied { variable: String, module: String },

    #[error("Explicit writer list is empty; omit it to allow every module")]
    EmptyWriterList,

    #[error("Cannot change {field} of shared variable '{variable}' after creation")]
    ImmutableField {
        variable: String,
        field: &'static str,
    },

    #[error("Invalid shared variable name: {0:?}")]
    InvalidName(String),
}

pub type SharedVarResult<T> = Result<T, SharedVarError>;
