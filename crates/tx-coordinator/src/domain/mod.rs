//! # Domain Module
//!
//! Core domain types for the transaction coordination layer.

pub mod context;
pub mod diagnostics;
pub mod errors;
pub mod value_objects;

pub use context::*;
pub use diagnostics::*;
pub use errors::*;
pub use value_objects::*;
