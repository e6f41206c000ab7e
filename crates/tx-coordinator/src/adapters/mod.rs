//! # Adapters Layer (Hexagonal Architecture)
//!
//! Implements the outbound backend ports.

mod in_memory;

pub use in_memory::{
    InMemoryConnection, InMemoryTransactionFactory, InMemoryTransactionManager, IN_MEMORY_BACKEND,
};
