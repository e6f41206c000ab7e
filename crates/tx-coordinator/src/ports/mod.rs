//! # Ports
//!
//! Hexagonal boundaries of the coordinator.

pub mod inbound;
pub mod outbound;

pub use inbound::{Synchronization, XaResource};
pub use outbound::{Connection, TransactionFactory, TransactionManager, UserTransaction};
