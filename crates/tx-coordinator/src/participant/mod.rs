//! # Participants
//!
//! Resource participants this layer enlists in backend transactions.

pub mod debug;
pub mod runtime;
pub mod timeout;
pub mod timeout_watch;

pub use debug::{is_registered, log_running_transactions, running_transactions, DebugParticipant};
pub use runtime::{Participant, ParticipantRuntime, DEFAULT_TIMEOUT_UNIT};
pub use timeout::{TimeoutCallback, TimeoutMonitor};
pub use timeout_watch::{TimeoutTarget, TimeoutWatch};
