//! Shared utilities.
//!
//! Process bootstrap, the clock abstraction, and the contention retry wrapper.

pub mod bootstrap;
pub mod clock;
pub mod retry;
