//! Event handlers driven by the bus.

pub mod projector;
