//! Tablestream - single-table entity persistence with change data capture
//!
//! Entities of many types share one key-value table. Every mutation lands
//! on the table's change stream, is normalized and republished on an event
//! bus, and projectors turn those events back into derived entities.

pub mod bus;
pub mod cdc;
pub mod config;
pub mod entity;
pub mod handlers;
pub mod storage;
pub mod telemetry;
pub mod utils;
