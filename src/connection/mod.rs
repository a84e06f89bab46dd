//! Operator link: lifecycle, reconnection and message routing

mod backoff;
mod manager;

pub use backoff::Backoff;
pub use manager::{ConnectionEvent, ConnectionManager, LinkState, Outbound};
