//! Types that cross into the host: broadcast events and the message bridge.
//!
//! Event types derive `serde::Serialize` + `serde::Deserialize` so a UI shell
//! can forward them without conversion.

pub mod bridge;
pub mod events;
