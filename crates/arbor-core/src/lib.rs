//! Shared vocabulary for the arbor tree index: ids, the node model, the
//! external-call capability, token estimation and monitor events.

pub mod errors;
pub mod events;
pub mod ids;
pub mod provider;
pub mod tokens;
pub mod tools;
pub mod tree;
