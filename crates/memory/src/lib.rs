//! Time-boxed, size-capped conversational memory.
//!
//! Each session owns an ordered buffer of turns. Non-permanent turns
//! expire after a configured age; every session is capped at a maximum
//! turn count with oldest-first eviction. The whole store snapshots to a
//! JSON file after each mutation and reloads (expiry-filtered) at startup.

mod store;

pub use store::{MemoryStore, SessionBuffer};
