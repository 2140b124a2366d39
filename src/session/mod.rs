//! Session and per-model conversation state.
//!
//! Bounded in-memory registry of sessions with TTL-based eviction, LRU
//! eviction on size, and at-most-one active generation per session.

mod store;

pub use store::{Session, SessionStore, MAX_SESSIONS, REAPER_INTERVAL, SESSION_TTL};
