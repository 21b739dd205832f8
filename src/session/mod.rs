// src/session/mod.rs
//! Session continuity
//!
//! - **Storage**: Durable (SQLite) and tab-scoped (in-memory) key/value scopes
//! - **Identity**: Anonymous id, user id and the persisted session record
//! - **Controller**: Start / resume / heartbeat / end state machine
//!
//! Every payload the agent emits is stamped from [`SessionController::current`]
//! at construction time, never from a cached copy.

pub mod controller;
pub mod identity;
pub mod storage;

// Re-export commonly used types
pub use controller::{SessionConfig, SessionContext, SessionController, SessionState};
pub use identity::{Identity, IdentityStore, SessionRecord};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
