// oauth2-server-memory: in-memory credential store.
//
// Uses HashMap tables guarded by a single `tokio::sync::RwLock`.
// Ideal for testing, prototyping and single-process development servers.

pub mod adapter;

pub use adapter::MemoryStore;
