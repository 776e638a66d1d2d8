//! The synchronization core: the cooperating background and foreground
//! workers, the cross-thread interrupt, and the engine that assembles
//! them. The local database is a replica of server state, never the
//! source of truth; the server wins all conflicts.

pub mod engine;
pub mod idle;
pub mod worker;

pub use engine::Engine;
pub use idle::Interrupt;
pub use worker::SyncWorker;
