//! The sync engine: serialization passes, buffer queueing, session contexts,
//! the staged controller, its middleware operations, the network client, and
//! the stale-session sweep.

pub mod cleanup;
pub mod client;
pub mod context;
pub mod controller;
pub mod operations;
pub mod queueing;
pub mod serializer;

pub use client::{NetworkSyncConnection, SyncClient};
pub use context::{
    CompositeSessionContext, IncomingTransferData, LocalSessionContext, NetworkSessionContext,
    SessionContext, SessionContextState,
};
pub use controller::{MiddlewareEntry, SessionController};
pub use operations::{session_middleware, HandleOutcome, Operation};
