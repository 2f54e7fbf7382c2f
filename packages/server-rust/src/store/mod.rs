//! Storage: the backend primitives and the in-memory reference database.
//!
//! Layering mirrors the engine's needs: [`backend::StoreBackend`] is the
//! set-oriented contract a relational backend must provide, and
//! [`db::Database`] is the in-memory implementation the engine and test
//! suite run against.

pub mod app;
pub mod backend;
pub mod db;

pub use app::AppRecord;
pub use backend::{QueueSelection, StoreBackend};
pub use db::Database;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
