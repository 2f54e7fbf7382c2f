//! Morango core: the data and logic layer of the replication engine.
//!
//! This crate holds everything two peers must agree on, with no I/O:
//!
//! - **Crypto** ([`crypto`]): RSA keys with normalized string forms, signing
//! - **Ids** ([`uuids`]): content-addressed 32-hex identifiers
//! - **Certificates** ([`certificates`]): the signed authorization tree
//! - **Filters & scopes** ([`filter`], [`scope`]): partition prefix algebra
//! - **FSIC** ([`fsic`]): the counter summaries that drive minimal transfers
//! - **Identity** ([`instance`]): database and instance ids with counters
//! - **Records** ([`records`]): store rows, vector clocks, buffer mirrors
//! - **Sessions** ([`sessions`]): sync/transfer sessions and the stage enum
//! - **Capabilities** ([`capabilities`]): negotiation tokens
//! - **Messages** ([`messages`]): the JSON bodies of the HTTP protocol

pub mod capabilities;
pub mod certificates;
pub mod crypto;
pub mod filter;
pub mod fsic;
pub mod instance;
pub mod messages;
pub mod records;
pub mod scope;
pub mod sessions;
pub mod uuids;

pub use capabilities::{parse_capabilities, render_capabilities, Capabilities};
pub use certificates::{Certificate, CertificateError, SerializedCertificate};
pub use crypto::{KeyError, PrivateKey, PublicKey};
pub use filter::Filter;
pub use fsic::{Fsic, FsicV2, InstanceCounters, PartitionCounters};
pub use instance::{DatabaseId, InstanceId};
pub use records::{
    BufferRecord, DatabaseMaxCounter, Nonce, RecordMaxCounter, RecordMaxCounterBuffer,
    StoreRecord,
};
pub use scope::{Scope, ScopeDefinition};
pub use sessions::{SyncSession, TransferSession, TransferStage, TransferStatus};
pub use uuids::{random_uuid, sha2_uuid};
