//! Wire formats for the HTTP protocol layer.
//!
//! Each submodule covers one domain of the `api/morango/v1/` surface. All
//! bodies are JSON; field names match the wire exactly (notably
//! `transfer_session` on buffer payloads, which maps to the
//! `transfer_session_id` columns of the record rows).

pub mod buffers;
pub mod certs;
pub mod info;
pub mod session;

pub use buffers::{BufferPayload, RmcbPayload};
pub use certs::{CertificateChainPayload, CsrRequest, NonceResponse, SharedPublicKeyResponse};
pub use info::MorangoInfo;
pub use session::{
    CreateSyncSessionRequest, CreateTransferSessionRequest, SyncSessionResponse,
    TransferSessionResponse, UpdateTransferSessionRequest,
};
