//! Certificate, nonce, and shared-key exchange bodies.

use serde::{Deserialize, Serialize};

use crate::certificates::SerializedCertificate;

/// Body of the `POST nonces/` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceResponse {
    pub id: String,
    /// Unix millis at mint time.
    pub timestamp: i64,
    #[serde(default)]
    pub ip: String,
}

/// A certificate chain, root first, leaf last. Used both for listing
/// (`GET certificates/`) and for pushing a client-signed chain
/// (`POST certificatechain/`).
pub type CertificateChainPayload = Vec<SerializedCertificate>;

/// A certificate signing request submitted to `POST certificates/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrRequest {
    /// Id of the parent certificate the server should sign under.
    pub parent: String,
    pub profile: String,
    pub scope_definition: String,
    pub scope_version: i32,
    /// JSON object of scope params.
    pub scope_params: String,
    /// The requester's normalized public key string.
    pub public_key: String,
}

/// One entry of the `GET publickey/` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedPublicKeyResponse {
    pub public_key: String,
}
