//! The client side of the HTTP protocol: the retrying connection, the
//! certificate exchange flows, and the [`SyncClient`] that drives push/pull
//! transfers end to end.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write as _;
use tracing::info;

use morango_core::capabilities::{
    render_capabilities, Capabilities, ALLOW_CERTIFICATE_PUSHING, CAPABILITIES_HEADER,
    GZIP_BUFFER_POST,
};
use morango_core::certificates::{Certificate, CertificateError, SerializedCertificate};
use morango_core::crypto::{PrivateKey, PublicKey};
use morango_core::filter::Filter;
use morango_core::messages::{
    BufferPayload, CertificateChainPayload, CreateSyncSessionRequest,
    CreateTransferSessionRequest, CsrRequest, MorangoInfo, NonceResponse,
    SharedPublicKeyResponse, SyncSessionResponse, TransferSessionResponse,
    UpdateTransferSessionRequest,
};
use morango_core::sessions::{
    ConnectionKind, SyncSession, TransferStage, TransferStatus,
};
use morango_core::uuids::random_uuid;

use crate::engine::SyncEngine;
use crate::errors::SyncError;
use crate::store::now_millis;
use crate::sync::context::{
    CompositeSessionContext, LocalSessionContext, NetworkSessionContext, SessionContext,
};
use crate::sync::controller::SessionController;
use crate::sync::operations::session_middleware;

const API_PREFIX: &str = "api/morango/v1";

/// A connection to a remote morango server, with retrying requests and
/// transfer byte accounting.
pub struct NetworkSyncConnection {
    base_url: String,
    client: reqwest::Client,
    pub server_info: MorangoInfo,
    our_capabilities: Capabilities,
    compresslevel: u32,
    retries: u32,
    backoff_factor: f64,
    bytes_sent: AtomicI64,
    bytes_received: AtomicI64,
}

impl NetworkSyncConnection {
    /// Open a connection: fetches the server's `morangoinfo` so the
    /// capability sets can be intersected.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Network`] after exhausting retries, or
    /// [`SyncError::RemoteStatus`] on a non-success response.
    pub async fn connect(
        base_url: &str,
        config: &crate::config::EngineConfig,
    ) -> Result<Arc<Self>, SyncError> {
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let connection = Self {
            base_url,
            client: reqwest::Client::new(),
            server_info: MorangoInfo {
                instance_id: String::new(),
                instance_hash: String::new(),
                capabilities: Vec::new(),
                custom: None,
            },
            our_capabilities: config.capabilities(),
            compresslevel: config.compresslevel,
            retries: config.retries,
            backoff_factor: config.backoff_factor,
            bytes_sent: AtomicI64::new(0),
            bytes_received: AtomicI64::new(0),
        };
        let url = connection.url("morangoinfo/");
        let info: MorangoInfo = connection
            .send(|client| client.get(url.clone()))
            .await?
            .json()
            .await?;
        Ok(Arc::new(Self {
            server_info: info,
            ..connection
        }))
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{API_PREFIX}/{endpoint}", self.base_url)
    }

    /// The server's advertised capability set.
    #[must_use]
    pub fn server_capabilities(&self) -> Capabilities {
        self.server_info
            .capabilities
            .iter()
            .cloned()
            .collect()
    }

    /// The capabilities both sides share.
    #[must_use]
    pub fn effective_capabilities(&self) -> Capabilities {
        self.server_capabilities()
            .intersection(&self.our_capabilities)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn bytes_sent(&self) -> i64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_received(&self) -> i64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Send a request, retrying transport failures with exponential backoff
    /// (`factor * 2^attempt` seconds). Non-success statuses are not retried.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, SyncError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let header_value = render_capabilities(&self.our_capabilities);
        let mut attempt: u32 = 0;
        loop {
            let result = build(&self.client)
                .header(CAPABILITIES_HEADER, header_value.clone())
                .send()
                .await;
            match result {
                Ok(response) => {
                    let http_status = response.status();
                    if http_status.is_success() {
                        return Ok(response);
                    }
                    return Err(SyncError::RemoteStatus {
                        status: http_status.as_u16(),
                        body: response.text().await.unwrap_or_default(),
                    });
                }
                Err(err) if attempt < self.retries => {
                    let backoff = self.backoff_factor * 2f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
                    tracing::warn!(%err, attempt, "request failed, retrying");
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // --- endpoint wrappers ---

    pub async fn get_nonce(&self) -> Result<NonceResponse, SyncError> {
        let url = self.url("nonces/");
        Ok(self.send(|c| c.post(url.clone())).await?.json().await?)
    }

    pub async fn get_certificate_chain(
        &self,
        params: &[(&str, &str)],
    ) -> Result<CertificateChainPayload, SyncError> {
        let url = self.url("certificates/");
        let params: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Ok(self
            .send(|c| c.get(url.clone()).query(&params))
            .await?
            .json()
            .await?)
    }

    pub async fn push_certificate_chain(
        &self,
        chain: &CertificateChainPayload,
    ) -> Result<(), SyncError> {
        let url = self.url("certificatechain/");
        self.send(|c| c.post(url.clone()).json(chain)).await?;
        Ok(())
    }

    pub async fn certificate_signing(
        &self,
        request: &CsrRequest,
        username: &str,
        password: Option<&str>,
    ) -> Result<SerializedCertificate, SyncError> {
        let url = self.url("certificates/");
        Ok(self
            .send(|c| {
                c.post(url.clone())
                    .json(request)
                    .basic_auth(username, password)
            })
            .await?
            .json()
            .await?)
    }

    pub async fn get_public_key(&self) -> Result<Vec<SharedPublicKeyResponse>, SyncError> {
        let url = self.url("publickey/");
        Ok(self.send(|c| c.get(url.clone())).await?.json().await?)
    }

    pub async fn create_sync_session_request(
        &self,
        request: &CreateSyncSessionRequest,
    ) -> Result<SyncSessionResponse, SyncError> {
        let url = self.url("syncsessions/");
        Ok(self
            .send(|c| c.post(url.clone()).json(request))
            .await?
            .json()
            .await?)
    }

    pub async fn close_sync_session(&self, sync_session_id: &str) -> Result<(), SyncError> {
        let url = self.url(&format!("syncsessions/{sync_session_id}/"));
        self.send(|c| c.delete(url.clone())).await?;
        Ok(())
    }

    pub async fn create_transfer_session(
        &self,
        request: &CreateTransferSessionRequest,
    ) -> Result<TransferSessionResponse, SyncError> {
        let url = self.url("transfersessions/");
        Ok(self
            .send(|c| c.post(url.clone()).json(request))
            .await?
            .json()
            .await?)
    }

    pub async fn get_transfer_session(
        &self,
        transfer_session_id: &str,
    ) -> Result<TransferSessionResponse, SyncError> {
        let url = self.url(&format!("transfersessions/{transfer_session_id}/"));
        Ok(self.send(|c| c.get(url.clone())).await?.json().await?)
    }

    pub async fn update_transfer_session(
        &self,
        transfer_session_id: &str,
        update: &UpdateTransferSessionRequest,
    ) -> Result<TransferSessionResponse, SyncError> {
        let url = self.url(&format!("transfersessions/{transfer_session_id}/"));
        Ok(self
            .send(|c| c.patch(url.clone()).json(update))
            .await?
            .json()
            .await?)
    }

    pub async fn close_transfer_session(
        &self,
        transfer_session_id: &str,
    ) -> Result<(), SyncError> {
        let url = self.url(&format!("transfersessions/{transfer_session_id}/"));
        self.send(|c| c.delete(url.clone())).await?;
        Ok(())
    }

    /// Push one chunk of buffers, gzip-compressed when both sides advertise
    /// the capability.
    pub async fn push_buffers(&self, payloads: &[BufferPayload]) -> Result<(), SyncError> {
        let url = self.url("buffers/");
        let body = serde_json::to_vec(payloads)?;
        if self.effective_capabilities().contains(GZIP_BUFFER_POST) {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.compresslevel));
            encoder
                .write_all(&body)
                .map_err(|e| SyncError::Internal(e.into()))?;
            let compressed = encoder
                .finish()
                .map_err(|e| SyncError::Internal(e.into()))?;
            self.bytes_sent
                .fetch_add(compressed.len() as i64, Ordering::Relaxed);
            self.send(|c| {
                c.post(url.clone())
                    .header("content-type", "application/gzip")
                    .body(compressed.clone())
            })
            .await?;
        } else {
            self.bytes_sent
                .fetch_add(body.len() as i64, Ordering::Relaxed);
            self.send(|c| c.post(url.clone()).json(payloads)).await?;
        }
        Ok(())
    }

    /// Pull one chunk of buffers. Accepts both a bare array and a paginated
    /// `{"results": [...]}` body.
    pub async fn pull_buffers(
        &self,
        transfer_session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BufferPayload>, SyncError> {
        let url = self.url("buffers/");
        let response = self
            .send(|c| {
                c.get(url.clone()).query(&[
                    ("limit", limit.to_string()),
                    ("offset", offset.to_string()),
                    ("transfer_session_id", transfer_session_id.to_string()),
                ])
            })
            .await?;
        let bytes = response.bytes().await?;
        self.bytes_received
            .fetch_add(bytes.len() as i64, Ordering::Relaxed);
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let records = match value {
            serde_json::Value::Object(mut map) => map
                .remove("results")
                .ok_or_else(|| SyncError::Malformed("paginated body without results".into()))?,
            other => other,
        };
        Ok(serde_json::from_value(records)?)
    }

    // --- certificate flows ---

    /// Fetch the server-owned certificates under a primary partition,
    /// optionally narrowed to one scope definition.
    pub async fn get_remote_certificates(
        &self,
        primary_partition: &str,
        scope_definition_id: Option<&str>,
    ) -> Result<Vec<Certificate>, SyncError> {
        let chain = self
            .get_certificate_chain(&[("primary_partition", primary_partition)])
            .await?;
        let mut certificates = Vec::with_capacity(chain.len());
        for entry in &chain {
            certificates.push(Certificate::deserialize(&entry.serialized, &entry.signature)?);
        }
        if let Some(scope_definition_id) = scope_definition_id {
            certificates.retain(|c| c.scope_definition_id == scope_definition_id);
        }
        Ok(certificates)
    }

    /// Ask the server to sign a CSR under `parent_cert`, authenticating with
    /// the host application's credentials.
    pub async fn certificate_signing_request(
        &self,
        engine: &Arc<SyncEngine>,
        parent_cert: &Certificate,
        scope_definition_id: &str,
        scope_params: &str,
        username: &str,
        password: Option<&str>,
    ) -> Result<Certificate, SyncError> {
        if engine.db().get_certificate(&parent_cert.id).is_none() {
            let chain = self
                .get_certificate_chain(&[("ancestors_of", &parent_cert.id)])
                .await?;
            engine
                .db()
                .save_certificate_chain(&chain, Some(&parent_cert.id))?;
        }

        let key = PrivateKey::generate().map_err(CertificateError::from)?;
        let response = self
            .certificate_signing(
                &CsrRequest {
                    parent: parent_cert.id.clone(),
                    profile: parent_cert.profile.clone(),
                    scope_definition: scope_definition_id.to_string(),
                    scope_version: parent_cert.scope_version,
                    scope_params: scope_params.to_string(),
                    public_key: key.public_key().to_key_string(),
                },
                username,
                password,
            )
            .await?;

        let mut certificate =
            Certificate::deserialize(&response.serialized, &response.signature)?;
        certificate.private_key = Some(key);
        engine.db().check_and_save_certificate(certificate)
    }

    /// Generate a certificate against the server's shared public key, sign
    /// it with a locally owned parent, and push the chain for the server to
    /// store.
    pub async fn push_signed_client_certificate_chain(
        &self,
        engine: &Arc<SyncEngine>,
        local_parent_cert: &Certificate,
        scope_definition_id: &str,
        scope_params: &str,
    ) -> Result<Certificate, SyncError> {
        if !self
            .server_capabilities()
            .contains(ALLOW_CERTIFICATE_PUSHING)
        {
            return Err(SyncError::CertPushNotAllowed);
        }

        let public_keys = self.get_public_key().await?;
        let shared_key = public_keys
            .first()
            .ok_or_else(|| SyncError::Malformed("server returned no shared key".into()))?;
        let nonce = self.get_nonce().await?;

        let mut certificate = Certificate {
            id: String::new(),
            parent_id: Some(local_parent_cert.id.clone()),
            profile: local_parent_cert.profile.clone(),
            scope_definition_id: scope_definition_id.to_string(),
            scope_version: local_parent_cert.scope_version,
            scope_params: scope_params.to_string(),
            public_key: PublicKey::from_string(&shared_key.public_key)
                .map_err(CertificateError::from)?,
            // the nonce doubles as the salt so the server can verify
            // single-use before accepting the chain
            salt: nonce.id,
            serialized: String::new(),
            signature: String::new(),
            private_key: None,
        };
        certificate.id = certificate.calculate_uuid();
        local_parent_cert.sign_certificate(&mut certificate)?;

        let mut chain: CertificateChainPayload = engine
            .db()
            .get_certificate_ancestors(&local_parent_cert.id, true)
            .iter()
            .map(SerializedCertificate::from)
            .collect();
        chain.push(SerializedCertificate::from(&certificate));
        self.push_certificate_chain(&chain).await?;

        engine.db().save_certificate(certificate.clone());
        Ok(certificate)
    }

    /// Establish a sync session: verify the server's chain, prove ownership
    /// of the client certificate by signing a server nonce, and verify the
    /// server's counter-signature.
    pub async fn create_sync_session(
        self: &Arc<Self>,
        engine: &Arc<SyncEngine>,
        client_cert: &Certificate,
        server_cert: &Certificate,
    ) -> Result<SyncClient, SyncError> {
        let db = engine.db();
        if db.get_certificate(&server_cert.id).is_none() {
            let chain = self
                .get_certificate_chain(&[("ancestors_of", &server_cert.id)])
                .await?;
            db.save_certificate_chain(&chain, Some(&server_cert.id))?;
        }

        let nonce = self.get_nonce().await?;
        let session_id = random_uuid();
        let message = format!("{}:{}", nonce.id, session_id);
        let signature = client_cert.sign(&message)?;

        let chain: CertificateChainPayload = db
            .get_certificate_ancestors(&client_cert.id, true)
            .iter()
            .map(SerializedCertificate::from)
            .collect();
        let instance = db.get_or_create_current_instance();

        let response = self
            .create_sync_session_request(&CreateSyncSessionRequest {
                id: session_id.clone(),
                server_certificate_id: server_cert.id.clone(),
                client_certificate_id: client_cert.id.clone(),
                profile: client_cert.profile.clone(),
                certificate_chain: serde_json::to_string(&chain)?,
                connection_path: self.base_url.clone(),
                instance: serde_json::to_string(&instance)?,
                nonce: nonce.id.clone(),
                signature,
                client_ip: String::new(),
                server_ip: String::new(),
            })
            .await?;

        // the server proves it owns its certificate the same way
        if !server_cert.verify(&message, &response.signature) {
            return Err(CertificateError::SignatureInvalid.into());
        }

        let session = SyncSession {
            id: session_id,
            start_timestamp: now_millis(),
            last_activity_timestamp: now_millis(),
            active: true,
            is_server: false,
            client_certificate_id: Some(client_cert.id.clone()),
            server_certificate_id: Some(server_cert.id.clone()),
            profile: client_cert.profile.clone(),
            connection_kind: ConnectionKind::Network,
            connection_path: self.base_url.clone(),
            client_ip: String::new(),
            server_ip: String::new(),
            client_instance: serde_json::to_string(&instance)?,
            server_instance: response.server_instance,
            process_id: Some(std::process::id()),
            extra_fields: "{}".to_string(),
        };
        db.save_sync_session(session.clone());

        Ok(SyncClient {
            engine: Arc::clone(engine),
            connection: Arc::clone(self),
            sync_session: session,
        })
    }
}

/// Drives push and pull transfers within one established sync session.
pub struct SyncClient {
    engine: Arc<SyncEngine>,
    connection: Arc<NetworkSyncConnection>,
    pub sync_session: SyncSession,
}

impl SyncClient {
    /// Push records matching `filter` to the server.
    ///
    /// # Errors
    ///
    /// Surfaces the first errored middleware status as a [`SyncError`].
    pub async fn initiate_push(&mut self, filter: Filter) -> Result<(), SyncError> {
        info!(filter = %filter, "initiating push sync");
        self.run_transfer(filter, true).await
    }

    /// Pull records matching `filter` from the server.
    ///
    /// # Errors
    ///
    /// Surfaces the first errored middleware status as a [`SyncError`].
    pub async fn initiate_pull(&mut self, filter: Filter) -> Result<(), SyncError> {
        info!(filter = %filter, "initiating pull sync");
        self.run_transfer(filter, false).await
    }

    async fn run_transfer(&mut self, filter: Filter, is_push: bool) -> Result<(), SyncError> {
        let _guard = self.engine.session_lock(&self.sync_session.id).await;

        let capabilities = self.connection.effective_capabilities();
        let local = LocalSessionContext::new(
            Arc::clone(self.engine.db()),
            Some(self.sync_session.clone()),
            Some(filter.clone()),
            Some(is_push),
            capabilities.clone(),
        );
        let network = NetworkSessionContext::new(
            Arc::clone(self.engine.db()),
            Arc::clone(&self.connection),
            Some(self.sync_session.clone()),
            Some(filter),
            Some(is_push),
            capabilities,
        );
        let context = SessionContext::Composite(CompositeSessionContext::new(vec![
            SessionContext::Local(local),
            SessionContext::Network(network),
        ]));

        let mut controller =
            SessionController::new(session_middleware(&self.engine), context);
        let result = controller
            .proceed_to_and_wait_for(TransferStage::Cleanup, 5.0)
            .await;
        if result == TransferStatus::Errored {
            let detail = controller
                .context
                .error()
                .unwrap_or_else(|| "transfer errored".to_string());
            return Err(SyncError::Internal(anyhow::anyhow!(detail)));
        }

        // touch the sync session so the cleanup sweep sees recent activity
        let mut session = self.sync_session.clone();
        session.last_activity_timestamp = now_millis();
        self.engine.db().save_sync_session(session.clone());
        self.sync_session = session;
        Ok(())
    }

    /// Close the sync session on both ends.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] when active transfer sessions remain, or on a
    /// network failure closing the remote side.
    pub async fn close_sync_session(&mut self) -> Result<(), SyncError> {
        let open = self
            .engine
            .db()
            .transfer_sessions_for_sync(&self.sync_session.id, true);
        if !open.is_empty() {
            return Err(SyncError::Internal(anyhow::anyhow!(
                "transfer sessions must be closed before closing the sync session"
            )));
        }
        self.connection
            .close_sync_session(&self.sync_session.id)
            .await?;
        self.sync_session.active = false;
        self.engine.db().save_sync_session(self.sync_session.clone());
        Ok(())
    }
}
