//! The `api/morango/v1/` HTTP surface.
//!
//! Thin axum handlers over the engine: certificate listing and signing, the
//! nonce handshake, sync/transfer session lifecycle, and chunked buffer
//! push/pull. Stage-advancing requests run the session controller inline
//! under the per-sync-session lock, so a client polling `PATCH
//! transfersessions/{id}` observes the server's stage progress.

use std::io::Read as _;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use morango_core::capabilities::{parse_capabilities, Capabilities, CAPABILITIES_HEADER};
use morango_core::certificates::{Certificate, CertificateError, SerializedCertificate};
use morango_core::filter::Filter;
use morango_core::messages::{
    BufferPayload, CertificateChainPayload, CreateSyncSessionRequest,
    CreateTransferSessionRequest, CsrRequest, MorangoInfo, NonceResponse,
    SharedPublicKeyResponse, SyncSessionResponse, TransferSessionResponse,
    UpdateTransferSessionRequest,
};
use morango_core::sessions::{ConnectionKind, SyncSession, TransferStage, TransferStatus};
use morango_core::uuids::random_uuid;

use crate::engine::SyncEngine;
use crate::errors::SyncError;
use crate::store::now_millis;
use crate::sync::context::{IncomingTransferData, LocalSessionContext, SessionContext};
use crate::sync::controller::SessionController;
use crate::sync::operations::session_middleware;
use crate::sync::queueing::validate_and_create_buffer_data;

/// JSON error body plus the mapped status code.
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl From<CertificateError> for ApiError {
    fn from(err: CertificateError) -> Self {
        Self(SyncError::Certificate(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

fn effective_capabilities(engine: &SyncEngine, headers: &HeaderMap) -> Capabilities {
    let client = headers
        .get(CAPABILITIES_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(parse_capabilities)
        .unwrap_or_default();
    client
        .intersection(&engine.capabilities())
        .cloned()
        .collect()
}

/// Build the `api/morango/v1/` router over an engine.
pub fn router(engine: Arc<SyncEngine>) -> Router {
    Router::new()
        .route("/api/morango/v1/morangoinfo/", get(get_morango_info))
        .route("/api/morango/v1/publickey/", get(get_public_key))
        .route("/api/morango/v1/nonces/", post(create_nonce))
        .route(
            "/api/morango/v1/certificates/",
            get(list_certificates).post(create_certificate),
        )
        .route(
            "/api/morango/v1/certificatechain/",
            post(post_certificate_chain),
        )
        .route(
            "/api/morango/v1/syncsessions/",
            get(list_sync_sessions).post(create_sync_session),
        )
        .route(
            "/api/morango/v1/syncsessions/{id}/",
            get(get_sync_session).delete(delete_sync_session),
        )
        .route(
            "/api/morango/v1/transfersessions/",
            post(create_transfer_session),
        )
        .route(
            "/api/morango/v1/transfersessions/{id}/",
            get(get_transfer_session)
                .patch(patch_transfer_session)
                .delete(delete_transfer_session),
        )
        .route(
            "/api/morango/v1/buffers/",
            get(get_buffers).post(post_buffers),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn get_morango_info(State(engine): State<Arc<SyncEngine>>) -> Json<MorangoInfo> {
    Json(engine.morango_info())
}

async fn get_public_key(
    State(engine): State<Arc<SyncEngine>>,
) -> Result<Json<Vec<SharedPublicKeyResponse>>, ApiError> {
    if !engine.config().allow_certificate_pushing {
        return Err(SyncError::CertPushNotAllowed.into());
    }
    let key = engine.db().get_or_create_shared_key()?;
    Ok(Json(vec![SharedPublicKeyResponse {
        public_key: key.public_key().to_key_string(),
    }]))
}

async fn create_nonce(
    State(engine): State<Arc<SyncEngine>>,
) -> (StatusCode, Json<NonceResponse>) {
    let nonce = engine.db().create_nonce("");
    (
        StatusCode::CREATED,
        Json(NonceResponse {
            id: nonce.id,
            timestamp: nonce.timestamp,
            ip: nonce.ip,
        }),
    )
}

#[derive(Debug, Deserialize)]
struct CertificateQuery {
    profile: Option<String>,
    primary_partition: Option<String>,
    ancestors_of: Option<String>,
}

async fn list_certificates(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<CertificateQuery>,
) -> Json<CertificateChainPayload> {
    let db = engine.db();
    let matches_profile =
        |cert: &Certificate| query.profile.as_deref().is_none_or(|p| cert.profile == p);

    let certificates: Vec<Certificate> = if let Some(primary) = &query.primary_partition {
        // all certs under the primary partition that this server owns
        db.get_certificate_descendants(primary, true)
            .into_iter()
            .filter(Certificate::has_private_key)
            .filter(matches_profile)
            .collect()
    } else if let Some(leaf) = &query.ancestors_of {
        match db.get_certificate(leaf) {
            Some(cert) if cert.has_private_key() && matches_profile(&cert) => {
                db.get_certificate_ancestors(leaf, true)
            }
            _ => Vec::new(),
        }
    } else {
        db.owned_certificates(query.profile.as_deref())
    };

    Json(
        certificates
            .iter()
            .map(SerializedCertificate::from)
            .collect(),
    )
}

async fn create_certificate(
    State(engine): State<Arc<SyncEngine>>,
    Json(request): Json<CsrRequest>,
) -> Result<(StatusCode, Json<SerializedCertificate>), ApiError> {
    let db = engine.db();
    let parent = db
        .get_certificate(&request.parent)
        .ok_or_else(|| SyncError::CertificateNotFound(request.parent.clone()))?;
    if !parent.has_private_key() {
        return Err(CertificateError::PrivateKeyMissing.into());
    }

    let mut certificate = Certificate {
        id: String::new(),
        parent_id: Some(parent.id.clone()),
        profile: request.profile,
        scope_definition_id: request.scope_definition,
        scope_version: request.scope_version,
        scope_params: request.scope_params,
        public_key: morango_core::PublicKey::from_string(&request.public_key)
            .map_err(CertificateError::from)?,
        // server-chosen salt prevents the requester from forcing an id
        salt: random_uuid(),
        serialized: String::new(),
        signature: String::new(),
        private_key: None,
    };
    certificate.id = certificate.calculate_uuid();
    parent.sign_certificate(&mut certificate)?;
    let saved = db.check_and_save_certificate(certificate)?;

    Ok((
        StatusCode::CREATED,
        Json(SerializedCertificate::from(&saved)),
    ))
}

async fn post_certificate_chain(
    State(engine): State<Arc<SyncEngine>>,
    Json(chain): Json<CertificateChainPayload>,
) -> Result<StatusCode, ApiError> {
    if !engine.config().allow_certificate_pushing {
        return Err(SyncError::CertPushNotAllowed.into());
    }
    let db = engine.db();
    let leaf = chain
        .last()
        .ok_or_else(|| SyncError::Malformed("empty certificate chain".into()))?;
    let leaf_cert = Certificate::deserialize(&leaf.serialized, &leaf.signature)?;
    // the pushed leaf's salt is a nonce we minted; single-use enforced here
    db.use_nonce(&leaf_cert.salt)?;
    db.save_certificate_chain(&chain, None)?;
    Ok(StatusCode::CREATED)
}

async fn create_sync_session(
    State(engine): State<Arc<SyncEngine>>,
    Json(request): Json<CreateSyncSessionRequest>,
) -> Result<(StatusCode, Json<SyncSessionResponse>), ApiError> {
    let db = engine.db();

    let chain: CertificateChainPayload = serde_json::from_str(&request.certificate_chain)
        .map_err(|e| SyncError::Malformed(format!("invalid certificate chain: {e}")))?;
    let client_cert = db.save_certificate_chain(&chain, Some(&request.client_certificate_id))?;
    let server_cert = db
        .get_certificate(&request.server_certificate_id)
        .ok_or_else(|| SyncError::CertificateNotFound(request.server_certificate_id.clone()))?;
    if server_cert.profile != client_cert.profile {
        return Err(SyncError::ProfileMismatch {
            actual: client_cert.profile.clone(),
            expected: server_cert.profile.clone(),
        }
        .into());
    }

    // the client proves key ownership by signing "{nonce}:{session id}"
    let message = format!("{}:{}", request.nonce, request.id);
    if !client_cert.verify(&message, &request.signature) {
        return Err(CertificateError::SignatureInvalid.into());
    }
    db.use_nonce(&request.nonce)?;

    let instance = db.get_or_create_current_instance();
    let session = SyncSession {
        id: request.id.clone(),
        start_timestamp: now_millis(),
        last_activity_timestamp: now_millis(),
        active: true,
        is_server: true,
        client_certificate_id: Some(client_cert.id.clone()),
        server_certificate_id: Some(server_cert.id.clone()),
        profile: server_cert.profile.clone(),
        connection_kind: ConnectionKind::Network,
        connection_path: request.connection_path.clone(),
        client_ip: request.client_ip.clone(),
        server_ip: request.server_ip.clone(),
        client_instance: request.instance.clone(),
        server_instance: serde_json::to_string(&instance).unwrap_or_else(|_| "{}".into()),
        process_id: None,
        extra_fields: "{}".to_string(),
    };
    db.save_sync_session(session.clone());

    // counter-sign so the client can verify our certificate ownership too
    let signature = server_cert.sign(&message)?;
    Ok((
        StatusCode::CREATED,
        Json(SyncSessionResponse {
            id: session.id,
            signature,
            server_instance: session.server_instance,
        }),
    ))
}

async fn list_sync_sessions(
    State(engine): State<Arc<SyncEngine>>,
) -> Json<Vec<SyncSession>> {
    Json(engine.db().active_sync_sessions())
}

async fn get_sync_session(
    State(engine): State<Arc<SyncEngine>>,
    Path(id): Path<String>,
) -> Result<Json<SyncSession>, ApiError> {
    engine
        .db()
        .get_sync_session(&id)
        .filter(|s| s.active)
        .map(Json)
        .ok_or_else(|| SyncError::SyncSessionNotFound(id).into())
}

async fn delete_sync_session(
    State(engine): State<Arc<SyncEngine>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let db = engine.db();
    let mut session = db
        .get_sync_session(&id)
        .ok_or_else(|| SyncError::SyncSessionNotFound(id))?;
    session.active = false;
    db.save_sync_session(session);
    Ok(StatusCode::NO_CONTENT)
}

/// Check the requested filter against both certificates' scopes for the
/// given direction.
fn check_filter_in_scopes(
    engine: &SyncEngine,
    session: &SyncSession,
    requested: &Filter,
    push: bool,
) -> Result<(), SyncError> {
    let db = engine.db();
    let load_scope = |cert_id: &Option<String>| -> Result<morango_core::Scope, SyncError> {
        let id = cert_id
            .as_deref()
            .ok_or_else(|| SyncError::CertificateNotFound("<unset>".into()))?;
        let cert = db
            .get_certificate(id)
            .ok_or_else(|| SyncError::CertificateNotFound(id.to_string()))?;
        let scope_def = db
            .get_scope_definition(&cert.scope_definition_id)
            .ok_or_else(|| SyncError::ScopeDefinitionNotFound(cert.scope_definition_id.clone()))?;
        Ok(cert.get_scope(&scope_def)?)
    };
    let remote_scope = load_scope(&session.client_certificate_id)?;
    let local_scope = load_scope(&session.server_certificate_id)?;

    let failure = if push {
        if !requested.is_subset_of(&remote_scope.write_filter) {
            Some("client certificate scope does not permit pushing for the requested filter")
        } else if !requested.is_subset_of(&local_scope.read_filter) {
            Some("server certificate scope does not permit receiving pushes for the requested filter")
        } else {
            None
        }
    } else if !requested.is_subset_of(&remote_scope.read_filter) {
        Some("client certificate scope does not permit pulling for the requested filter")
    } else if !requested.is_subset_of(&local_scope.write_filter) {
        Some("server certificate scope does not permit responding to pulls for the requested filter")
    } else {
        None
    };

    match failure {
        Some(message) => Err(SyncError::FilterNotInScope(message.to_string())),
        None => Ok(()),
    }
}

async fn create_transfer_session(
    State(engine): State<Arc<SyncEngine>>,
    headers: HeaderMap,
    Json(request): Json<CreateTransferSessionRequest>,
) -> Result<(StatusCode, Json<TransferSessionResponse>), ApiError> {
    let db = engine.db();
    let sync_session = db
        .get_sync_session(&request.sync_session_id)
        .filter(|s| s.active)
        .ok_or_else(|| SyncError::SyncSessionNotFound(request.sync_session_id.clone()))?;

    let requested_filter = Filter::from(request.filter.as_str());
    check_filter_in_scopes(&engine, &sync_session, &requested_filter, request.push)?;

    let capabilities = effective_capabilities(&engine, &headers);
    let legacy = !capabilities.contains(morango_core::capabilities::ASYNC_OPERATIONS);

    let _guard = engine.session_lock(&sync_session.id).await;
    let mut context = LocalSessionContext::for_server(
        Arc::clone(db),
        sync_session,
        IncomingTransferData {
            id: request.id.clone(),
            records_total: request.records_total,
            client_fsic: request.client_fsic.clone(),
        },
        capabilities,
    );
    context.core.filter = Some(requested_filter);
    context.core.is_push = Some(request.push);

    let mut controller = SessionController::new(
        session_middleware(&engine),
        SessionContext::Local(context),
    );
    // a legacy peer expects serialization and queuing to happen at create
    let target = if legacy {
        TransferStage::Queuing
    } else {
        TransferStage::Initializing
    };
    let result = controller.proceed_to(target).await;
    if result == TransferStatus::Errored {
        return Err(SyncError::Internal(anyhow::anyhow!(
            controller
                .context
                .error()
                .unwrap_or_else(|| "transfer session initialization failed".into())
        ))
        .into());
    }

    // a resumed transfer session may carry a different id than the request
    let session_id = match &controller.context {
        SessionContext::Local(ctx) => ctx
            .core
            .transfer_session
            .as_ref()
            .map(|t| t.id.clone())
            .unwrap_or_else(|| request.id.clone()),
        _ => request.id.clone(),
    };
    let session = db
        .get_transfer_session(&session_id)
        .ok_or_else(|| SyncError::TransferSessionNotFound(session_id))?;
    Ok((
        StatusCode::CREATED,
        Json(TransferSessionResponse::from(&session)),
    ))
}

async fn get_transfer_session(
    State(engine): State<Arc<SyncEngine>>,
    Path(id): Path<String>,
) -> Result<Json<TransferSessionResponse>, ApiError> {
    engine
        .db()
        .get_transfer_session(&id)
        .map(|session| Json(TransferSessionResponse::from(&session)))
        .ok_or_else(|| SyncError::TransferSessionNotFound(id).into())
}

async fn patch_transfer_session(
    State(engine): State<Arc<SyncEngine>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<UpdateTransferSessionRequest>,
) -> Result<Json<TransferSessionResponse>, ApiError> {
    let db = engine.db();
    let mut session = db
        .get_transfer_session(&id)
        .filter(|t| t.active)
        .ok_or_else(|| SyncError::TransferSessionNotFound(id.clone()))?;

    if let Some(records_transferred) = update.records_transferred {
        session.records_transferred = records_transferred;
    }
    if let Some(records_total) = update.records_total {
        session.records_total = Some(records_total);
    }
    if let Some(bytes_sent) = update.bytes_sent {
        session.bytes_sent = bytes_sent;
    }
    if let Some(bytes_received) = update.bytes_received {
        session.bytes_received = bytes_received;
    }
    if let Some(client_fsic) = &update.client_fsic {
        session.client_fsic = client_fsic.clone();
    }
    session.last_activity_timestamp = now_millis();
    db.save_transfer_session(session.clone());

    if let Some(target) = update.transfer_stage {
        let sync_session = db
            .get_sync_session(&session.sync_session_id)
            .ok_or_else(|| SyncError::SyncSessionNotFound(session.sync_session_id.clone()))?;
        let _guard = engine.session_lock(&sync_session.id).await;
        let mut context = LocalSessionContext::for_server(
            Arc::clone(db),
            sync_session,
            IncomingTransferData {
                id: session.id.clone(),
                records_total: update.records_total,
                client_fsic: update.client_fsic.clone(),
            },
            effective_capabilities(&engine, &headers),
        );
        context.core.set_transfer_session(session.clone())?;
        let mut controller = SessionController::new(
            session_middleware(&engine),
            SessionContext::Local(context),
        );
        controller.proceed_to(target).await;
    }

    let fresh = db
        .get_transfer_session(&id)
        .ok_or_else(|| SyncError::TransferSessionNotFound(id))?;
    Ok(Json(TransferSessionResponse::from(&fresh)))
}

async fn delete_transfer_session(
    State(engine): State<Arc<SyncEngine>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let db = engine.db();
    let session = db
        .get_transfer_session(&id)
        .ok_or_else(|| SyncError::TransferSessionNotFound(id.clone()))?;
    let sync_session = db
        .get_sync_session(&session.sync_session_id)
        .ok_or_else(|| SyncError::SyncSessionNotFound(session.sync_session_id.clone()))?;

    let _guard = engine.session_lock(&sync_session.id).await;
    let mut context = LocalSessionContext::for_server(
        Arc::clone(db),
        sync_session,
        IncomingTransferData {
            id: session.id.clone(),
            records_total: None,
            client_fsic: None,
        },
        effective_capabilities(&engine, &headers),
    );
    context.core.set_transfer_session(session.clone())?;
    let mut controller = SessionController::new(
        session_middleware(&engine),
        SessionContext::Local(context),
    );
    let result = controller.proceed_to(TransferStage::Cleanup).await;
    if result != TransferStatus::Completed {
        // cancellation: abandon whatever the transfer was doing
        db.delete_buffers(&id);
        if let Some(mut session) = db.get_transfer_session(&id) {
            session.active = false;
            db.save_transfer_session(session);
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct BufferQuery {
    transfer_session_id: String,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    500
}

async fn get_buffers(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<BufferQuery>,
) -> Result<Json<Vec<BufferPayload>>, ApiError> {
    let db = engine.db();
    let session = db
        .get_transfer_session(&query.transfer_session_id)
        .filter(|t| t.active)
        .ok_or_else(|| SyncError::TransferSessionNotFound(query.transfer_session_id.clone()))?;
    if session.push {
        return Err(SyncError::InvalidBuffer(
            "specified transfer session does not allow pulling".into(),
        )
        .into());
    }
    let payloads = db
        .buffers_chunk(&session.id, query.offset, query.limit)
        .iter()
        .map(|(buffer, rmcbs)| BufferPayload::from_records(buffer, rmcbs))
        .collect();
    Ok(Json(payloads))
}

async fn post_buffers(
    State(engine): State<Arc<SyncEngine>>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Result<StatusCode, ApiError> {
    let db = engine.db();
    let is_gzip = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/gzip"));
    let decoded = if is_gzip {
        let mut decoder = GzDecoder::new(body.as_ref());
        let mut buffer = Vec::new();
        decoder
            .read_to_end(&mut buffer)
            .map_err(|e| SyncError::Malformed(format!("invalid gzip body: {e}")))?;
        buffer
    } else {
        body.to_vec()
    };

    let payloads: Vec<BufferPayload> = serde_json::from_slice(&decoded)
        .map_err(|e| SyncError::Malformed(format!("invalid buffer body: {e}")))?;
    let first = payloads
        .first()
        .ok_or_else(|| SyncError::InvalidBuffer("empty buffer payload".into()))?;

    let session = db
        .get_transfer_session(&first.transfer_session_id)
        .filter(|t| t.active)
        .ok_or_else(|| {
            SyncError::TransferSessionNotFound(first.transfer_session_id.clone())
        })?;
    if !session.push {
        return Err(SyncError::InvalidBuffer(
            "specified transfer session does not allow pushing".into(),
        )
        .into());
    }
    let sync_session = db
        .get_sync_session(&session.sync_session_id)
        .ok_or_else(|| SyncError::SyncSessionNotFound(session.sync_session_id.clone()))?;

    validate_and_create_buffer_data(db, &session, &sync_session.profile, payloads)?;
    Ok(StatusCode::CREATED)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::EngineConfig;
    use crate::registry::SyncableModelRegistry;

    fn engine(allow_certificate_pushing: bool) -> Arc<SyncEngine> {
        let config = EngineConfig {
            allow_certificate_pushing,
            ..EngineConfig::default()
        };
        SyncEngine::new(config, SyncableModelRegistry::new())
    }

    async fn request_json(
        engine: &Arc<SyncEngine>,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                builder.body(Body::from(value.to_string())).unwrap()
            }
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router(Arc::clone(engine)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn morangoinfo_reports_instance_and_capabilities() {
        let engine = engine(false);
        let (status, body) =
            request_json(&engine, "GET", "/api/morango/v1/morangoinfo/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instance_id"].as_str().unwrap().len(), 32);
        assert!(body["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "async_operations"));
    }

    #[tokio::test]
    async fn publickey_gated_by_configuration() {
        let closed = engine(false);
        let (status, _) = request_json(&closed, "GET", "/api/morango/v1/publickey/", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let open = engine(true);
        let (status, body) = request_json(&open, "GET", "/api/morango/v1/publickey/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body[0]["public_key"].as_str().unwrap().len() > 100);
    }

    #[tokio::test]
    async fn nonces_are_minted_per_request() {
        let engine = engine(false);
        let (status, first) = request_json(&engine, "POST", "/api/morango/v1/nonces/", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, second) = request_json(&engine, "POST", "/api/morango/v1/nonces/", None).await;
        assert_eq!(first["id"].as_str().unwrap().len(), 32);
        assert_ne!(first["id"], second["id"]);
        // minted nonces are consumable exactly once
        engine.db().use_nonce(first["id"].as_str().unwrap()).unwrap();
        assert!(engine
            .db()
            .use_nonce(first["id"].as_str().unwrap())
            .is_err());
    }

    #[tokio::test]
    async fn certificate_listing_is_empty_without_certs() {
        let engine = engine(false);
        let (status, body) = request_json(
            &engine,
            "GET",
            "/api/morango/v1/certificates/?profile=none",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unknown_sessions_are_rejected() {
        let engine = engine(false);
        let (status, body) = request_json(
            &engine,
            "GET",
            "/api/morango/v1/transfersessions/deadbeef/",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("deadbeef"));

        let (status, _) = request_json(
            &engine,
            "POST",
            "/api/morango/v1/transfersessions/",
            Some(serde_json::json!({
                "id": "t".repeat(32),
                "filter": "abc",
                "push": true,
                "sync_session_id": "missing".repeat(4),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn buffer_push_rejects_bad_payloads() {
        let engine = engine(false);
        // empty array has no transfer session to attach to
        let (status, _) = request_json(
            &engine,
            "POST",
            "/api/morango/v1/buffers/",
            Some(serde_json::json!([])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // non-JSON body
        let request = Request::builder()
            .method("POST")
            .uri("/api/morango/v1/buffers/")
            .header("content-type", "application/json")
            .body(Body::from("not json"))
            .unwrap();
        let response = router(Arc::clone(&engine)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cert_chain_push_gated_by_configuration() {
        let engine = engine(false);
        let (status, _) = request_json(
            &engine,
            "POST",
            "/api/morango/v1/certificatechain/",
            Some(serde_json::json!([])),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
