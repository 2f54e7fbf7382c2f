//! Transfer contexts: the state a controller operates on.
//!
//! A [`LocalSessionContext`] persists its stage and status on the transfer
//! session row; a [`NetworkSessionContext`] tracks them in memory while
//! driving a remote peer; a [`CompositeSessionContext`] runs an ordered list
//! of children through each stage, remembering where it stopped so a paused
//! sync resumes at the right child. Contexts reduce to a serializable
//! [`SessionContextState`] for persistence across process restarts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use morango_core::capabilities::Capabilities;
use morango_core::filter::Filter;
use morango_core::sessions::{SyncSession, TransferSession, TransferStage, TransferStatus};

use crate::errors::SyncError;
use crate::store::Database;
use crate::sync::client::NetworkSyncConnection;

/// Transfer-session fields carried in an incoming server-side request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingTransferData {
    pub id: String,
    pub records_total: Option<i64>,
    pub client_fsic: Option<String>,
}

/// Fields shared by every context kind.
#[derive(Clone)]
pub struct ContextCore {
    pub sync_session: Option<SyncSession>,
    pub transfer_session: Option<TransferSession>,
    pub filter: Option<Filter>,
    pub is_push: Option<bool>,
    /// Intersection of both peers' capability sets.
    pub capabilities: Capabilities,
    pub error: Option<String>,
}

impl ContextCore {
    fn new(
        sync_session: Option<SyncSession>,
        filter: Option<Filter>,
        is_push: Option<bool>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            sync_session,
            transfer_session: None,
            filter,
            is_push,
            capabilities,
            error: None,
        }
    }

    /// Attach a transfer session; its fields take precedence for push
    /// direction and filter.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ContextUpdate`] if a different transfer session
    /// is already attached, or on a sync-session mismatch.
    pub fn set_transfer_session(&mut self, session: TransferSession) -> Result<(), SyncError> {
        if let Some(existing) = &self.transfer_session {
            if existing.id != session.id {
                return Err(SyncError::ContextUpdate("transfer_session"));
            }
        }
        if let Some(sync_session) = &self.sync_session {
            if session.sync_session_id != sync_session.id {
                return Err(SyncError::ContextUpdate("sync_session"));
            }
        }
        self.is_push = Some(session.push);
        if !session.filter.is_empty() {
            self.filter = Some(session.get_filter());
        }
        self.transfer_session = Some(session);
        Ok(())
    }
}

/// Context for operating on a transfer in this process.
#[derive(Clone)]
pub struct LocalSessionContext {
    pub core: ContextCore,
    /// True when this side is serving an incoming request.
    pub is_server: bool,
    /// The request payload when acting as server.
    pub request: Option<IncomingTransferData>,
    db: Arc<Database>,
}

impl LocalSessionContext {
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        sync_session: Option<SyncSession>,
        filter: Option<Filter>,
        is_push: Option<bool>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            core: ContextCore::new(sync_session, filter, is_push, capabilities),
            is_server: false,
            request: None,
            db,
        }
    }

    /// Server-side constructor: the request payload marks this context as
    /// serving, and supplies transfer-session fields from the client.
    #[must_use]
    pub fn for_server(
        db: Arc<Database>,
        sync_session: SyncSession,
        request: IncomingTransferData,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            core: ContextCore::new(Some(sync_session), None, None, capabilities),
            is_server: true,
            request: Some(request),
            db,
        }
    }

    #[must_use]
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Receiving means: server of a push, or client of a pull.
    #[must_use]
    pub fn is_receiver(&self) -> bool {
        self.core.is_push.unwrap_or_default() == self.is_server
    }

    #[must_use]
    pub fn is_producer(&self) -> bool {
        !self.is_receiver()
    }

    #[must_use]
    pub fn stage(&self) -> TransferStage {
        self.core
            .transfer_session
            .as_ref()
            .and_then(|ts| ts.transfer_stage)
            .unwrap_or(TransferStage::Initializing)
    }

    #[must_use]
    pub fn stage_status(&self) -> TransferStatus {
        self.core
            .transfer_session
            .as_ref()
            .and_then(|ts| ts.transfer_stage_status)
            .unwrap_or(TransferStatus::Pending)
    }

    /// Persist a stage/status update onto the transfer session row,
    /// refreshing the local copy first in case another actor advanced it.
    pub fn update_state(&mut self, stage: Option<TransferStage>, status: Option<TransferStatus>) {
        let Some(session) = &self.core.transfer_session else {
            return;
        };
        let mut fresh = self
            .db
            .get_transfer_session(&session.id)
            .unwrap_or_else(|| session.clone());
        fresh.update_state(stage, status);
        fresh.last_activity_timestamp = crate::store::now_millis();
        self.db.save_transfer_session(fresh.clone());
        self.core.transfer_session = Some(fresh);
    }

    /// Re-read the transfer session row, picking up writes made through
    /// other contexts or the HTTP layer.
    pub fn refresh(&mut self) {
        if let Some(session) = &self.core.transfer_session {
            if let Some(fresh) = self.db.get_transfer_session(&session.id) {
                self.core.transfer_session = Some(fresh);
            }
        }
    }
}

/// Context tracking a remote peer's transfer state while driving it over
/// HTTP.
#[derive(Clone)]
pub struct NetworkSessionContext {
    pub core: ContextCore,
    pub connection: Arc<NetworkSyncConnection>,
    stage: TransferStage,
    stage_status: TransferStatus,
    db: Arc<Database>,
}

impl NetworkSessionContext {
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        connection: Arc<NetworkSyncConnection>,
        sync_session: Option<SyncSession>,
        filter: Option<Filter>,
        is_push: Option<bool>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            core: ContextCore::new(sync_session, filter, is_push, capabilities),
            connection,
            stage: TransferStage::Initializing,
            stage_status: TransferStatus::Pending,
            db,
        }
    }

    #[must_use]
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    #[must_use]
    pub fn stage(&self) -> TransferStage {
        self.stage
    }

    #[must_use]
    pub fn stage_status(&self) -> TransferStatus {
        self.stage_status
    }

    pub fn update_state(&mut self, stage: Option<TransferStage>, status: Option<TransferStatus>) {
        if let Some(stage) = stage {
            if stage >= self.stage {
                self.stage = stage;
            }
        }
        if let Some(status) = status {
            self.stage_status = status;
        }
        // pick up transfer-session fields written through sibling contexts
        if let Some(session) = &self.core.transfer_session {
            if let Some(fresh) = self.db.get_transfer_session(&session.id) {
                self.core.transfer_session = Some(fresh);
            }
        }
    }
}

/// An ordered list of child contexts advanced together through each stage.
pub struct CompositeSessionContext {
    pub children: Vec<SessionContext>,
    /// Index of the child to (re)invoke next within the current stage.
    pub cursor: usize,
    stage: TransferStage,
    stage_status: TransferStatus,
}

impl CompositeSessionContext {
    #[must_use]
    pub fn new(children: Vec<SessionContext>) -> Self {
        Self {
            children,
            cursor: 0,
            stage: TransferStage::Initializing,
            stage_status: TransferStatus::Pending,
        }
    }
}

/// Any context a controller can drive.
pub enum SessionContext {
    Local(LocalSessionContext),
    Network(NetworkSessionContext),
    Composite(CompositeSessionContext),
}

impl SessionContext {
    #[must_use]
    pub fn stage(&self) -> TransferStage {
        match self {
            SessionContext::Local(ctx) => ctx.stage(),
            SessionContext::Network(ctx) => ctx.stage(),
            SessionContext::Composite(ctx) => ctx.stage,
        }
    }

    #[must_use]
    pub fn stage_status(&self) -> TransferStatus {
        match self {
            SessionContext::Local(ctx) => ctx.stage_status(),
            SessionContext::Network(ctx) => ctx.stage_status(),
            SessionContext::Composite(ctx) => ctx.stage_status,
        }
    }

    pub fn update_state(&mut self, stage: Option<TransferStage>, status: Option<TransferStatus>) {
        match self {
            SessionContext::Local(ctx) => ctx.update_state(stage, status),
            SessionContext::Network(ctx) => ctx.update_state(stage, status),
            SessionContext::Composite(ctx) => {
                if let Some(stage) = stage {
                    if stage >= ctx.stage {
                        ctx.stage = stage;
                    }
                }
                if let Some(status) = status {
                    ctx.stage_status = status;
                }
            }
        }
    }

    pub fn set_error(&mut self, error: String) {
        match self {
            SessionContext::Local(ctx) => ctx.core.error = Some(error),
            SessionContext::Network(ctx) => ctx.core.error = Some(error),
            SessionContext::Composite(ctx) => {
                // surface on the composite's first child holding no error
                if let Some(child) = ctx.children.first_mut() {
                    child.set_error(error);
                }
            }
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        match self {
            SessionContext::Local(ctx) => ctx.core.error.clone(),
            SessionContext::Network(ctx) => ctx.core.error.clone(),
            SessionContext::Composite(ctx) => {
                ctx.children.iter().find_map(SessionContext::error)
            }
        }
    }

    /// Reduce to the serializable resumption state.
    #[must_use]
    pub fn to_state(&self) -> SessionContextState {
        match self {
            SessionContext::Local(ctx) => SessionContextState {
                context_type: ContextType::Local,
                sync_session_id: ctx.core.sync_session.as_ref().map(|s| s.id.clone()),
                transfer_session_id: ctx.core.transfer_session.as_ref().map(|t| t.id.clone()),
                filter: ctx.core.filter.as_ref().map(ToString::to_string),
                is_push: ctx.core.is_push,
                stage: Some(ctx.stage()),
                stage_status: Some(ctx.stage_status()),
                capabilities: ctx.core.capabilities.iter().cloned().collect(),
                error: ctx.core.error.clone(),
                is_server: Some(ctx.is_server),
                cursor: None,
                children: Vec::new(),
            },
            SessionContext::Network(ctx) => SessionContextState {
                context_type: ContextType::Network,
                sync_session_id: ctx.core.sync_session.as_ref().map(|s| s.id.clone()),
                transfer_session_id: ctx.core.transfer_session.as_ref().map(|t| t.id.clone()),
                filter: ctx.core.filter.as_ref().map(ToString::to_string),
                is_push: ctx.core.is_push,
                stage: Some(ctx.stage()),
                stage_status: Some(ctx.stage_status()),
                capabilities: ctx.core.capabilities.iter().cloned().collect(),
                error: ctx.core.error.clone(),
                is_server: None,
                cursor: None,
                children: Vec::new(),
            },
            SessionContext::Composite(ctx) => SessionContextState {
                context_type: ContextType::Composite,
                sync_session_id: None,
                transfer_session_id: None,
                filter: None,
                is_push: None,
                stage: Some(ctx.stage),
                stage_status: Some(ctx.stage_status),
                capabilities: Vec::new(),
                error: None,
                is_server: None,
                cursor: Some(ctx.cursor),
                children: ctx.children.iter().map(SessionContext::to_state).collect(),
            },
        }
    }

    /// Rebuild a context from persisted state. Network children need the
    /// connection they were driving.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ResumeSync`] when referenced sessions no longer
    /// exist or a network child has no connection to rebuild with.
    pub fn from_state(
        state: &SessionContextState,
        db: &Arc<Database>,
        connection: Option<&Arc<NetworkSyncConnection>>,
    ) -> Result<Self, SyncError> {
        let load_sessions = |state: &SessionContextState| -> Result<
            (Option<SyncSession>, Option<TransferSession>),
            SyncError,
        > {
            let transfer_session = match &state.transfer_session_id {
                Some(id) => Some(db.get_transfer_session(id).ok_or_else(|| {
                    SyncError::ResumeSync(format!("transfer session {id} no longer exists"))
                })?),
                None => None,
            };
            let sync_session_id = state.sync_session_id.clone().or_else(|| {
                transfer_session
                    .as_ref()
                    .map(|ts| ts.sync_session_id.clone())
            });
            let sync_session = match sync_session_id {
                Some(id) => Some(db.get_sync_session(&id).ok_or_else(|| {
                    SyncError::ResumeSync(format!("sync session {id} no longer exists"))
                })?),
                None => None,
            };
            Ok((sync_session, transfer_session))
        };

        match state.context_type {
            ContextType::Local => {
                let (sync_session, transfer_session) = load_sessions(state)?;
                let mut ctx = LocalSessionContext::new(
                    Arc::clone(db),
                    sync_session,
                    state.filter.as_deref().map(Filter::from),
                    state.is_push,
                    state.capabilities.iter().cloned().collect(),
                );
                ctx.is_server = state.is_server.unwrap_or(false);
                if let Some(session) = transfer_session {
                    ctx.core.set_transfer_session(session)?;
                }
                ctx.core.error = state.error.clone();
                Ok(SessionContext::Local(ctx))
            }
            ContextType::Network => {
                let connection = connection.ok_or_else(|| {
                    SyncError::ResumeSync("network context requires a connection".into())
                })?;
                let (sync_session, transfer_session) = load_sessions(state)?;
                let mut ctx = NetworkSessionContext::new(
                    Arc::clone(db),
                    Arc::clone(connection),
                    sync_session,
                    state.filter.as_deref().map(Filter::from),
                    state.is_push,
                    state.capabilities.iter().cloned().collect(),
                );
                if let Some(session) = transfer_session {
                    ctx.core.set_transfer_session(session)?;
                }
                ctx.stage = state.stage.unwrap_or(TransferStage::Initializing);
                ctx.stage_status = state.stage_status.unwrap_or(TransferStatus::Pending);
                ctx.core.error = state.error.clone();
                Ok(SessionContext::Network(ctx))
            }
            ContextType::Composite => {
                let children = state
                    .children
                    .iter()
                    .map(|child| SessionContext::from_state(child, db, connection))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut composite = CompositeSessionContext::new(children);
                composite.cursor = state.cursor.unwrap_or(0);
                composite.stage = state.stage.unwrap_or(TransferStage::Initializing);
                composite.stage_status = state.stage_status.unwrap_or(TransferStatus::Pending);
                Ok(SessionContext::Composite(composite))
            }
        }
    }
}

/// Discriminant for persisted context state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    Local,
    Network,
    Composite,
}

/// The serializable reduction of a context, sufficient to resume a paused
/// sync in another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContextState {
    pub context_type: ContextType,
    pub sync_session_id: Option<String>,
    pub transfer_session_id: Option<String>,
    pub filter: Option<String>,
    pub is_push: Option<bool>,
    pub stage: Option<TransferStage>,
    pub stage_status: Option<TransferStatus>,
    pub capabilities: Vec<String>,
    pub error: Option<String>,
    pub is_server: Option<bool>,
    pub cursor: Option<usize>,
    #[serde(default)]
    pub children: Vec<SessionContextState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceIdentity;
    use morango_core::sessions::ConnectionKind;

    fn db() -> Arc<Database> {
        Arc::new(Database::new(InstanceIdentity::default()))
    }

    fn sync_session() -> SyncSession {
        SyncSession {
            id: "s".repeat(32),
            start_timestamp: 0,
            last_activity_timestamp: 0,
            active: true,
            is_server: false,
            client_certificate_id: None,
            server_certificate_id: None,
            profile: "testprofile".into(),
            connection_kind: ConnectionKind::Network,
            connection_path: String::new(),
            client_ip: String::new(),
            server_ip: String::new(),
            client_instance: "{}".into(),
            server_instance: "{}".into(),
            process_id: None,
            extra_fields: "{}".into(),
        }
    }

    fn transfer_session() -> TransferSession {
        TransferSession {
            id: "t".repeat(32),
            filter: "abc".into(),
            push: true,
            active: true,
            records_transferred: 0,
            records_total: None,
            bytes_sent: 0,
            bytes_received: 0,
            sync_session_id: "s".repeat(32),
            start_timestamp: 0,
            last_activity_timestamp: 0,
            client_fsic: "{}".into(),
            server_fsic: "{}".into(),
            transfer_stage: Some(TransferStage::Serializing),
            transfer_stage_status: Some(TransferStatus::Completed),
        }
    }

    #[test]
    fn transfer_session_attaches_once() {
        let db = db();
        let mut ctx = LocalSessionContext::new(
            Arc::clone(&db),
            Some(sync_session()),
            None,
            None,
            Capabilities::new(),
        );
        ctx.core.set_transfer_session(transfer_session()).unwrap();
        assert_eq!(ctx.core.is_push, Some(true));
        assert_eq!(ctx.core.filter.as_ref().unwrap().partitions(), ["abc"]);

        // re-attaching the same session is fine; a different one errors
        ctx.core.set_transfer_session(transfer_session()).unwrap();
        let mut other = transfer_session();
        other.id = "u".repeat(32);
        assert!(matches!(
            ctx.core.set_transfer_session(other),
            Err(SyncError::ContextUpdate(_))
        ));
    }

    #[test]
    fn sync_session_mismatch_is_rejected() {
        let db = db();
        let mut ctx = LocalSessionContext::new(
            Arc::clone(&db),
            Some(sync_session()),
            None,
            None,
            Capabilities::new(),
        );
        let mut foreign = transfer_session();
        foreign.sync_session_id = "z".repeat(32);
        assert!(ctx.core.set_transfer_session(foreign).is_err());
    }

    #[test]
    fn receiver_producer_matrix() {
        let db = db();
        let cases = [
            // (is_push, is_server, is_receiver)
            (true, true, true),
            (true, false, false),
            (false, true, false),
            (false, false, true),
        ];
        for (is_push, is_server, expected) in cases {
            let mut ctx = LocalSessionContext::new(
                Arc::clone(&db),
                None,
                None,
                Some(is_push),
                Capabilities::new(),
            );
            ctx.is_server = is_server;
            assert_eq!(ctx.is_receiver(), expected, "push={is_push} server={is_server}");
            assert_eq!(ctx.is_producer(), !expected);
        }
    }

    #[test]
    fn local_state_persists_to_transfer_session_row() {
        let db = db();
        db.save_sync_session(sync_session());
        db.save_transfer_session(transfer_session());
        let mut ctx = LocalSessionContext::new(
            Arc::clone(&db),
            Some(sync_session()),
            None,
            None,
            Capabilities::new(),
        );
        ctx.core
            .set_transfer_session(db.get_transfer_session(&"t".repeat(32)).unwrap())
            .unwrap();

        ctx.update_state(Some(TransferStage::Queuing), Some(TransferStatus::Started));

        let row = db.get_transfer_session(&"t".repeat(32)).unwrap();
        assert_eq!(row.transfer_stage, Some(TransferStage::Queuing));
        assert_eq!(row.transfer_stage_status, Some(TransferStatus::Started));
        assert_eq!(ctx.stage(), TransferStage::Queuing);
    }

    #[test]
    fn local_context_roundtrips_through_state() {
        let db = db();
        db.save_sync_session(sync_session());
        db.save_transfer_session(transfer_session());
        let mut ctx = LocalSessionContext::new(
            Arc::clone(&db),
            Some(sync_session()),
            None,
            None,
            ["async_operations".to_string()].into_iter().collect(),
        );
        ctx.core
            .set_transfer_session(db.get_transfer_session(&"t".repeat(32)).unwrap())
            .unwrap();
        let context = SessionContext::Local(ctx);

        let state = context.to_state();
        let text = serde_json::to_string(&state).unwrap();
        let parsed: SessionContextState = serde_json::from_str(&text).unwrap();
        let rebuilt = SessionContext::from_state(&parsed, &db, None).unwrap();

        assert_eq!(rebuilt.stage(), context.stage());
        assert_eq!(rebuilt.stage_status(), context.stage_status());
        let SessionContext::Local(rebuilt) = rebuilt else {
            panic!("expected local context");
        };
        assert_eq!(
            rebuilt.core.transfer_session.as_ref().map(|t| t.id.clone()),
            Some("t".repeat(32))
        );
        assert!(rebuilt.core.capabilities.contains("async_operations"));
    }

    #[test]
    fn resume_fails_when_sessions_are_gone() {
        let db = db();
        let state = SessionContextState {
            context_type: ContextType::Local,
            sync_session_id: None,
            transfer_session_id: Some("missing".into()),
            filter: None,
            is_push: None,
            stage: None,
            stage_status: None,
            capabilities: Vec::new(),
            error: None,
            is_server: Some(false),
            cursor: None,
            children: Vec::new(),
        };
        assert!(matches!(
            SessionContext::from_state(&state, &db, None),
            Err(SyncError::ResumeSync(_))
        ));
    }
}
