//! The middleware operations registered for each transfer stage.
//!
//! Each operation declares the context kind it expects by matching on the
//! [`SessionContext`] variant; a mismatch returns
//! [`HandleOutcome::Unhandled`] so the controller falls through to the next
//! operation for the stage. Local operations do the work in this process;
//! network operations drive the remote peer by creating, updating, and
//! polling its transfer session; the legacy variants cover peers without the
//! `async_operations` capability, which serialize and queue during session
//! creation and dequeue during session close.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use morango_core::capabilities::{ASYNC_OPERATIONS, FSIC_V2_FORMAT};
use morango_core::messages::{
    BufferPayload, CreateTransferSessionRequest, TransferSessionResponse,
    UpdateTransferSessionRequest,
};
use morango_core::sessions::{TransferSession, TransferStage, TransferStatus};
use morango_core::uuids::random_uuid;

use crate::engine::SyncEngine;
use crate::errors::SyncError;
use crate::store::now_millis;
use crate::sync::context::{NetworkSessionContext, SessionContext};
use crate::sync::controller::MiddlewareEntry;
use crate::sync::queueing::{
    calculate_fsic, dequeue_into_store, queue_into_buffer, update_fsics,
    validate_and_create_buffer_data,
};
use crate::sync::serializer::{deserialize_from_store, serialize_into_store};

/// What an operation did with the context it was offered.
pub enum HandleOutcome {
    /// The context is not of the kind this operation works on.
    Unhandled,
    /// The operation ran; the stage now has this status.
    Status(TransferStatus),
}

/// One middleware operation.
#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle the context, or report it unhandled so the next operation for
    /// the stage is tried.
    async fn handle(&self, context: &mut SessionContext)
        -> Result<HandleOutcome, SyncError>;
}

const UNHANDLED: Result<HandleOutcome, SyncError> = Ok(HandleOutcome::Unhandled);

fn completed() -> Result<HandleOutcome, SyncError> {
    Ok(HandleOutcome::Status(TransferStatus::Completed))
}

fn status(value: TransferStatus) -> Result<HandleOutcome, SyncError> {
    Ok(HandleOutcome::Status(value))
}

/// Persist a transfer session and mirror it back onto the context copy.
fn save_session(engine: &SyncEngine, ctx_session: &mut Option<TransferSession>, mut session: TransferSession) {
    session.last_activity_timestamp = now_millis();
    engine.db().save_transfer_session(session.clone());
    *ctx_session = Some(session);
}

// ---------------------------------------------------------------------------
// Local operations
// ---------------------------------------------------------------------------

/// Ensure a transfer session exists for this direction and sync session.
pub struct InitializeOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for InitializeOperation {
    fn name(&self) -> &'static str {
        "initialize"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        if local.core.transfer_session.is_some() {
            // resuming with a session already attached
            return completed();
        }
        let Some(sync_session) = local.core.sync_session.clone() else {
            return UNHANDLED;
        };
        let Some(is_push) = local.core.is_push else {
            return UNHANDLED;
        };

        // resume the most recent matching session if one is still active
        let existing = self
            .engine
            .db()
            .transfer_sessions_for_sync(&sync_session.id, true)
            .into_iter()
            .filter(|ts| ts.push == is_push)
            .max_by_key(|ts| ts.last_activity_timestamp);

        let session = match existing {
            Some(session) => session,
            None => {
                if local.is_server && local.request.is_none() {
                    return Err(SyncError::ResumeSync(
                        "cannot create transfer session without request as server".into(),
                    ));
                }
                let request = local.request.as_ref();
                let session = TransferSession {
                    id: request
                        .map(|r| r.id.clone())
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(random_uuid),
                    filter: local
                        .core
                        .filter
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    push: is_push,
                    active: true,
                    records_transferred: 0,
                    records_total: if is_push {
                        request.and_then(|r| r.records_total)
                    } else {
                        None
                    },
                    bytes_sent: 0,
                    bytes_received: 0,
                    sync_session_id: sync_session.id.clone(),
                    start_timestamp: now_millis(),
                    last_activity_timestamp: now_millis(),
                    client_fsic: request
                        .and_then(|r| r.client_fsic.clone())
                        .unwrap_or_else(|| "{}".to_string()),
                    server_fsic: "{}".to_string(),
                    transfer_stage: Some(TransferStage::Initializing),
                    transfer_stage_status: None,
                };
                self.engine.db().save_transfer_session(session.clone());
                session
            }
        };

        local.core.set_transfer_session(session)?;
        completed()
    }
}

/// Serialize app data if producing, then record this side's FSIC.
pub struct SerializeOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for SerializeOperation {
    fn name(&self) -> &'static str {
        "serialize"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        let Some(sync_session) = local.core.sync_session.clone() else {
            return UNHANDLED;
        };
        let Some(filter) = local.core.filter.clone() else {
            return UNHANDLED;
        };
        let Some(mut session) = local.core.transfer_session.clone() else {
            return UNHANDLED;
        };

        if local.is_producer() && self.engine.config().serialize_before_queuing {
            serialize_into_store(
                self.engine.db(),
                self.engine.registry(),
                &sync_session.profile,
                Some(&filter),
            );
        }

        let use_v2 = local.core.capabilities.contains(FSIC_V2_FORMAT);
        let fsic = calculate_fsic(self.engine.db(), &filter, use_v2).to_json();
        if local.is_server {
            session.server_fsic = fsic;
            if let Some(client_fsic) = local.request.as_ref().and_then(|r| r.client_fsic.clone())
            {
                session.client_fsic = client_fsic;
            }
        } else {
            session.client_fsic = fsic;
        }
        save_session(&self.engine, &mut local.core.transfer_session, session);
        completed()
    }
}

/// Producer side: select and buffer the records to send.
pub struct ProducerQueueOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for ProducerQueueOperation {
    fn name(&self) -> &'static str {
        "queue:producer"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        if !local.is_producer() {
            return UNHANDLED;
        }
        let Some(sync_session) = local.core.sync_session.clone() else {
            return UNHANDLED;
        };
        local.refresh();
        let Some(mut session) = local.core.transfer_session.clone() else {
            return UNHANDLED;
        };

        queue_into_buffer(self.engine.db(), &session, &sync_session.profile)?;
        let records_total = self.engine.db().count_buffers(&session.id);
        debug!(records_total, "queued records");
        session.records_total = Some(i64::try_from(records_total).unwrap_or(i64::MAX));
        save_session(&self.engine, &mut local.core.transfer_session, session);
        completed()
    }
}

/// Receiver side has nothing to queue.
pub struct ReceiverQueueOperation;

#[async_trait]
impl Operation for ReceiverQueueOperation {
    fn name(&self) -> &'static str {
        "queue:receiver"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        if !local.is_receiver() {
            return UNHANDLED;
        }
        completed()
    }
}

/// Server receiving a push: complete once every record has arrived.
pub struct PushReceiverOperation;

#[async_trait]
impl Operation for PushReceiverOperation {
    fn name(&self) -> &'static str {
        "transfer:push-receiver"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        if local.core.is_push != Some(true) || !local.is_receiver() || local.request.is_none() {
            return UNHANDLED;
        }
        local.refresh();
        let Some(session) = local.core.transfer_session.as_ref() else {
            return UNHANDLED;
        };
        if session.records_transferred >= session.records_total.unwrap_or(0) {
            completed()
        } else {
            status(TransferStatus::Pending)
        }
    }
}

/// Server producing a pull: complete once the client reports all records.
pub struct PullProducerOperation;

#[async_trait]
impl Operation for PullProducerOperation {
    fn name(&self) -> &'static str {
        "transfer:pull-producer"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        if local.core.is_push != Some(false) || !local.is_producer() || local.request.is_none() {
            return UNHANDLED;
        }
        local.refresh();
        let Some(session) = local.core.transfer_session.as_ref() else {
            return UNHANDLED;
        };
        if session.records_transferred >= session.records_total.unwrap_or(0) {
            completed()
        } else {
            status(TransferStatus::Pending)
        }
    }
}

/// Producers have nothing to dequeue.
pub struct ProducerDequeueOperation;

#[async_trait]
impl Operation for ProducerDequeueOperation {
    fn name(&self) -> &'static str {
        "dequeue:producer"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        if !local.is_producer() {
            return UNHANDLED;
        }
        completed()
    }
}

/// Receiver side: merge received buffers into the store.
pub struct ReceiverDequeueOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for ReceiverDequeueOperation {
    fn name(&self) -> &'static str {
        "dequeue:receiver"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        if !local.is_receiver() {
            return UNHANDLED;
        }
        local.refresh();
        let Some(session) = local.core.transfer_session.clone() else {
            return UNHANDLED;
        };
        if session.records_transferred > 0 {
            dequeue_into_store(self.engine.db(), &session);
        }
        completed()
    }
}

/// Producers have nothing to deserialize.
pub struct ProducerDeserializeOperation;

#[async_trait]
impl Operation for ProducerDeserializeOperation {
    fn name(&self) -> &'static str {
        "deserialize:producer"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        if !local.is_producer() {
            return UNHANDLED;
        }
        completed()
    }
}

/// Receiver side: integrate dequeued rows into the app layer, then absorb
/// the other side's FSIC into the database max counters.
pub struct ReceiverDeserializeOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for ReceiverDeserializeOperation {
    fn name(&self) -> &'static str {
        "deserialize:receiver"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        if !local.is_receiver() {
            return UNHANDLED;
        }
        let Some(sync_session) = local.core.sync_session.clone() else {
            return UNHANDLED;
        };
        let Some(filter) = local.core.filter.clone() else {
            return UNHANDLED;
        };
        local.refresh();
        let Some(session) = local.core.transfer_session.clone() else {
            return UNHANDLED;
        };

        if self.engine.config().deserialize_after_dequeuing && session.records_transferred > 0 {
            // serialize first so local edits cannot collide mid-rehydration
            serialize_into_store(
                self.engine.db(),
                self.engine.registry(),
                &sync_session.profile,
                Some(&filter),
            );
            deserialize_from_store(
                self.engine.db(),
                self.engine.registry(),
                &sync_session.profile,
                Some(&filter),
            );
        }

        let incoming = if local.is_server {
            &session.client_fsic
        } else {
            &session.server_fsic
        };
        let fsic = morango_core::Fsic::from_json(incoming)?;
        update_fsics(self.engine.db(), &fsic, &filter);
        completed()
    }
}

/// Mark the local transfer session inactive and drop producer-side buffers.
pub struct CleanupOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for CleanupOperation {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Local(local) = context else {
            return UNHANDLED;
        };
        local.refresh();
        let Some(mut session) = local.core.transfer_session.clone() else {
            return UNHANDLED;
        };
        if local.is_producer() {
            self.engine.db().delete_buffers(&session.id);
        }
        session.active = false;
        save_session(&self.engine, &mut local.core.transfer_session, session);
        completed()
    }
}

// ---------------------------------------------------------------------------
// Network operations
// ---------------------------------------------------------------------------

/// Read the remote stage and push it forward if it trails `stage`. Returns
/// the remote's effective status plus its latest reported state.
async fn remote_proceed_to(
    net: &NetworkSessionContext,
    session_id: &str,
    stage: TransferStage,
    mut update: UpdateTransferSessionRequest,
) -> Result<(TransferStatus, TransferSessionResponse), SyncError> {
    let mut data = net.connection.get_transfer_session(session_id).await?;
    let remote_stage = data.transfer_stage.unwrap_or(TransferStage::Initializing);

    let remote_status = if remote_stage < stage {
        update.transfer_stage = Some(stage);
        data = net
            .connection
            .update_transfer_session(session_id, &update)
            .await?;
        data.transfer_stage_status
    } else if remote_stage > stage {
        Some(TransferStatus::Completed)
    } else {
        data.transfer_stage_status
    };

    let remote_status = remote_status
        .ok_or_else(|| SyncError::ResumeSync(format!("remote failed to proceed to {stage}")))?;

    // still working: tell the controller to poll again
    let effective = if remote_status.is_in_progress() {
        TransferStatus::Pending
    } else {
        remote_status
    };
    Ok((effective, data))
}

/// Create the remote transfer session (async-capable peer).
pub struct NetworkInitializeOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for NetworkInitializeOperation {
    fn name(&self) -> &'static str {
        "initialize:network"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if !net.core.capabilities.contains(ASYNC_OPERATIONS) {
            return UNHANDLED;
        }
        let Some(session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };

        if net.stage() < TransferStage::Transferring {
            net.connection
                .create_transfer_session(&CreateTransferSessionRequest {
                    id: session.id.clone(),
                    filter: session.filter.clone(),
                    push: session.push,
                    sync_session_id: session.sync_session_id.clone(),
                    client_fsic: Some(session.client_fsic.clone()),
                    records_total: None,
                })
                .await?;
        }
        completed()
    }
}

/// Create the remote transfer session on a legacy peer, which serializes
/// and queues during creation.
pub struct LegacyNetworkInitializeOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for LegacyNetworkInitializeOperation {
    fn name(&self) -> &'static str {
        "initialize:network-legacy"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if net.core.capabilities.contains(ASYNC_OPERATIONS) {
            return UNHANDLED;
        }
        let Some(mut session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };
        if net.stage() >= TransferStage::Transferring {
            return completed();
        }

        let data = net
            .connection
            .create_transfer_session(&CreateTransferSessionRequest {
                id: session.id.clone(),
                filter: session.filter.clone(),
                push: session.push,
                sync_session_id: session.sync_session_id.clone(),
                client_fsic: Some(session.client_fsic.clone()),
                records_total: session.records_total,
            })
            .await?;

        session.server_fsic = if data.server_fsic.is_empty() {
            "{}".to_string()
        } else {
            data.server_fsic
        };
        if !session.push {
            session.records_total = data.records_total;
        }
        save_session(&self.engine, &mut net.core.transfer_session, session);
        completed()
    }
}

/// Drive the remote through its serialize stage and capture its FSIC.
pub struct NetworkSerializeOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for NetworkSerializeOperation {
    fn name(&self) -> &'static str {
        "serialize:network"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if !net.core.capabilities.contains(ASYNC_OPERATIONS) {
            return UNHANDLED;
        }
        let Some(mut session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };

        let (remote_status, data) = remote_proceed_to(
            net,
            &session.id,
            TransferStage::Serializing,
            UpdateTransferSessionRequest {
                client_fsic: Some(session.client_fsic.clone()),
                ..Default::default()
            },
        )
        .await?;

        if remote_status == TransferStatus::Completed {
            session.server_fsic = if data.server_fsic.is_empty() {
                "{}".to_string()
            } else {
                data.server_fsic
            };
            save_session(&self.engine, &mut net.core.transfer_session, session);
        }
        status(remote_status)
    }
}

/// Legacy peers serialized during initialization; nothing to do here.
pub struct LegacyNetworkSerializeOperation;

#[async_trait]
impl Operation for LegacyNetworkSerializeOperation {
    fn name(&self) -> &'static str {
        "serialize:network-legacy"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if net.core.capabilities.contains(ASYNC_OPERATIONS) {
            return UNHANDLED;
        }
        completed()
    }
}

/// Drive the remote through its queue stage.
pub struct NetworkQueueOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for NetworkQueueOperation {
    fn name(&self) -> &'static str {
        "queue:network"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if !net.core.capabilities.contains(ASYNC_OPERATIONS) {
            return UNHANDLED;
        }
        let Some(mut session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };

        let update = UpdateTransferSessionRequest {
            records_total: if session.push {
                session.records_total
            } else {
                None
            },
            ..Default::default()
        };
        let (remote_status, data) =
            remote_proceed_to(net, &session.id, TransferStage::Queuing, update).await?;

        if !session.push && remote_status == TransferStatus::Completed {
            session.records_total = data.records_total;
            save_session(&self.engine, &mut net.core.transfer_session, session);
        }
        status(remote_status)
    }
}

/// Legacy peers queued during initialization; just report push totals.
pub struct LegacyNetworkQueueOperation;

#[async_trait]
impl Operation for LegacyNetworkQueueOperation {
    fn name(&self) -> &'static str {
        "queue:network-legacy"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if net.core.capabilities.contains(ASYNC_OPERATIONS) {
            return UNHANDLED;
        }
        let Some(session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };
        if session.push {
            net.connection
                .update_transfer_session(
                    &session.id,
                    &UpdateTransferSessionRequest {
                        records_total: session.records_total,
                        ..Default::default()
                    },
                )
                .await?;
        }
        completed()
    }
}

/// Push buffered records to the remote in chunks.
pub struct NetworkPushTransferOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for NetworkPushTransferOperation {
    fn name(&self) -> &'static str {
        "transfer:network-push"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if net.core.is_push != Some(true) {
            return UNHANDLED;
        }
        let Some(mut session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };

        let records_total = session.records_total.unwrap_or(0);
        if records_total == 0 {
            return completed();
        }

        let offset = usize::try_from(session.records_transferred).unwrap_or(0);
        let chunk_size = self.engine.config().chunk_size;
        let payloads: Vec<BufferPayload> = self
            .engine
            .db()
            .buffers_chunk(&session.id, offset, chunk_size)
            .iter()
            .map(|(buffer, rmcbs)| BufferPayload::from_records(buffer, rmcbs))
            .collect();

        net.connection.push_buffers(&payloads).await?;

        session.records_transferred = (session.records_transferred
            + i64::try_from(chunk_size).unwrap_or(i64::MAX))
        .min(records_total);
        session.bytes_sent = net.connection.bytes_sent();
        session.bytes_received = net.connection.bytes_received();
        let done = session.records_transferred >= records_total;
        save_session(&self.engine, &mut net.core.transfer_session, session);

        if done {
            completed()
        } else {
            status(TransferStatus::Pending)
        }
    }
}

/// Pull one chunk of buffers from the remote and report progress back.
pub struct NetworkPullTransferOperation {
    pub engine: Arc<SyncEngine>,
}

#[async_trait]
impl Operation for NetworkPullTransferOperation {
    fn name(&self) -> &'static str {
        "transfer:network-pull"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if net.core.is_push != Some(false) {
            return UNHANDLED;
        }
        let Some(sync_session) = net.core.sync_session.clone() else {
            return UNHANDLED;
        };
        let Some(mut session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };

        let records_total = session.records_total.unwrap_or(0);
        if records_total > 0 {
            let offset = usize::try_from(session.records_transferred).unwrap_or(0);
            let payloads = net
                .connection
                .pull_buffers(&session.id, self.engine.config().chunk_size, offset)
                .await?;
            for payload in &payloads {
                if payload.transfer_session_id != session.id {
                    return Err(SyncError::InvalidBuffer(
                        "pulled record belongs to a different transfer session".into(),
                    ));
                }
            }
            validate_and_create_buffer_data(
                self.engine.db(),
                &session,
                &sync_session.profile,
                payloads,
            )?;
            if let Some(fresh) = self.engine.db().get_transfer_session(&session.id) {
                session = fresh;
            }
            session.bytes_sent = net.connection.bytes_sent();
            session.bytes_received = net.connection.bytes_received();
        }

        let done = session.records_transferred >= records_total;

        // keep the remote's view of progress in agreement with ours; byte
        // directions flip because they describe the remote's perspective
        net.connection
            .update_transfer_session(
                &session.id,
                &UpdateTransferSessionRequest {
                    transfer_stage: Some(TransferStage::Transferring),
                    records_transferred: Some(session.records_transferred),
                    bytes_received: Some(session.bytes_sent),
                    bytes_sent: Some(session.bytes_received),
                    ..Default::default()
                },
            )
            .await?;
        save_session(&self.engine, &mut net.core.transfer_session, session);

        if done {
            completed()
        } else {
            status(TransferStatus::Pending)
        }
    }
}

/// Drive the remote through its dequeue stage.
pub struct NetworkDequeueOperation;

#[async_trait]
impl Operation for NetworkDequeueOperation {
    fn name(&self) -> &'static str {
        "dequeue:network"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if !net.core.capabilities.contains(ASYNC_OPERATIONS) {
            return UNHANDLED;
        }
        let Some(session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };
        let (remote_status, _) = remote_proceed_to(
            net,
            &session.id,
            TransferStage::Dequeuing,
            UpdateTransferSessionRequest::default(),
        )
        .await?;
        status(remote_status)
    }
}

/// Drive the remote through its deserialize stage.
pub struct NetworkDeserializeOperation;

#[async_trait]
impl Operation for NetworkDeserializeOperation {
    fn name(&self) -> &'static str {
        "deserialize:network"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if !net.core.capabilities.contains(ASYNC_OPERATIONS) {
            return UNHANDLED;
        }
        let Some(session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };
        let (remote_status, _) = remote_proceed_to(
            net,
            &session.id,
            TransferStage::Deserializing,
            UpdateTransferSessionRequest::default(),
        )
        .await?;
        status(remote_status)
    }
}

/// Legacy peers dequeue and deserialize when the session closes.
pub struct LegacyNetworkNoOpOperation {
    name: &'static str,
}

impl LegacyNetworkNoOpOperation {
    #[must_use]
    pub fn dequeue() -> Self {
        Self {
            name: "dequeue:network-legacy",
        }
    }

    #[must_use]
    pub fn deserialize() -> Self {
        Self {
            name: "deserialize:network-legacy",
        }
    }
}

#[async_trait]
impl Operation for LegacyNetworkNoOpOperation {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        if net.core.capabilities.contains(ASYNC_OPERATIONS) {
            return UNHANDLED;
        }
        completed()
    }
}

/// Close the remote transfer session.
pub struct NetworkCleanupOperation;

#[async_trait]
impl Operation for NetworkCleanupOperation {
    fn name(&self) -> &'static str {
        "cleanup:network"
    }

    async fn handle(&self, context: &mut SessionContext) -> Result<HandleOutcome, SyncError> {
        let SessionContext::Network(net) = context else {
            return UNHANDLED;
        };
        let Some(session) = net.core.transfer_session.clone() else {
            return UNHANDLED;
        };
        match net.connection.close_transfer_session(&session.id).await {
            Ok(()) => completed(),
            Err(err) => {
                net.core.error = Some(err.to_string());
                status(TransferStatus::Errored)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware assembly
// ---------------------------------------------------------------------------

/// The built-in middleware set, one entry per stage. Order within a stage
/// matters: local operations run before their network counterparts.
#[must_use]
pub fn session_middleware(engine: &Arc<SyncEngine>) -> Vec<MiddlewareEntry> {
    vec![
        MiddlewareEntry {
            stage: TransferStage::Initializing,
            operations: vec![
                Arc::new(InitializeOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(NetworkInitializeOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(LegacyNetworkInitializeOperation {
                    engine: Arc::clone(engine),
                }),
            ],
        },
        MiddlewareEntry {
            stage: TransferStage::Serializing,
            operations: vec![
                Arc::new(SerializeOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(NetworkSerializeOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(LegacyNetworkSerializeOperation),
            ],
        },
        MiddlewareEntry {
            stage: TransferStage::Queuing,
            operations: vec![
                Arc::new(ProducerQueueOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(ReceiverQueueOperation),
                Arc::new(NetworkQueueOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(LegacyNetworkQueueOperation),
            ],
        },
        MiddlewareEntry {
            stage: TransferStage::Transferring,
            operations: vec![
                Arc::new(PushReceiverOperation),
                Arc::new(PullProducerOperation),
                Arc::new(NetworkPushTransferOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(NetworkPullTransferOperation {
                    engine: Arc::clone(engine),
                }),
            ],
        },
        MiddlewareEntry {
            stage: TransferStage::Dequeuing,
            operations: vec![
                Arc::new(ProducerDequeueOperation),
                Arc::new(ReceiverDequeueOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(NetworkDequeueOperation),
                Arc::new(LegacyNetworkNoOpOperation::dequeue()),
            ],
        },
        MiddlewareEntry {
            stage: TransferStage::Deserializing,
            operations: vec![
                Arc::new(ProducerDeserializeOperation),
                Arc::new(ReceiverDeserializeOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(NetworkDeserializeOperation),
                Arc::new(LegacyNetworkNoOpOperation::deserialize()),
            ],
        },
        MiddlewareEntry {
            stage: TransferStage::Cleanup,
            operations: vec![
                Arc::new(CleanupOperation {
                    engine: Arc::clone(engine),
                }),
                Arc::new(NetworkCleanupOperation),
            ],
        },
    ]
}
