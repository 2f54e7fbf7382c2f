//! The session controller: drives a context through the transfer stages by
//! invoking registered middleware operations.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use morango_core::sessions::{TransferStage, TransferStatus};

use crate::sync::context::SessionContext;
use crate::sync::operations::{HandleOutcome, Operation};

/// The operations registered for one stage, tried in order until one
/// handles the context.
#[derive(Clone)]
pub struct MiddlewareEntry {
    pub stage: TransferStage,
    pub operations: Vec<Arc<dyn Operation>>,
}

enum OpOutcome {
    Handled(TransferStatus),
    Unhandled,
}

async fn run_operations(
    entry: &MiddlewareEntry,
    context: &mut SessionContext,
) -> Result<OpOutcome, crate::errors::SyncError> {
    for operation in &entry.operations {
        debug!(stage = %entry.stage, operation = operation.name(), "trying operation");
        match operation.handle(context).await? {
            HandleOutcome::Unhandled => {}
            HandleOutcome::Status(status) => {
                debug!(stage = %entry.stage, operation = operation.name(), %status, "operation handled stage");
                return Ok(OpOutcome::Handled(status));
            }
        }
    }
    Ok(OpOutcome::Unhandled)
}

/// Drives transfer contexts through the staged middleware.
///
/// `proceed_to` advances stage by stage; middleware returning a
/// non-completed status stops progress so the caller can retry (PENDING),
/// wait for async work (STARTED), or surface the failure (ERRORED). The
/// controller never discards an errored status on its own.
pub struct SessionController {
    middleware: Vec<MiddlewareEntry>,
    pub context: SessionContext,
}

impl SessionController {
    #[must_use]
    pub fn new(middleware: Vec<MiddlewareEntry>, context: SessionContext) -> Self {
        Self {
            middleware,
            context,
        }
    }

    /// Invoke middleware for each stage from the current one up to and
    /// including `target`, stopping at the first non-completed status.
    pub async fn proceed_to(&mut self, target: TransferStage) -> TransferStatus {
        // a stage we've already passed cannot be proceeded to again
        if self.context.stage() > target {
            return TransferStatus::Completed;
        }
        let status = self.context.stage_status();
        if matches!(status, TransferStatus::Started | TransferStatus::Errored) {
            return status;
        }

        let mut result = if self.context.stage() == target && status == TransferStatus::Completed
        {
            TransferStatus::Completed
        } else {
            TransferStatus::Pending
        };

        let middleware = self.middleware.clone();
        for entry in &middleware {
            if entry.stage > target {
                break;
            }
            let current_stage = self.context.stage();
            let current_status = self.context.stage_status();
            if entry.stage > current_stage
                || (current_status == TransferStatus::Pending && entry.stage == current_stage)
            {
                result = self.invoke_middleware(entry).await;
                if result != TransferStatus::Completed {
                    break;
                }
            }
        }
        result
    }

    /// Like [`proceed_to`](Self::proceed_to) but retries with exponential
    /// backoff (`min(0.3 * (2^n - 1), max_interval)` seconds) until a
    /// terminal status is reached.
    pub async fn proceed_to_and_wait_for(
        &mut self,
        target: TransferStage,
        max_interval: f64,
    ) -> TransferStatus {
        let mut tries: i32 = 0;
        loop {
            if tries > 0 {
                let backoff = (0.3 * (2f64.powi(tries) - 1.0)).min(max_interval);
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            }
            let result = self.proceed_to(target).await;
            tries += 1;
            if result.is_finished() {
                return result;
            }
        }
    }

    async fn invoke_middleware(&mut self, entry: &MiddlewareEntry) -> TransferStatus {
        self.context
            .update_state(Some(entry.stage), Some(TransferStatus::Pending));

        let status = if matches!(self.context, SessionContext::Composite(_)) {
            self.invoke_composite(entry).await
        } else {
            match run_operations(entry, &mut self.context).await {
                Ok(OpOutcome::Handled(status)) => status,
                Ok(OpOutcome::Unhandled) => {
                    error!(stage = %entry.stage, "no operation handled stage");
                    self.context
                        .set_error(format!("no operation handled stage {}", entry.stage));
                    TransferStatus::Errored
                }
                Err(err) => {
                    error!(stage = %entry.stage, %err, "operation failed");
                    self.context.set_error(err.to_string());
                    TransferStatus::Errored
                }
            }
        };

        // leave the result alone if an operation advanced the stage itself
        if self.context.stage() == entry.stage {
            self.context.update_state(None, Some(status));
        }
        status
    }

    /// Drive each composite child through the stage in order, resuming at
    /// the child where a previous invocation stopped. A child with no
    /// matching operation for this stage simply has nothing to do.
    async fn invoke_composite(&mut self, entry: &MiddlewareEntry) -> TransferStatus {
        let SessionContext::Composite(composite) = &mut self.context else {
            return TransferStatus::Errored;
        };

        let mut index = composite.cursor;
        while index < composite.children.len() {
            // share the transfer session created by an earlier child
            let session = composite.children.iter().find_map(|child| match child {
                SessionContext::Local(ctx) => ctx.core.transfer_session.clone(),
                SessionContext::Network(ctx) => ctx.core.transfer_session.clone(),
                SessionContext::Composite(_) => None,
            });
            if let Some(session) = session {
                for child in &mut composite.children {
                    let core = match child {
                        SessionContext::Local(ctx) => &mut ctx.core,
                        SessionContext::Network(ctx) => &mut ctx.core,
                        SessionContext::Composite(_) => continue,
                    };
                    if core.transfer_session.is_none() {
                        let _ = core.set_transfer_session(session.clone());
                    }
                }
            }

            let child = &mut composite.children[index];
            child.update_state(Some(entry.stage), Some(TransferStatus::Pending));
            match run_operations(entry, child).await {
                Ok(OpOutcome::Handled(status)) => {
                    if child.stage() == entry.stage {
                        child.update_state(None, Some(status));
                    }
                    if status != TransferStatus::Completed {
                        composite.cursor = index;
                        return status;
                    }
                }
                Ok(OpOutcome::Unhandled) => {
                    // this side has no work for the stage
                    child.update_state(None, Some(TransferStatus::Completed));
                }
                Err(err) => {
                    error!(stage = %entry.stage, %err, "operation failed");
                    child.set_error(err.to_string());
                    child.update_state(None, Some(TransferStatus::Errored));
                    composite.cursor = index;
                    return TransferStatus::Errored;
                }
            }
            index += 1;
        }

        composite.cursor = 0;
        TransferStatus::Completed
    }
}
