//! Sync coordinator: pushes service catalog state to the cloud.
//!
//! Every local catalog mutation is mirrored as a `service-sync` message
//! with a fresh message id, tracked in a callback table until the cloud
//! acknowledges it. The coordinator also registers an on-connect handler
//! on the signaling client so every (re)connection pushes one full
//! `service-sync-batch` snapshot; that resync is the recovery mechanism
//! for anything dropped while disconnected, so individual messages are
//! never retried.
//!
//! Sync is strictly best-effort: local state is authoritative and no sync
//! failure ever propagates back into the catalog operation that caused it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use arqut_proto::{
    msg_type, AckStatus, BatchOperation, ServiceRecord, ServiceSync, ServiceSyncAck,
    ServiceSyncBatch, SignalMessage, SyncOperation,
};
use arqut_signaling::{OutboundMessage, SignalingClient};
use arqut_store::{ids, ServiceCatalog};

/// A sync message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct SyncCallback {
    pub operation: String,
    pub subject: String,
    pub queued_at: DateTime<Utc>,
    /// Extension point; retries are intentionally not implemented.
    pub retries: u32,
}

/// Correlates catalog mutations with cloud acknowledgements. Cheap to
/// clone; all clones share the callback table.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: ServiceCatalog,
    client: SignalingClient,
    callbacks: Mutex<HashMap<String, SyncCallback>>,
}

impl SyncCoordinator {
    pub fn new(catalog: ServiceCatalog, client: SignalingClient) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                client,
                callbacks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install the ack handler and the full-resync on-connect handler on
    /// the signaling client.
    pub fn register(&self) {
        let ack_self = self.clone();
        self.inner
            .client
            .register_handler(msg_type::SERVICE_SYNC_ACK, move |msg| {
                let ack_self = ack_self.clone();
                async move {
                    ack_self.handle_ack(msg);
                    Ok(())
                }
            });

        let resync_self = self.clone();
        self.inner.client.add_on_connect(move || {
            let resync_self = resync_self.clone();
            async move {
                resync_self.sync_all().await;
                Ok(())
            }
        });
    }

    /// Queue a single-service operation. Called by the service manager
    /// after the local mutation succeeded; never fails the mutation.
    pub fn service_changed(&self, operation: SyncOperation, service: ServiceRecord) {
        let message_id = ids::short_id();
        let subject = service.id.clone();
        let payload = ServiceSync {
            message_id: message_id.clone(),
            operation,
            service,
        };
        self.inner.enqueue(
            msg_type::SERVICE_SYNC,
            &payload,
            message_id,
            SyncCallback {
                operation: operation.as_str().to_string(),
                subject,
                queued_at: Utc::now(),
                retries: 0,
            },
        );
    }

    /// Push a full catalog snapshot. Registered as the signaling
    /// on-connect handler; also usable for manual resync.
    pub async fn sync_all(&self) {
        let services = match self.inner.catalog.list().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "failed to read catalog for resync");
                return;
            }
        };
        if services.is_empty() {
            debug!("no services to sync");
            return;
        }

        let records: Vec<ServiceRecord> = services.into_iter().map(Into::into).collect();
        self.batch(BatchOperation::Sync, records);
    }

    /// Announce that the given services are being removed. Called before
    /// the catalog is emptied so the snapshot still reflects them.
    pub fn sync_removed(&self, services: Vec<ServiceRecord>) {
        if services.is_empty() {
            return;
        }
        self.batch(BatchOperation::Remove, services);
    }

    fn batch(&self, operation: BatchOperation, services: Vec<ServiceRecord>) {
        let message_id = ids::short_id();
        let count = services.len();
        let payload = ServiceSyncBatch {
            message_id: message_id.clone(),
            operation,
            services,
        };
        let op_name = match operation {
            BatchOperation::Sync => "batch-sync",
            BatchOperation::Remove => "batch-remove",
        };
        self.inner.enqueue(
            msg_type::SERVICE_SYNC_BATCH,
            &payload,
            message_id,
            SyncCallback {
                operation: op_name.to_string(),
                subject: format!("{count} services"),
                queued_at: Utc::now(),
                retries: 0,
            },
        );
    }

    /// Resolve an acknowledgement from the cloud.
    pub fn handle_ack(&self, msg: SignalMessage) {
        let ack: ServiceSyncAck = match msg.parse_data() {
            Ok(ack) => ack,
            Err(err) => {
                warn!(error = %err, "malformed service-sync-ack");
                return;
            }
        };

        let callback = self
            .inner
            .callbacks
            .lock()
            .expect("callback lock poisoned")
            .remove(&ack.message_id);

        match (ack.status, callback) {
            (AckStatus::Success, Some(cb)) => {
                info!(
                    operation = %cb.operation,
                    subject = %cb.subject,
                    message = ack.message.as_deref().unwrap_or(""),
                    "service sync acknowledged"
                );
            }
            (AckStatus::Success, None) => {
                debug!(message_id = %ack.message_id, "ack for unknown message id");
            }
            (AckStatus::Error, Some(cb)) => {
                warn!(
                    operation = %cb.operation,
                    subject = %cb.subject,
                    error = ack.error.as_deref().unwrap_or("unknown"),
                    "service sync rejected by cloud"
                );
            }
            (AckStatus::Error, None) => {
                warn!(
                    message_id = %ack.message_id,
                    error = ack.error.as_deref().unwrap_or("unknown"),
                    "sync error for unknown message id"
                );
            }
        }
    }

    /// Number of syncs still awaiting acknowledgement.
    pub fn pending(&self) -> usize {
        self.inner
            .callbacks
            .lock()
            .expect("callback lock poisoned")
            .len()
    }
}

impl Inner {
    /// Register the callback, then enqueue without blocking. When the
    /// outbound queue is full the callback is withdrawn and the sync is
    /// skipped; the next reconnect resync recovers the state.
    fn enqueue<T: serde::Serialize>(
        &self,
        kind: &str,
        payload: &T,
        message_id: String,
        callback: SyncCallback,
    ) {
        let msg = match OutboundMessage::new(kind, payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "failed to serialize sync payload");
                return;
            }
        };

        let op = callback.operation.clone();
        let subject = callback.subject.clone();
        self.callbacks
            .lock()
            .expect("callback lock poisoned")
            .insert(message_id.clone(), callback);

        match self.client.try_enqueue(msg) {
            Ok(()) => {
                debug!(operation = %op, subject = %subject, %message_id, "queued service sync");
            }
            Err(err) => {
                self.callbacks
                    .lock()
                    .expect("callback lock poisoned")
                    .remove(&message_id);
                warn!(
                    operation = %op,
                    subject = %subject,
                    error = %err,
                    "sync queue full, skipping (resync on reconnect will recover)"
                );
            }
        }
    }
}
