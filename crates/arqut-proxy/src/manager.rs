//! The service manager: reconciles (catalog × interfaces) into a running
//! listener fleet and mirrors every catalog mutation to the cloud.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use arqut_proto::{Protocol, ServiceRecord, SyncOperation};
use arqut_store::entities::service;
use arqut_store::{NewService, ServiceCatalog, ServicePatch};
use arqut_sync::SyncCoordinator;

use crate::error::ProxyError;
use crate::listener::{spawn_listener, ListenerHandle, ListenerSpec};
use crate::ping::{self, PingServer, PING_PORT};
use crate::ports::PortAllocator;

/// Upper bound for stopping the whole fleet.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Name given to the bootstrap row that exposes the edge's own UI.
const EDGE_UI_SERVICE_NAME: &str = "Edge UI";

struct RunState {
    started: bool,
    cancel: Option<CancellationToken>,
}

/// Owns the listener fleet. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: ServiceCatalog,
    allocator: PortAllocator,
    /// Port of the edge agent's own HTTP API, proxied by the bootstrap row.
    ui_port: u16,

    /// Serializes every mutation so listener reconciliation observes
    /// either the pre- or post-state of an operation, never a split.
    mutation_lock: Mutex<()>,

    /// Interface name to bound IP.
    interfaces: RwLock<HashMap<String, String>>,
    /// Live listeners keyed by `{service_id}-{ip}:{port}`.
    listeners: DashMap<String, ListenerHandle>,

    state: RwLock<RunState>,
    ping: Mutex<Option<PingServer>>,
    sync: StdRwLock<Option<SyncCoordinator>>,
}

impl ServiceManager {
    pub fn new(catalog: ServiceCatalog, allocator: PortAllocator, ui_port: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                allocator,
                ui_port,
                mutation_lock: Mutex::new(()),
                interfaces: RwLock::new(HashMap::new()),
                listeners: DashMap::new(),
                state: RwLock::new(RunState {
                    started: false,
                    cancel: None,
                }),
                ping: Mutex::new(None),
                sync: StdRwLock::new(None),
            }),
        }
    }

    /// Wire the sync coordinator. Optional: without it the manager runs
    /// cloud-less and mutations stay local.
    pub fn set_sync(&self, sync: SyncCoordinator) {
        *self.inner.sync.write().expect("sync lock poisoned") = Some(sync);
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.read().await.started
    }

    /// Move to `running`: start the ping endpoint and one listener per
    /// (enabled service × registered interface).
    pub async fn start(&self) -> Result<(), ProxyError> {
        let cancel = {
            let mut state = self.inner.state.write().await;
            if state.started {
                return Err(ProxyError::AlreadyStarted);
            }
            let cancel = CancellationToken::new();
            state.started = true;
            state.cancel = Some(cancel.clone());
            cancel
        };

        // First run on an empty catalog publishes the edge's own UI.
        self.bootstrap_edge_ui().await;

        match ping::start(PING_PORT, &cancel).await {
            Ok(server) => *self.inner.ping.lock().await = Some(server),
            Err(err) => {
                warn!(port = PING_PORT, error = %err, "ping service failed to start, continuing without it");
            }
        }

        let services = match self.inner.catalog.list().await {
            Ok(services) => services,
            Err(err) => {
                // Catalog unavailable is fatal for start; revert state.
                let mut state = self.inner.state.write().await;
                state.started = false;
                if let Some(cancel) = state.cancel.take() {
                    cancel.cancel();
                }
                return Err(err.into());
            }
        };

        info!(count = services.len(), "starting service manager");
        for svc in services.iter().filter(|s| s.enabled) {
            self.start_service_listeners(svc).await;
        }
        Ok(())
    }

    /// Move to `idle`: stop the ping endpoint and every listener, bounded
    /// by [`SHUTDOWN_TIMEOUT`].
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.write().await;
            if !state.started {
                return;
            }
            state.started = false;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
        }

        if let Some(ping) = self.inner.ping.lock().await.take() {
            ping.stop().await;
        }

        let keys: Vec<String> = self.inner.listeners.iter().map(|e| e.key().clone()).collect();
        let mut set = JoinSet::new();
        for key in keys {
            if let Some((_, handle)) = self.inner.listeners.remove(&key) {
                set.spawn(async move { handle.stop().await });
            }
        }
        if timeout(SHUTDOWN_TIMEOUT, async {
            while set.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("service manager shutdown timed out");
            set.abort_all();
        }
        info!("service manager stopped");
    }

    /// Create a service: allocate a tunnel port, persist the row, start
    /// listeners when running, then queue the `created` sync.
    pub async fn add_service(
        &self,
        name: &str,
        local_host: &str,
        local_port: u16,
        protocol: Protocol,
    ) -> Result<service::Model, ProxyError> {
        let _guard = self.inner.mutation_lock.lock().await;
        let model = self
            .insert_service(name, local_host, local_port, protocol)
            .await?;

        if self.is_running().await {
            self.start_service_listeners(&model).await;
        }

        self.notify_sync(SyncOperation::Created, model.clone().into());
        Ok(model)
    }

    /// Partial update; the affected listeners are restarted so the fleet
    /// reflects the new row when this returns.
    pub async fn modify_service(
        &self,
        id: &str,
        patch: ServicePatch,
    ) -> Result<service::Model, ProxyError> {
        let operation = classify_patch(&patch);
        let _guard = self.inner.mutation_lock.lock().await;

        let model = self.inner.catalog.update(id, patch).await?;
        self.restart_service(&model).await;

        self.notify_sync(operation, model.clone().into());
        Ok(model)
    }

    pub async fn enable_service(&self, id: &str) -> Result<service::Model, ProxyError> {
        self.modify_service(id, ServicePatch::enabled(true)).await
    }

    pub async fn disable_service(&self, id: &str) -> Result<service::Model, ProxyError> {
        self.modify_service(id, ServicePatch::enabled(false)).await
    }

    pub async fn delete_service(&self, id: &str) -> Result<(), ProxyError> {
        let _guard = self.inner.mutation_lock.lock().await;

        let model = self.inner.catalog.get(id).await?;
        self.stop_service_listeners(id).await;
        self.inner.catalog.delete(id).await?;

        self.notify_sync(SyncOperation::Deleted, model.into());
        Ok(())
    }

    /// Stop everything, tell the cloud the rows are gone, empty the
    /// catalog.
    pub async fn clear(&self) -> Result<(), ProxyError> {
        let _guard = self.inner.mutation_lock.lock().await;

        let services = self.inner.catalog.list().await?;
        for svc in &services {
            self.stop_service_listeners(&svc.id).await;
        }

        if let Some(sync) = self.sync_handle() {
            sync.sync_removed(services.into_iter().map(Into::into).collect());
        }
        self.inner.catalog.clear().await?;
        Ok(())
    }

    pub async fn list_services(&self) -> Result<Vec<service::Model>, ProxyError> {
        Ok(self.inner.catalog.list().await?)
    }

    pub async fn get_service(&self, id: &str) -> Result<service::Model, ProxyError> {
        Ok(self.inner.catalog.get(id).await?)
    }

    /// Replace the interface registry; listeners are started/stopped from
    /// the diff of bound IPs.
    pub async fn set_interface_ips(&self, ips: HashMap<String, String>) {
        let _guard = self.inner.mutation_lock.lock().await;

        let old: HashMap<String, String> = {
            let mut interfaces = self.inner.interfaces.write().await;
            std::mem::replace(&mut *interfaces, ips.clone())
        };

        let old_ips: Vec<&String> = old.values().collect();
        let new_ips: Vec<&String> = ips.values().collect();

        for ip in old.values().filter(|ip| !new_ips.contains(ip)) {
            self.stop_listeners_on_ip(ip).await;
        }
        for ip in ips.values().filter(|ip| !old_ips.contains(ip)) {
            self.start_services_on_ip(ip).await;
        }
    }

    pub async fn add_interface(&self, name: &str, ip: &str) {
        let _guard = self.inner.mutation_lock.lock().await;

        let previous = {
            let mut interfaces = self.inner.interfaces.write().await;
            interfaces.insert(name.to_string(), ip.to_string())
        };
        if previous.as_deref() == Some(ip) {
            return;
        }
        if let Some(old_ip) = previous {
            self.stop_listeners_on_ip(&old_ip).await;
        }

        info!(interface = name, ip, "interface registered");
        self.start_services_on_ip(ip).await;
    }

    pub async fn remove_interface(&self, name: &str) {
        let _guard = self.inner.mutation_lock.lock().await;

        let removed = {
            let mut interfaces = self.inner.interfaces.write().await;
            interfaces.remove(name)
        };
        if let Some(ip) = removed {
            info!(interface = name, ip = %ip, "interface removed");
            self.stop_listeners_on_ip(&ip).await;
        }
    }

    pub async fn interface_ips(&self) -> HashMap<String, String> {
        self.inner.interfaces.read().await.clone()
    }

    /// (service id, bound address) of every live listener.
    pub fn running_listeners(&self) -> Vec<(String, SocketAddr)> {
        self.inner
            .listeners
            .iter()
            .map(|e| (e.value().service_id.clone(), e.value().bind_addr))
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    async fn insert_service(
        &self,
        name: &str,
        local_host: &str,
        local_port: u16,
        protocol: Protocol,
    ) -> Result<service::Model, ProxyError> {
        let used = self.inner.catalog.used_tunnel_ports().await?;
        let tunnel_port = self.inner.allocator.allocate(&used).await?;

        Ok(self
            .inner
            .catalog
            .add(NewService {
                name: name.to_string(),
                local_host: local_host.to_string(),
                local_port,
                tunnel_port,
                protocol,
            })
            .await?)
    }

    async fn bootstrap_edge_ui(&self) {
        match self.inner.catalog.count().await {
            Ok(0) => {}
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, "failed to check catalog for bootstrap");
                return;
            }
        }

        match self
            .insert_service(EDGE_UI_SERVICE_NAME, "localhost", self.inner.ui_port, Protocol::Http)
            .await
        {
            Ok(model) => {
                info!(id = %model.id, tunnel_port = model.tunnel_port, "bootstrapped Edge UI service");
                self.notify_sync(SyncOperation::Created, model.into());
            }
            Err(err) => warn!(error = %err, "failed to bootstrap Edge UI service"),
        }
    }

    async fn run_token(&self) -> Option<CancellationToken> {
        let state = self.inner.state.read().await;
        if state.started {
            state.cancel.clone()
        } else {
            None
        }
    }

    /// Start listeners for one service on every registered interface.
    /// Listener failures are logged; they never fail catalog operations.
    async fn start_service_listeners(&self, svc: &service::Model) {
        let Some(cancel) = self.run_token().await else {
            return;
        };
        let spec = spec_of(svc);
        let interfaces = self.inner.interfaces.read().await.clone();

        for ip in interfaces.values() {
            self.start_one(&spec, ip, &cancel).await;
        }
    }

    async fn start_one(&self, spec: &ListenerSpec, ip: &str, cancel: &CancellationToken) {
        let key = spec.key(ip);
        if self.inner.listeners.contains_key(&key) {
            return;
        }
        match spawn_listener(spec.clone(), ip, cancel).await {
            Ok(handle) => {
                self.inner.listeners.insert(key, handle);
            }
            Err(err) => {
                error!(service = %spec.name, ip, error = %err, "failed to start listener");
            }
        }
    }

    async fn stop_service_listeners(&self, id: &str) {
        let prefix = format!("{id}-");
        let keys: Vec<String> = self
            .inner
            .listeners
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, handle)) = self.inner.listeners.remove(&key) {
                handle.stop().await;
            }
        }
    }

    async fn stop_listeners_on_ip(&self, ip: &str) {
        let keys: Vec<String> = self
            .inner
            .listeners
            .iter()
            .filter(|e| e.value().bind_addr.ip().to_string() == ip)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, handle)) = self.inner.listeners.remove(&key) {
                handle.stop().await;
            }
        }
    }

    async fn start_services_on_ip(&self, ip: &str) {
        let Some(cancel) = self.run_token().await else {
            return;
        };
        let services = match self.inner.catalog.list().await {
            Ok(services) => services,
            Err(err) => {
                error!(ip, error = %err, "failed to load services for new interface");
                return;
            }
        };
        for svc in services.iter().filter(|s| s.enabled) {
            self.start_one(&spec_of(svc), ip, &cancel).await;
        }
    }

    async fn restart_service(&self, svc: &service::Model) {
        self.stop_service_listeners(&svc.id).await;
        if svc.enabled {
            self.start_service_listeners(svc).await;
        }
    }

    fn sync_handle(&self) -> Option<SyncCoordinator> {
        self.inner.sync.read().expect("sync lock poisoned").clone()
    }

    fn notify_sync(&self, operation: SyncOperation, record: ServiceRecord) {
        if let Some(sync) = self.sync_handle() {
            sync.service_changed(operation, record);
        }
    }
}

fn spec_of(svc: &service::Model) -> ListenerSpec {
    ListenerSpec {
        service_id: svc.id.clone(),
        name: svc.name.clone(),
        local_host: svc.local_host.clone(),
        local_port: svc.local_port as u16,
        tunnel_port: svc.tunnel_port as u16,
    }
}

/// An update that only toggles `enabled` syncs as enabled/disabled;
/// everything else syncs as a plain update.
fn classify_patch(patch: &ServicePatch) -> SyncOperation {
    let only_enabled =
        patch.name.is_none() && patch.local_host.is_none() && patch.local_port.is_none();
    match (only_enabled, patch.enabled) {
        (true, Some(true)) => SyncOperation::Enabled,
        (true, Some(false)) => SyncOperation::Disabled,
        _ => SyncOperation::Updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_classification() {
        assert_eq!(
            classify_patch(&ServicePatch::enabled(true)),
            SyncOperation::Enabled
        );
        assert_eq!(
            classify_patch(&ServicePatch::enabled(false)),
            SyncOperation::Disabled
        );
        assert_eq!(
            classify_patch(&ServicePatch {
                name: Some("x".into()),
                ..Default::default()
            }),
            SyncOperation::Updated
        );
        assert_eq!(
            classify_patch(&ServicePatch {
                local_port: Some(1),
                enabled: Some(true),
                ..Default::default()
            }),
            SyncOperation::Updated
        );
    }
}
