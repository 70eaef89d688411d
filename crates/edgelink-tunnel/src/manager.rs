//! Tunnel registry and reconciler.
//!
//! The manager periodically fetches the tunnels this agent should keep open
//! and converges the running set: missing tunnels are dialed, tunnels whose
//! endpoints changed are recreated, tunnels no longer reported are torn down.
//! Every registry mutation, including runner self-removal and the shutdown
//! sweep, goes through the one registry mutex.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::discovery::{DiscoveryBackend, DiscoveryError, TunnelEndpoint};
use crate::listener::ListenerHandle;
use crate::runner::TunnelRunner;

/// How often the desired tunnel set is re-fetched.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Settings for the tunnel manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Bearer token presented to the broker on every dial.
    pub token: String,
    /// Host half of the local gateway address; the port half comes from each
    /// endpoint's `cluster_endpoint`.
    pub gateway_host: String,
    /// Reconcile period. [`RECONCILE_INTERVAL`] unless overridden (tests).
    pub reconcile_interval: Duration,
}

impl ManagerConfig {
    pub fn new(token: impl Into<String>, gateway_host: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            gateway_host: gateway_host.into(),
            reconcile_interval: RECONCILE_INTERVAL,
        }
    }
}

/// One live tunnel, owned exclusively by the registry.
///
/// Records are compared by `Arc` identity: a runner may only remove the
/// record it was spawned with, so a replacement installed under the same id
/// by a concurrent reconcile survives the old runner's exit.
pub(crate) struct TunnelRecord {
    pub(crate) broker_endpoint: String,
    pub(crate) cluster_endpoint: String,
    /// Present once the runner has the mux session up; [`None`] while dialing.
    pub(crate) listener: Mutex<Option<ListenerHandle>>,
}

impl TunnelRecord {
    fn new(endpoint: &TunnelEndpoint) -> Arc<Self> {
        Arc::new(Self {
            broker_endpoint: endpoint.broker_endpoint.clone(),
            cluster_endpoint: endpoint.cluster_endpoint.clone(),
            listener: Mutex::new(None),
        })
    }

    fn matches(&self, endpoint: &TunnelEndpoint) -> bool {
        self.broker_endpoint == endpoint.broker_endpoint
            && self.cluster_endpoint == endpoint.cluster_endpoint
    }

    async fn close(&self) {
        let handle = self.listener.lock().await.clone();
        if let Some(mut handle) = handle {
            handle.close().await;
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, Arc<TunnelRecord>>>>;

/// Converges the set of running tunnels with what discovery reports.
pub struct TunnelManager<B> {
    backend: B,
    config: ManagerConfig,
    tunnels: Registry,
}

impl<B: DiscoveryBackend> TunnelManager<B> {
    pub fn new(backend: B, config: ManagerConfig) -> Self {
        Self {
            backend,
            config,
            tunnels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs the manager: one reconcile immediately, then one per interval,
    /// until `shutdown` fires. Every tunnel is torn down before returning.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        error!(error = %err, "unable to update tunnels");
                    }
                }
                _ = shutdown.recv() => {
                    self.stop().await;
                    return;
                }
            }
        }
    }

    /// Ids of the tunnels currently present in the registry.
    pub async fn tunnel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tunnels.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn stop(&self) {
        let mut tunnels = self.tunnels.lock().await;
        for (id, record) in tunnels.drain() {
            debug!(tunnel_id = %id, "closing tunnel");
            record.close().await;
        }
    }

    async fn reconcile(&self) -> Result<(), DiscoveryError> {
        let mut tunnels = self.tunnels.lock().await;

        let endpoints = self.backend.list_tunnel_endpoints().await?;

        let desired: HashSet<&str> = endpoints
            .iter()
            .map(|endpoint| endpoint.tunnel_id.as_str())
            .collect();

        for endpoint in &endpoints {
            let existing = tunnels.get(&endpoint.tunnel_id).cloned();
            match existing {
                None => self.launch_tunnel(&mut tunnels, endpoint),
                Some(record) => {
                    if record.matches(endpoint) {
                        continue;
                    }

                    debug!(
                        tunnel_id = %endpoint.tunnel_id,
                        broker_endpoint = %endpoint.broker_endpoint,
                        cluster_endpoint = %endpoint.cluster_endpoint,
                        "tunnel endpoints changed, recreating"
                    );
                    record.close().await;
                    tunnels.remove(&endpoint.tunnel_id);
                    self.launch_tunnel(&mut tunnels, endpoint);
                }
            }
        }

        let stale: Vec<String> = tunnels
            .keys()
            .filter(|id| !desired.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(record) = tunnels.remove(&id) {
                debug!(tunnel_id = %id, "tunnel no longer desired, closing");
                record.close().await;
            }
        }

        Ok(())
    }

    /// Inserts a fresh record and spawns its runner. Caller holds the
    /// registry lock.
    fn launch_tunnel(
        &self,
        tunnels: &mut HashMap<String, Arc<TunnelRecord>>,
        endpoint: &TunnelEndpoint,
    ) {
        debug!(
            tunnel_id = %endpoint.tunnel_id,
            broker_endpoint = %endpoint.broker_endpoint,
            cluster_endpoint = %endpoint.cluster_endpoint,
            "launching tunnel"
        );

        let record = TunnelRecord::new(endpoint);
        tunnels.insert(endpoint.tunnel_id.clone(), record.clone());

        let runner = TunnelRunner {
            tunnel_id: endpoint.tunnel_id.clone(),
            broker_endpoint: endpoint.broker_endpoint.clone(),
            cluster_endpoint: endpoint.cluster_endpoint.clone(),
            token: self.config.token.clone(),
            gateway_host: self.config.gateway_host.clone(),
        };
        let registry = self.tunnels.clone();

        tokio::spawn(async move {
            if let Err(err) = runner.run(&record).await {
                error!(tunnel_id = %runner.tunnel_id, error = %err, "tunnel failed");
            }

            // Remove only the entry this runner created; a reconcile may have
            // replaced it under the same id in the meantime.
            let mut tunnels = registry.lock().await;
            if let Some(current) = tunnels.get(&runner.tunnel_id) {
                if Arc::ptr_eq(current, &record) {
                    tunnels.remove(&runner.tunnel_id);
                }
            }
        });
    }
}
