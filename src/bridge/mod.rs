//! Service-registry bridge.
//!
//! Connects externally registered services to the bus without any direct
//! coupling between them: the bridge observes registry announcements as
//! ordinary bus events, maps each advertised capability to a canonical
//! event type through a fixed lookup table, and installs a forwarding
//! subscription that POSTs matching events to the service's inbound
//! events endpoint. Forwarding failures count against the service's
//! recorded health; they are never surfaced as broker failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::broker::{Broker, EventHandler, PublishOptions, SubscribeOptions, SubscriptionHandle};
use crate::config::BridgeConfig;
use crate::envelope::EventEnvelope;
use crate::tenancy::{EventContract, TenantBus};
use crate::Result;

/// Bus event types the bridge observes.
pub const SERVICE_REGISTERED_EVENT: &str = "registry.service.registered";
pub const SERVICE_HEALTH_EVENT: &str = "registry.service.health";
pub const AGENT_FAILURE_EVENT: &str = "agent.failure";
/// Bus event type announced when the routing table changes.
pub const CONFIG_CHANGED_EVENT: &str = "system.config.changed";

/// Fixed capability-name to canonical event-type table.
const CAPABILITY_EVENT_TYPES: &[(&str, &str)] = &[
    ("task-execution", "task.execution.requested"),
    ("code-generation", "generation.code.requested"),
    ("document-processing", "document.process.requested"),
    ("data-transformation", "data.transform.requested"),
    ("notification-delivery", "notification.send.requested"),
    ("workflow-orchestration", "workflow.run.requested"),
];

/// Canonical event type for a service capability, if one is defined.
pub fn capability_event_type(capability: &str) -> Option<&'static str> {
    CAPABILITY_EVENT_TYPES
        .iter()
        .find(|(name, _)| *name == capability)
        .map(|(_, event_type)| *event_type)
}

/// Recorded health of a bridged service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ServiceHealth {
    fn downgraded(self) -> Self {
        match self {
            ServiceHealth::Healthy => ServiceHealth::Degraded,
            _ => ServiceHealth::Unhealthy,
        }
    }
}

/// A registry announcement, as carried on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAnnouncement {
    pub service_id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Inbound events endpoint; forwarded events are POSTed here.
    pub events_endpoint: String,
    /// Optional discoverable contracts endpoint.
    #[serde(default)]
    pub contracts_endpoint: Option<String>,
}

/// Bridge-side ledger entry for one service.
#[derive(Debug, Clone)]
struct ServiceRecord {
    announcement: ServiceAnnouncement,
    health: ServiceHealth,
    forward_failures: u32,
    routed_event_types: HashSet<String>,
}

/// Maps registry capability metadata to event subscriptions and forwards
/// matching events to service endpoints.
pub struct RegistryBridge {
    broker: Arc<Broker>,
    tenants: Arc<TenantBus>,
    config: BridgeConfig,
    http: reqwest::Client,
    services: RwLock<HashMap<String, ServiceRecord>>,
    handles: Mutex<Vec<SubscriptionHandle>>,
    rescan_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl RegistryBridge {
    pub fn new(broker: Arc<Broker>, tenants: Arc<TenantBus>, config: BridgeConfig) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.forward_timeout_secs))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            broker,
            tenants,
            config,
            http,
            services: RwLock::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            rescan_task: Mutex::new(None),
            stop_tx,
        })
    }

    /// Subscribe to registry events and start the periodic rescan loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Ok(());
        }

        let registered = Arc::new(RegistryEventHandler {
            bridge: Arc::downgrade(self),
            kind: RegistryEventKind::Registered,
        });
        let health = Arc::new(RegistryEventHandler {
            bridge: Arc::downgrade(self),
            kind: RegistryEventKind::Health,
        });
        let failure = Arc::new(RegistryEventHandler {
            bridge: Arc::downgrade(self),
            kind: RegistryEventKind::AgentFailure,
        });

        handles.push(
            self.broker
                .subscribe(
                    SERVICE_REGISTERED_EVENT,
                    "registry-bridge",
                    registered,
                    SubscribeOptions::default(),
                )
                .await?,
        );
        handles.push(
            self.broker
                .subscribe(
                    SERVICE_HEALTH_EVENT,
                    "registry-bridge",
                    health,
                    SubscribeOptions::default(),
                )
                .await?,
        );
        handles.push(
            self.broker
                .subscribe(
                    AGENT_FAILURE_EVENT,
                    "registry-bridge",
                    failure,
                    SubscribeOptions::default(),
                )
                .await?,
        );

        let bridge = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.rescan_interval_secs.max(1));
        let mut stop_rx = self.stop_tx.subscribe();
        *self.rescan_task.lock().await = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        let Some(bridge) = bridge.upgrade() else { break };
                        bridge.rescan().await;
                    }
                }
            }
        }));

        info!("Registry bridge started");
        Ok(())
    }

    /// Stop observing registry events and the rescan loop. Forwarding
    /// subscriptions for already-bridged services stay installed.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.rescan_task.lock().await.take() {
            let _ = task.await;
        }
        for handle in self.handles.lock().await.drain(..) {
            self.broker.unsubscribe(&handle).await?;
        }
        info!("Registry bridge stopped");
        Ok(())
    }

    /// Recorded health for `service_id`.
    pub async fn service_health(&self, service_id: &str) -> Option<ServiceHealth> {
        self.services.read().await.get(service_id).map(|s| s.health)
    }

    pub async fn service_count(&self) -> usize {
        self.services.read().await.len()
    }

    async fn on_service_registered(self: &Arc<Self>, announcement: ServiceAnnouncement) {
        info!(
            service = %announcement.service_id,
            name = %announcement.name,
            capabilities = announcement.capabilities.len(),
            "Service registered"
        );
        {
            let mut services = self.services.write().await;
            let record = services
                .entry(announcement.service_id.clone())
                .or_insert_with(|| ServiceRecord {
                    announcement: announcement.clone(),
                    health: ServiceHealth::Healthy,
                    forward_failures: 0,
                    routed_event_types: HashSet::new(),
                });
            record.announcement = announcement.clone();
            record.health = ServiceHealth::Healthy;
        }

        let changed = self
            .broker
            .publish(
                CONFIG_CHANGED_EVENT,
                json!({
                    "change": "service_registered",
                    "serviceId": announcement.service_id,
                    "name": announcement.name,
                }),
                PublishOptions {
                    source: Some("registry-bridge".to_string()),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = changed {
            warn!(error = %e, "Configuration-changed announcement failed");
        }
        self.broker.notify_config_changed(format!(
            "service '{}' registered",
            announcement.service_id
        ));

        if let Some(url) = announcement.contracts_endpoint.clone() {
            self.discover_contracts(&announcement.service_id, &url).await;
        }
        self.install_routes(&announcement.service_id).await;
    }

    /// Fetch the service's advertised contracts and register each one
    /// tagged as `discovered`.
    async fn discover_contracts(&self, service_id: &str, url: &str) {
        let contracts: Vec<EventContract> = match self.http.get(url).send().await {
            Ok(response) => match response.json().await {
                Ok(contracts) => contracts,
                Err(e) => {
                    warn!(service = %service_id, error = %e, "Undecodable contracts endpoint");
                    return;
                }
            },
            Err(e) => {
                warn!(service = %service_id, url = %url, error = %e, "Contracts fetch failed");
                return;
            }
        };
        for mut contract in contracts {
            if !contract.metadata.tags.iter().any(|t| t == "discovered") {
                contract.metadata.tags.push("discovered".to_string());
            }
            let name = contract.name.clone();
            if let Err(e) = self.tenants.register_contract(contract).await {
                warn!(service = %service_id, contract = %name, error = %e, "Discovered contract rejected");
            }
        }
    }

    /// Subscribe forwarding handlers for any capability not yet routed.
    async fn install_routes(self: &Arc<Self>, service_id: &str) {
        let (announcement, pending): (ServiceAnnouncement, Vec<&'static str>) = {
            let services = self.services.read().await;
            let Some(record) = services.get(service_id) else {
                return;
            };
            let pending = record
                .announcement
                .capabilities
                .iter()
                .filter_map(|c| capability_event_type(c.as_str()))
                .filter(|t| !record.routed_event_types.contains(*t))
                .collect();
            (record.announcement.clone(), pending)
        };

        for event_type in pending {
            let handler = Arc::new(ForwardingHandler {
                bridge: Arc::downgrade(self),
                service_id: service_id.to_string(),
                events_endpoint: announcement.events_endpoint.clone(),
                http: self.http.clone(),
            });
            let group = format!("bridge-{}", service_id);
            match self
                .broker
                .subscribe(event_type, &group, handler, SubscribeOptions::default())
                .await
            {
                Ok(_) => {
                    debug!(service = %service_id, event_type, "Forwarding route installed");
                    let mut services = self.services.write().await;
                    if let Some(record) = services.get_mut(service_id) {
                        record.routed_event_types.insert(event_type.to_string());
                    }
                }
                Err(e) => {
                    warn!(service = %service_id, event_type, error = %e, "Route install failed");
                }
            }
        }
    }

    /// Re-install routing for every currently healthy service.
    async fn rescan(self: &Arc<Self>) {
        let healthy: Vec<String> = self
            .services
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.health == ServiceHealth::Healthy)
            .map(|(id, _)| id.clone())
            .collect();
        for service_id in healthy {
            self.install_routes(&service_id).await;
        }
    }

    async fn on_health_event(&self, service_id: &str, status: ServiceHealth) {
        let mut services = self.services.write().await;
        if let Some(record) = services.get_mut(service_id) {
            if record.health != status {
                info!(service = %service_id, from = ?record.health, to = ?status, "Service health changed");
            }
            record.health = status;
            if status == ServiceHealth::Healthy {
                record.forward_failures = 0;
            }
        }
    }

    async fn on_agent_failure(&self, service_id: &str) {
        let mut services = self.services.write().await;
        if let Some(record) = services.get_mut(service_id) {
            let downgraded = record.health.downgraded();
            warn!(service = %service_id, to = ?downgraded, "Service downgraded after agent failure");
            record.health = downgraded;
        }
    }

    /// Count one forwarding failure against the service; enough failures
    /// downgrade its recorded health.
    async fn record_forward_failure(&self, service_id: &str) {
        let mut services = self.services.write().await;
        if let Some(record) = services.get_mut(service_id) {
            record.forward_failures += 1;
            if record.forward_failures >= self.config.failure_threshold
                && record.health == ServiceHealth::Healthy
            {
                warn!(
                    service = %service_id,
                    failures = record.forward_failures,
                    "Service degraded after repeated forwarding failures"
                );
                record.health = ServiceHealth::Degraded;
            }
        }
    }

    async fn record_forward_success(&self, service_id: &str) {
        let mut services = self.services.write().await;
        if let Some(record) = services.get_mut(service_id) {
            record.forward_failures = 0;
        }
    }
}

enum RegistryEventKind {
    Registered,
    Health,
    AgentFailure,
}

/// Handler for the registry's own bus events.
struct RegistryEventHandler {
    bridge: Weak<RegistryBridge>,
    kind: RegistryEventKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthPayload {
    service_id: String,
    status: ServiceHealth,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailurePayload {
    #[serde(alias = "agentId")]
    service_id: String,
}

#[async_trait]
impl EventHandler for RegistryEventHandler {
    async fn handle(&self, event: Arc<EventEnvelope>) -> Result<()> {
        let Some(bridge) = self.bridge.upgrade() else {
            return Ok(());
        };
        match self.kind {
            RegistryEventKind::Registered => {
                match serde_json::from_value::<ServiceAnnouncement>(event.payload.clone()) {
                    Ok(announcement) => bridge.on_service_registered(announcement).await,
                    Err(e) => {
                        warn!(id = %event.id, error = %e, "Undecodable service announcement")
                    }
                }
            }
            RegistryEventKind::Health => {
                match serde_json::from_value::<HealthPayload>(event.payload.clone()) {
                    Ok(payload) => {
                        bridge
                            .on_health_event(&payload.service_id, payload.status)
                            .await
                    }
                    Err(e) => warn!(id = %event.id, error = %e, "Undecodable health event"),
                }
            }
            RegistryEventKind::AgentFailure => {
                match serde_json::from_value::<FailurePayload>(event.payload.clone()) {
                    Ok(payload) => bridge.on_agent_failure(&payload.service_id).await,
                    Err(e) => warn!(id = %event.id, error = %e, "Undecodable failure event"),
                }
            }
        }
        Ok(())
    }
}

/// Forwards matching events to a service's inbound events endpoint.
struct ForwardingHandler {
    bridge: Weak<RegistryBridge>,
    service_id: String,
    events_endpoint: String,
    http: reqwest::Client,
}

#[async_trait]
impl EventHandler for ForwardingHandler {
    async fn handle(&self, event: Arc<EventEnvelope>) -> Result<()> {
        let result = self
            .http
            .post(&self.events_endpoint)
            .json(&*event)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let Some(bridge) = self.bridge.upgrade() else {
            return Ok(());
        };
        match result {
            Ok(_) => bridge.record_forward_success(&self.service_id).await,
            Err(e) => {
                warn!(
                    service = %self.service_id,
                    id = %event.id,
                    error = %e,
                    "Event forwarding failed"
                );
                bridge.record_forward_failure(&self.service_id).await;
            }
        }
        // Forwarding failures count toward service health, never toward
        // the broker's retry machinery.
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
