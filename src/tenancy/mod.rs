//! Cross-tenant communication.
//!
//! Projects (tenants) register a namespace, the event types they may
//! emit, and the targets they may talk to. `send_message` enforces, in
//! order: registration, target permission, event-type permission, rate
//! limit, contract validation. Every check fails closed: a rejected
//! message is never published. Admitted messages are wrapped in a signed
//! [`CrossTenantEnvelope`] and published on the target's namespaced
//! event type (`{namespace}.{event_type}`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{
    Broker, EventHandler, PublishOptions, SubscribeOptions, SubscriptionHandle,
};
use crate::config::TenancyConfig;
use crate::envelope::{EventEnvelope, Priority};
use crate::{BusError, Result};

pub mod contract;
pub mod rate_limit;
pub mod signing;

pub use contract::{ContractMetadata, ContractRegistry, EventContract};
pub use rate_limit::{RateLimitConfig, TokenBucket};
pub use signing::{CrossTenantEnvelope, SecurityBlock, SourceRef, TargetRef};

/// Administrative registration of a tenant.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRegistration {
    pub project_id: String,
    /// Uniquely scopes this project's event-type routing
    /// (`{namespace}.{event_type}`).
    pub namespace: String,
    pub allowed_event_types: Vec<String>,
    #[serde(default)]
    pub allowed_targets: Vec<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-project signing secret; the bus-level key is used when absent.
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl ProjectRegistration {
    fn validate(&self) -> Result<()> {
        if self.project_id.is_empty() {
            return Err(BusError::Validation("project id is required".into()));
        }
        if self.namespace.is_empty() {
            return Err(BusError::Validation(format!(
                "project '{}': namespace is required",
                self.project_id
            )));
        }
        if self.allowed_event_types.is_empty() {
            return Err(BusError::Validation(format!(
                "project '{}': at least one allowed event type is required",
                self.project_id
            )));
        }
        Ok(())
    }
}

/// Send-time options for cross-tenant messages.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: Option<Priority>,
    pub ttl_seconds: Option<u64>,
    pub correlation_id: Option<String>,
}

/// Receive-time options for cross-tenant handlers.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Consumer group; defaults to the project id.
    pub group: Option<String>,
    pub verify_signature: bool,
    pub verify_staleness: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            group: None,
            verify_signature: true,
            verify_staleness: true,
        }
    }
}

/// Tenant-scoped facade over the broker.
pub struct TenantBus {
    broker: Arc<Broker>,
    config: TenancyConfig,
    projects: RwLock<HashMap<String, ProjectRegistration>>,
    limiters: Mutex<HashMap<String, TokenBucket>>,
    contracts: RwLock<ContractRegistry>,
}

impl TenantBus {
    pub fn new(broker: Arc<Broker>, config: TenancyConfig) -> Arc<Self> {
        Arc::new(Self {
            broker,
            config,
            projects: RwLock::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            contracts: RwLock::new(ContractRegistry::new()),
        })
    }

    /// Register a tenant. Fails if the project id is already taken;
    /// use [`update_project`](Self::update_project) to change an
    /// existing registration.
    pub async fn register_project(&self, registration: ProjectRegistration) -> Result<()> {
        registration.validate()?;
        let mut projects = self.projects.write().await;
        if projects.contains_key(&registration.project_id) {
            return Err(BusError::Validation(format!(
                "project '{}' is already registered",
                registration.project_id
            )));
        }
        self.install_limiter(&registration).await;
        info!(
            project = %registration.project_id,
            namespace = %registration.namespace,
            "Project registered"
        );
        projects.insert(registration.project_id.clone(), registration);
        Ok(())
    }

    /// Replace an existing registration.
    pub async fn update_project(&self, registration: ProjectRegistration) -> Result<()> {
        registration.validate()?;
        let mut projects = self.projects.write().await;
        if !projects.contains_key(&registration.project_id) {
            return Err(BusError::Validation(format!(
                "project '{}' is not registered",
                registration.project_id
            )));
        }
        self.install_limiter(&registration).await;
        info!(project = %registration.project_id, "Project registration updated");
        projects.insert(registration.project_id.clone(), registration);
        Ok(())
    }

    async fn install_limiter(&self, registration: &ProjectRegistration) {
        let mut limiters = self.limiters.lock().await;
        match registration.rate_limit {
            Some(config) => {
                limiters.insert(registration.project_id.clone(), TokenBucket::new(config));
            }
            None => {
                limiters.remove(&registration.project_id);
            }
        }
    }

    /// Register (or replace) an event contract.
    pub async fn register_contract(&self, contract: EventContract) -> Result<()> {
        self.contracts.write().await.register(contract)
    }

    pub async fn contract_count(&self) -> usize {
        self.contracts.read().await.len()
    }

    async fn project(&self, project_id: &str) -> Result<ProjectRegistration> {
        self.projects
            .read()
            .await
            .get(project_id)
            .cloned()
            .ok_or_else(|| {
                BusError::Validation(format!("project '{}' is not registered", project_id))
            })
    }

    fn secret_for(&self, registration: &ProjectRegistration) -> String {
        registration
            .signing_secret
            .clone()
            .unwrap_or_else(|| self.config.signing_key.clone())
    }

    /// Send a cross-tenant message.
    ///
    /// Returns the published event id. Checks run in a fixed order and
    /// the first failure aborts the send with no publish.
    pub async fn send_message(
        &self,
        source_project_id: &str,
        target_project_id: &str,
        event_type: &str,
        data: Value,
        options: SendOptions,
    ) -> Result<Uuid> {
        let source = self.project(source_project_id).await?;
        let target = self.project(target_project_id).await?;

        if !source.allowed_targets.iter().any(|t| t == target_project_id) {
            return Err(BusError::Validation(format!(
                "project '{}' may not send to '{}'",
                source_project_id, target_project_id
            )));
        }
        if !source.allowed_event_types.iter().any(|t| t == event_type) {
            return Err(BusError::Validation(format!(
                "project '{}' may not emit '{}'",
                source_project_id, event_type
            )));
        }

        {
            let mut limiters = self.limiters.lock().await;
            if let Some(bucket) = limiters.get_mut(source_project_id) {
                if !bucket.allow() {
                    return Err(BusError::RateLimit(source_project_id.to_string()));
                }
            }
        }

        self.contracts.read().await.check(event_type, &data)?;

        let mut inner = EventEnvelope::new(event_type, source_project_id, data);
        inner.target = Some(target_project_id.to_string());
        inner.correlation_id = options.correlation_id.clone();
        if let Some(priority) = options.priority {
            inner.priority = priority;
        }
        inner.ttl_seconds = options.ttl_seconds;

        let sealed = CrossTenantEnvelope::sealed(
            SourceRef {
                project_id: source.project_id.clone(),
                namespace: source.namespace.clone(),
                version: source.version.clone(),
            },
            TargetRef {
                project_id: target.project_id.clone(),
                namespace: target.namespace.clone(),
            },
            inner,
            &self.secret_for(&source),
        )?;

        let namespaced = format!("{}.{}", target.namespace, event_type);
        self.broker
            .publish(
                &namespaced,
                serde_json::to_value(&sealed)?,
                PublishOptions {
                    source: Some(source_project_id.to_string()),
                    target: Some(target_project_id.to_string()),
                    correlation_id: options.correlation_id,
                    priority: options.priority,
                    ttl_seconds: options.ttl_seconds,
                    ..Default::default()
                },
            )
            .await
    }

    /// Subscribe `handler` to cross-tenant messages for `event_type`
    /// addressed to `project_id`.
    ///
    /// Inbound messages are checked for staleness and signature before
    /// the handler runs; rejects are logged as security events and
    /// dropped without retry. A handler error on a message carrying a
    /// correlation id sends a typed error response back to the
    /// originating project's namespace.
    pub async fn message_handler(
        self: &Arc<Self>,
        project_id: &str,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        options: HandlerOptions,
    ) -> Result<SubscriptionHandle> {
        let project = self.project(project_id).await?;
        let namespaced = format!("{}.{}", project.namespace, event_type);
        let group = options
            .group
            .clone()
            .unwrap_or_else(|| project_id.to_string());

        let inbound = Arc::new(InboundHandler {
            bus: Arc::clone(self),
            handler,
            options,
        });
        self.broker
            .subscribe(&namespaced, &group, inbound, SubscribeOptions::default())
            .await
    }

    async fn send_error_response(
        &self,
        sealed: &CrossTenantEnvelope,
        correlation_id: &str,
        error: &BusError,
    ) {
        let response_type = format!("{}.error.response", sealed.source.namespace);
        let payload = json!({
            "correlationId": correlation_id,
            "originalEventType": sealed.payload.event_type,
            "respondingProject": sealed.target.project_id,
            "error": error.to_string(),
        });
        let result = self
            .broker
            .publish(
                &response_type,
                payload,
                PublishOptions {
                    source: Some(sealed.target.project_id.clone()),
                    target: Some(sealed.source.project_id.clone()),
                    correlation_id: Some(correlation_id.to_string()),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = result {
            warn!(
                correlation_id = %correlation_id,
                error = %e,
                "Error response publish failed"
            );
        }
    }
}

/// Wrapper handler enforcing receive-time security checks.
struct InboundHandler {
    bus: Arc<TenantBus>,
    handler: Arc<dyn EventHandler>,
    options: HandlerOptions,
}

#[async_trait]
impl EventHandler for InboundHandler {
    async fn handle(&self, event: Arc<EventEnvelope>) -> Result<()> {
        let sealed: CrossTenantEnvelope = match serde_json::from_value(event.payload.clone()) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(id = %event.id, error = %e, "Inbound message is not a cross-tenant envelope");
                return Ok(());
            }
        };

        if self.options.verify_staleness
            && sealed.is_stale(chrono::Utc::now(), self.bus.config.staleness_window_secs)
        {
            warn!(
                id = %sealed.payload.id,
                source = %sealed.source.project_id,
                "Rejected stale cross-tenant message"
            );
            return Ok(());
        }

        if self.options.verify_signature {
            let secret = match self.bus.project(&sealed.source.project_id).await {
                Ok(source) => self.bus.secret_for(&source),
                // Unknown senders verify against the bus key.
                Err(_) => self.bus.config.signing_key.clone(),
            };
            if let Err(e) = sealed.verify(&secret) {
                warn!(
                    id = %sealed.payload.id,
                    source = %sealed.source.project_id,
                    error = %e,
                    "Rejected cross-tenant message with bad signature"
                );
                return Ok(());
            }
        }

        let inner = Arc::new(sealed.payload.clone());
        if let Err(e) = self.handler.handle(inner).await {
            if let Some(correlation_id) = sealed.payload.correlation_id.as_deref() {
                self.bus.send_error_response(&sealed, correlation_id, &e).await;
            }
            return Err(e);
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStreamStore;

    fn test_bus() -> Arc<TenantBus> {
        let config = Config::for_test();
        let broker = Arc::new(Broker::new(
            Arc::new(MemoryStreamStore::new()),
            config.clone(),
        ));
        TenantBus::new(broker, config.tenancy)
    }

    fn billing() -> ProjectRegistration {
        ProjectRegistration {
            project_id: "billing".into(),
            namespace: "billing".into(),
            allowed_event_types: vec!["invoice.created".into()],
            allowed_targets: vec!["notify".into()],
            rate_limit: None,
            signing_secret: None,
            version: "1.0.0".into(),
        }
    }

    fn notify() -> ProjectRegistration {
        ProjectRegistration {
            project_id: "notify".into(),
            namespace: "notify".into(),
            allowed_event_types: vec!["notification.sent".into()],
            allowed_targets: vec![],
            rate_limit: None,
            signing_secret: None,
            version: "1.0.0".into(),
        }
    }

    #[tokio::test]
    async fn test_registration_requires_event_types() {
        let bus = test_bus();
        let mut registration = billing();
        registration.allowed_event_types.clear();
        assert!(bus.register_project(registration).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let bus = test_bus();
        bus.register_project(billing()).await.unwrap();
        assert!(bus.register_project(billing()).await.is_err());
        bus.update_project(billing()).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_requires_both_projects() {
        let bus = test_bus();
        bus.register_project(billing()).await.unwrap();
        let err = bus
            .send_message(
                "billing",
                "notify",
                "invoice.created",
                json!({}),
                SendOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Validation(_)));
    }

    #[tokio::test]
    async fn test_send_enforces_target_allowlist() {
        let bus = test_bus();
        bus.register_project(billing()).await.unwrap();
        bus.register_project(notify()).await.unwrap();
        // notify has no allowed targets at all.
        let err = bus
            .send_message(
                "notify",
                "billing",
                "notification.sent",
                json!({}),
                SendOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Validation(_)));
    }

    #[tokio::test]
    async fn test_send_enforces_event_type_allowlist() {
        let bus = test_bus();
        bus.register_project(billing()).await.unwrap();
        bus.register_project(notify()).await.unwrap();
        let err = bus
            .send_message(
                "billing",
                "notify",
                "invoice.deleted",
                json!({}),
                SendOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Validation(_)));
    }

    #[tokio::test]
    async fn test_send_enforces_rate_limit() {
        let bus = test_bus();
        let mut registration = billing();
        registration.rate_limit = Some(RateLimitConfig {
            events_per_second: 1.0,
            burst_limit: 2,
        });
        bus.register_project(registration).await.unwrap();
        bus.register_project(notify()).await.unwrap();

        for _ in 0..2 {
            bus.send_message(
                "billing",
                "notify",
                "invoice.created",
                json!({"invoiceId": "INV-1", "amount": 42}),
                SendOptions::default(),
            )
            .await
            .unwrap();
        }
        let err = bus
            .send_message(
                "billing",
                "notify",
                "invoice.created",
                json!({"invoiceId": "INV-1", "amount": 42}),
                SendOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RateLimit(_)));
    }

    #[tokio::test]
    async fn test_send_enforces_contract() {
        let bus = test_bus();
        bus.register_project(billing()).await.unwrap();
        bus.register_project(notify()).await.unwrap();
        bus.register_contract(EventContract {
            name: "billing-invoice".into(),
            version: "1.0.0".into(),
            source_project: "billing".into(),
            target_projects: vec!["notify".into()],
            event_types: vec!["invoice.created".into()],
            schema: json!({
                "type": "object",
                "properties": {
                    "invoiceId": { "type": "string" },
                    "amount": { "type": "number" }
                },
                "required": ["invoiceId", "amount"]
            }),
            metadata: ContractMetadata::default(),
        })
        .await
        .unwrap();

        bus.send_message(
            "billing",
            "notify",
            "invoice.created",
            json!({"invoiceId": "INV-1", "amount": 42}),
            SendOptions::default(),
        )
        .await
        .unwrap();

        let err = bus
            .send_message(
                "billing",
                "notify",
                "invoice.created",
                json!({"invoiceId": "INV-1", "amount": "bad"}),
                SendOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Validation(_)));
    }
}
