//! Event contracts.
//!
//! A contract binds a JSON Schema to the producer/consumer project pairs
//! and event types it governs. Schemas are compiled once at registration
//! into reusable validators; registering a contract under an existing
//! name replaces the compiled validator (last-write-wins).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{BusError, Result};

/// Descriptive contract metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractMetadata {
    pub description: String,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

/// Schema + routing rule constraining which payloads may flow between
/// which tenants for which event types. Versioned; multiple versions may
/// coexist under distinct names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContract {
    pub name: String,
    pub version: String,
    pub source_project: String,
    pub target_projects: Vec<String>,
    pub event_types: Vec<String>,
    pub schema: Value,
    #[serde(default)]
    pub metadata: ContractMetadata,
}

impl EventContract {
    /// Required-field validation: a contract must name a source, at least
    /// one target project, and at least one event type.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BusError::Validation("contract name is required".into()));
        }
        if self.source_project.is_empty() {
            return Err(BusError::Validation(format!(
                "contract '{}': source project is required",
                self.name
            )));
        }
        if self.target_projects.is_empty() {
            return Err(BusError::Validation(format!(
                "contract '{}': at least one target project is required",
                self.name
            )));
        }
        if self.event_types.is_empty() {
            return Err(BusError::Validation(format!(
                "contract '{}': at least one event type is required",
                self.name
            )));
        }
        Ok(())
    }
}

struct CompiledContract {
    contract: EventContract,
    validator: Validator,
}

/// Contract table with pre-compiled schema validators, keyed by contract
/// name.
#[derive(Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, CompiledContract>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, compile, and store a contract. Replaces any existing
    /// contract with the same name.
    pub fn register(&mut self, contract: EventContract) -> Result<()> {
        contract.validate()?;
        let validator = jsonschema::validator_for(&contract.schema).map_err(|e| {
            BusError::Validation(format!("contract '{}': invalid schema: {}", contract.name, e))
        })?;
        debug!(
            contract = %contract.name,
            version = %contract.version,
            "Contract registered"
        );
        self.contracts.insert(
            contract.name.clone(),
            CompiledContract {
                contract,
                validator,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&EventContract> {
        self.contracts.get(name).map(|c| &c.contract)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Check `data` against every contract covering `event_type`.
    ///
    /// Passes when no contract covers the event type; otherwise the data
    /// must satisfy at least one covering contract's schema.
    pub fn check(&self, event_type: &str, data: &Value) -> Result<()> {
        let covering: Vec<&CompiledContract> = self
            .contracts
            .values()
            .filter(|c| c.contract.event_types.iter().any(|t| t == event_type))
            .collect();
        if covering.is_empty() {
            return Ok(());
        }

        let mut errors = Vec::new();
        for compiled in &covering {
            match compiled.validator.validate(data) {
                Ok(()) => return Ok(()),
                Err(e) => errors.push(format!("{}: {}", compiled.contract.name, e)),
            }
        }
        Err(BusError::Validation(format!(
            "payload for '{}' matches no contract ({})",
            event_type,
            errors.join("; ")
        )))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoice_contract() -> EventContract {
        EventContract {
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
        }
    }

    #[test]
    fn test_register_requires_targets_and_event_types() {
        let mut registry = ContractRegistry::new();
        let mut contract = invoice_contract();
        contract.target_projects.clear();
        assert!(matches!(
            registry.register(contract),
            Err(BusError::Validation(_))
        ));

        let mut contract = invoice_contract();
        contract.event_types.clear();
        assert!(registry.register(contract).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_check_matching_payload() {
        let mut registry = ContractRegistry::new();
        registry.register(invoice_contract()).unwrap();
        registry
            .check("invoice.created", &json!({"invoiceId": "INV-1", "amount": 42}))
            .unwrap();
    }

    #[test]
    fn test_check_rejects_mismatch() {
        let mut registry = ContractRegistry::new();
        registry.register(invoice_contract()).unwrap();
        let err = registry
            .check("invoice.created", &json!({"invoiceId": "INV-1", "amount": "bad"}))
            .unwrap_err();
        assert!(matches!(err, BusError::Validation(_)));
    }

    #[test]
    fn test_uncovered_event_type_passes() {
        let mut registry = ContractRegistry::new();
        registry.register(invoice_contract()).unwrap();
        registry.check("user.signup", &json!({"anything": true})).unwrap();
    }

    #[test]
    fn test_last_write_wins() {
        let mut registry = ContractRegistry::new();
        registry.register(invoice_contract()).unwrap();

        let mut relaxed = invoice_contract();
        relaxed.version = "2.0.0".into();
        relaxed.schema = json!({"type": "object"});
        registry.register(relaxed).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("billing-invoice").unwrap().version, "2.0.0");
        // The relaxed schema now governs.
        registry
            .check("invoice.created", &json!({"amount": "bad"}))
            .unwrap();
    }
}
