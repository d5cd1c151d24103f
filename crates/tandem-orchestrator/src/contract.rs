//! Contract service: creates/activates/fulfills per-work-order contracts;
//! validates each action against scope.
//!
//! Scope checking follows the same allow/deny-against-rules shape as
//! `crates/tandem-core/src/permissions.rs`'s `PermissionManager`, widened to
//! an allow-list ∪ wildcard minus forbid-list evaluation plus a token/time
//! budget.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{OrchestratorError, Result};
use crate::types::{Contract, ContractBudget, ContractId, ContractStatus, ScopePattern, WorkOrderId};

#[derive(Debug, Clone, Default)]
pub struct ActionRequest {
    pub tool: Option<String>,
    pub path: Option<String>,
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ValidationOutcome {
    pub allowed: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct ContractService {
    contracts: Arc<RwLock<HashMap<ContractId, Contract>>>,
}

impl ContractService {
    pub fn new() -> Self {
        Self {
            contracts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create_contract(
        &self,
        work_order_id: WorkOrderId,
        scope: ScopePattern,
        max_tokens: u64,
        deadline: DateTime<Utc>,
    ) -> Contract {
        let contract = Contract {
            id: crate::types::new_id("contract"),
            work_order_id,
            created_at: Utc::now(),
            scope,
            budget: ContractBudget { max_tokens, deadline },
            status: ContractStatus::Draft,
            usage: Default::default(),
        };
        self.contracts
            .write()
            .await
            .insert(contract.id.clone(), contract.clone());
        contract
    }

    pub async fn activate_contract(&self, id: &ContractId) -> Result<()> {
        let mut contracts = self.contracts.write().await;
        let contract = contracts
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("contract {id}")))?;
        contract.status = ContractStatus::Active;
        Ok(())
    }

    /// `{allowed, violations[], warnings[]}` evaluated against
    /// (allow-lists ∪ `*` wildcard) ∩ (forbid-lists).
    /// A contract in `violated` status short-circuits to `allowed=false`.
    pub async fn validate_action(
        &self,
        id: &ContractId,
        request: &ActionRequest,
    ) -> Result<ValidationOutcome> {
        let contracts = self.contracts.read().await;
        let contract = contracts
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("contract {id}")))?;

        if contract.status == ContractStatus::Violated {
            return Ok(ValidationOutcome {
                allowed: false,
                violations: vec!["contract already violated".to_string()],
                warnings: Vec::new(),
            });
        }

        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let scope = &contract.scope;

        if let Some(tool) = &request.tool {
            if scope.forbidden_tools.iter().any(|t| t == tool) {
                violations.push(format!("tool '{tool}' is forbidden by contract scope"));
            } else if !scope.allowed_tools.is_empty()
                && !scope.allowed_tools.iter().any(|t| t == "*" || t == tool)
            {
                violations.push(format!("tool '{tool}' is not in the allowed scope"));
            }
        }

        if let Some(path) = &request.path {
            let normalized = crate::types::normalize_artifact_path(path);
            if scope
                .forbidden_path_prefixes
                .iter()
                .any(|prefix| path_has_prefix(&normalized, prefix))
            {
                violations.push(format!("path '{path}' matches a forbidden prefix"));
            } else if !scope.allowed_path_prefixes.is_empty()
                && !scope
                    .allowed_path_prefixes
                    .iter()
                    .any(|prefix| prefix == "*" || path_has_prefix(&normalized, prefix))
            {
                violations.push(format!("path '{path}' is outside the allowed scope"));
            }
        }

        if contract.usage.tokens_used >= contract.budget.max_tokens {
            warnings.push("token budget nearly exhausted".to_string());
        }
        if Utc::now() >= contract.budget.deadline {
            warnings.push("contract deadline has passed".to_string());
        }

        Ok(ValidationOutcome {
            allowed: violations.is_empty(),
            violations,
            warnings,
        })
    }

    /// Cross-checks elapsed vs. deadline.
    pub async fn check_time_budget(&self, id: &ContractId) -> Result<bool> {
        let contracts = self.contracts.read().await;
        let contract = contracts
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("contract {id}")))?;
        Ok(Utc::now() < contract.budget.deadline)
    }

    pub async fn record_usage(&self, id: &ContractId, cost_usd: f64, tokens: u64) -> Result<()> {
        let mut contracts = self.contracts.write().await;
        let contract = contracts
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("contract {id}")))?;
        contract.usage.tokens_used += tokens;
        contract.usage.estimated_cost_usd += cost_usd;
        if contract.usage.tokens_used > contract.budget.max_tokens {
            contract.status = ContractStatus::Violated;
        }
        Ok(())
    }

    pub async fn fulfill_contract(&self, id: &ContractId) -> Result<Contract> {
        let mut contracts = self.contracts.write().await;
        let contract = contracts
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("contract {id}")))?;
        if contract.status != ContractStatus::Violated {
            contract.status = ContractStatus::Fulfilled;
        }
        Ok(contract.clone())
    }

    pub async fn get(&self, id: &ContractId) -> Option<Contract> {
        self.contracts.read().await.get(id).cloned()
    }
}

impl Default for ContractService {
    fn default() -> Self {
        Self::new()
    }
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = crate::types::normalize_artifact_path(prefix);
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn make_contract(service: &ContractService, scope: ScopePattern) -> Contract {
        service
            .create_contract(
                "wo_1".to_string(),
                scope,
                1_000,
                Utc::now() + Duration::hours(1),
            )
            .await
    }

    #[tokio::test]
    async fn forbidden_path_is_rejected_even_if_allow_list_empty() {
        let service = ContractService::new();
        let scope = ScopePattern {
            forbidden_path_prefixes: vec!["/etc".to_string()],
            ..Default::default()
        };
        let contract = make_contract(&service, scope).await;
        service.activate_contract(&contract.id).await.unwrap();

        let outcome = service
            .validate_action(
                &contract.id,
                &ActionRequest {
                    tool: Some("file_write".to_string()),
                    path: Some("/etc/x".to_string()),
                    operation: None,
                },
            )
            .await
            .unwrap();
        assert!(!outcome.allowed);
        assert!(!outcome.violations.is_empty());
    }

    #[tokio::test]
    async fn allowed_tool_passes_when_allow_list_has_wildcard() {
        let service = ContractService::new();
        let scope = ScopePattern {
            allowed_tools: vec!["*".to_string()],
            ..Default::default()
        };
        let contract = make_contract(&service, scope).await;
        service.activate_contract(&contract.id).await.unwrap();

        let outcome = service
            .validate_action(
                &contract.id,
                &ActionRequest {
                    tool: Some("file_read".to_string()),
                    path: None,
                    operation: None,
                },
            )
            .await
            .unwrap();
        assert!(outcome.allowed);
    }

    #[tokio::test]
    async fn violated_contract_short_circuits_all_validations() {
        let service = ContractService::new();
        let contract = make_contract(&service, ScopePattern::default()).await;
        service.activate_contract(&contract.id).await.unwrap();
        service
            .record_usage(&contract.id, 0.0, 10_000)
            .await
            .unwrap();

        let outcome = service
            .validate_action(&contract.id, &ActionRequest::default())
            .await
            .unwrap();
        assert!(!outcome.allowed);
    }
}
