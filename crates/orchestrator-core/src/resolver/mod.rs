//! Provider resolver (spec §4.1).
//!
//! Maps a `(resource_type, operation)` pair, plus optional disambiguating
//! tags, to the `(provider, workflow)` pair responsible for it.
//!
//! A provider's capabilities arrive in two forms: a flat list of resource
//! type strings ("simple") and a per-operation, per-type, tag-aware form
//! ("advanced"). Both are normalized into one in-memory table at load time
//! (spec §9) so resolution never branches on which form a provider used —
//! the historic defect this guards against treated the simple form as
//! authoritative and rejected valid advanced declarations.

use std::collections::HashMap;

use tracing::{debug, instrument, warn};

use crate::contracts::error::ResolverError;
use crate::contracts::provider::{Operation, Provider};

/// Strict mode surfaces `AmbiguousTags` as an error; default mode logs a
/// disambiguation warning and lets the first match win (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    FirstWins,
    Strict,
}

impl Default for ResolveMode {
    fn default() -> Self {
        Self::FirstWins
    }
}

/// One normalized capability entry: a provider claims `resource_type` (or
/// an alias of it) for `operation`, realized by `workflow`, optionally
/// tagged.
#[derive(Debug, Clone)]
struct CapabilityEntry {
    provider: String,
    resource_type: String,
    operation: Operation,
    workflow: String,
    tags: Vec<String>,
}

/// Loads provider manifests and answers resolution queries against the
/// normalized capability table.
pub struct ProviderResolver {
    providers: Vec<Provider>,
    capabilities: Vec<CapabilityEntry>,
    mode: ResolveMode,
}

impl ProviderResolver {
    pub fn new(mode: ResolveMode) -> Self {
        Self {
            providers: Vec::new(),
            capabilities: Vec::new(),
            mode,
        }
    }

    /// Load a provider. Providers are kept sorted by name so resolution
    /// always walks them in deterministic (name, ascending) order (spec
    /// §4.1 step 1), regardless of load order.
    pub fn load(&mut self, provider: Provider) {
        self.providers.push(provider);
        self.providers.sort_by(|a, b| a.name.cmp(&b.name));
        self.reindex();
    }

    fn reindex(&mut self) {
        self.capabilities.clear();
        for provider in &self.providers {
            Self::index_into(provider, &mut self.capabilities);
        }
    }

    fn index_into(provider: &Provider, out: &mut Vec<CapabilityEntry>) {
        // Advanced form first: type/aliasFor -> operations map.
        for cap in &provider.capabilities.resource_type_capabilities {
            for (operation, op) in &cap.operations {
                out.push(CapabilityEntry {
                    provider: provider.name.clone(),
                    resource_type: cap.resource_type.clone(),
                    operation: *operation,
                    workflow: op.workflow.clone(),
                    tags: op.tags.clone(),
                });
                if let Some(alias) = &cap.alias_for {
                    out.push(CapabilityEntry {
                        provider: provider.name.clone(),
                        resource_type: alias.clone(),
                        operation: *operation,
                        workflow: op.workflow.clone(),
                        tags: op.tags.clone(),
                    });
                }
            }
        }
        // Simple form: resource type declared, workflow follows the
        // `{operation}-{resource_type}` naming convention (spec §4.1 step 3).
        for resource_type in &provider.capabilities.resource_types {
            for operation in [Operation::Create, Operation::Update, Operation::Delete] {
                let workflow_name = format!("{operation}-{resource_type}");
                if provider.workflows.iter().any(|w| w.name == workflow_name) {
                    out.push(CapabilityEntry {
                        provider: provider.name.clone(),
                        resource_type: resource_type.clone(),
                        operation,
                        workflow: workflow_name,
                        tags: Vec::new(),
                    });
                }
            }
        }
    }

    /// True if any loaded provider claims this type in either capability
    /// form. Checks both; a previous defect in the source checked only the
    /// simple form (spec §4.1, §9).
    pub fn can_provision_resource_type(&self, resource_type: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.resource_type == resource_type)
    }

    /// Resolve `(resource_type, operation)` to a `(provider_name,
    /// workflow_name)` pair. Advanced-form matches are considered before
    /// simple-form ones (they're interleaved in the index in that order
    /// per provider, and providers are walked name-ascending); the first
    /// match wins, subsequent candidates are logged as a disambiguation
    /// warning (spec §4.1).
    #[instrument(skip(self, tags))]
    pub fn resolve(
        &self,
        resource_type: &str,
        operation: Operation,
        tags: Option<&[String]>,
    ) -> Result<(String, String), ResolverError> {
        let matching_type: Vec<&CapabilityEntry> = self
            .capabilities
            .iter()
            .filter(|c| c.resource_type == resource_type)
            .collect();

        if matching_type.is_empty() {
            return Err(ResolverError::UnknownResourceType(resource_type.to_string()));
        }

        let matching_op: Vec<&CapabilityEntry> = matching_type
            .iter()
            .filter(|c| c.operation == operation)
            .copied()
            .collect();

        if matching_op.is_empty() {
            return Err(ResolverError::NoOperation {
                provider: matching_type[0].provider.clone(),
                resource_type: resource_type.to_string(),
                operation: operation.to_string(),
            });
        }

        let candidates: Vec<&CapabilityEntry> = match tags {
            Some(tags) if !tags.is_empty() => {
                let tagged: Vec<&CapabilityEntry> = matching_op
                    .iter()
                    .filter(|c| tags.iter().all(|t| c.tags.contains(t)))
                    .copied()
                    .collect();
                if tagged.is_empty() {
                    matching_op
                } else {
                    tagged
                }
            }
            _ => matching_op,
        };

        if candidates.len() > 1 {
            if self.mode == ResolveMode::Strict && tags.map(|t| !t.is_empty()).unwrap_or(false) {
                return Err(ResolverError::AmbiguousTags {
                    resource_type: resource_type.to_string(),
                    tags: tags.map(|t| t.to_vec()).unwrap_or_default(),
                });
            }
            warn!(
                resource_type,
                operation = %operation,
                candidates = candidates.len(),
                "multiple providers match; first-wins, operators should avoid collisions"
            );
        }

        let winner = candidates[0];
        debug!(
            resource_type,
            operation = %operation,
            provider = %winner.provider,
            workflow = %winner.workflow,
            "resolved provider"
        );
        Ok((winner.provider.clone(), winner.workflow.clone()))
    }

    /// Used during spec admission: returns the resource types with no
    /// claiming provider.
    pub fn validate(&self, resource_types: &[String]) -> Vec<String> {
        resource_types
            .iter()
            .filter(|t| !self.can_provision_resource_type(t))
            .cloned()
            .collect()
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn find_workflow(
        &self,
        provider_name: &str,
        workflow_name: &str,
    ) -> Option<&crate::contracts::workflow::WorkflowDefinition> {
        self.providers
            .iter()
            .find(|p| p.name == provider_name)
            .and_then(|p| p.workflows.iter().find(|w| w.name == workflow_name))
    }

    /// Finds a named, operator-invoked golden-path workflow across every
    /// loaded provider (spec §6 "Trigger a named workflow with a parameter
    /// map"), unlike `resolve`, which only ever reaches provisioner
    /// workflows bound to a resource type. Providers are walked
    /// name-ascending; first match wins. Returns owned data so callers can
    /// hold it across an `await` without borrowing the resolver.
    pub fn find_workflow_by_name(
        &self,
        workflow_name: &str,
    ) -> Option<(String, crate::contracts::workflow::WorkflowDefinition)> {
        self.providers.iter().find_map(|p| {
            p.workflows
                .iter()
                .find(|w| {
                    w.name == workflow_name
                        && w.category == crate::contracts::workflow::WorkflowCategory::Goldenpath
                })
                .map(|w| (p.name.clone(), w.clone()))
        })
    }
}

/// Convenience map kept alongside the resolver for callers that want to
/// look up a loaded provider by name without scanning the vec.
pub fn index_providers_by_name(providers: &[Provider]) -> HashMap<&str, &Provider> {
    providers.iter().map(|p| (p.name.as_str(), p)).collect()
}
