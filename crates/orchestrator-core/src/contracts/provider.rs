//! Provider manifest types (spec §4.1, §6).
//!
//! A provider's `capabilities` carry both a simple form (a flat list of
//! resource-type strings) and an advanced form (per-operation workflow
//! bindings with optional tags and aliasing). The resolver treats both as a
//! union over one normalized structure built at load time (spec §9).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The three operations a workflow can realize for a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// The workflow bound to one operation, plus optional disambiguating tags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderOperation {
    pub workflow: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One entry of the advanced capability form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceTypeCapability {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(rename = "aliasFor", default)]
    pub alias_for: Option<String>,
    pub operations: HashMap<Operation, ProviderOperation>,
}

/// Both capability forms as declared in a provider manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProviderCapabilities {
    #[serde(rename = "resourceTypes", default)]
    pub resource_types: Vec<String>,
    #[serde(rename = "resourceTypeCapabilities", default)]
    pub resource_type_capabilities: Vec<ResourceTypeCapability>,
}

/// A loaded, normalized provider: name, version, category, capabilities,
/// and the workflow definitions it owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provider {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub category: String,
    pub capabilities: ProviderCapabilities,
    pub workflows: Vec<crate::contracts::workflow::WorkflowDefinition>,
}

/// The on-disk manifest shape from spec §6:
/// `apiVersion, kind=Provider, metadata: {name, version}, capabilities, workflows`.
/// The loader that reads this from a filesystem or Git ref is an external
/// collaborator; this crate only deserializes the parsed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ProviderManifestMetadata,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
    #[serde(default)]
    pub workflows: Vec<crate::contracts::workflow::WorkflowDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderManifestMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub category: String,
}

impl ProviderManifest {
    /// Parse a YAML document into a manifest (spec §6 format).
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn into_provider(self) -> Provider {
        Provider {
            name: self.metadata.name,
            version: self.metadata.version,
            category: self.metadata.category,
            capabilities: self.capabilities,
            workflows: self.workflows,
        }
    }
}
