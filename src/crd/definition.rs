//! GraphDefinition Custom Resource Definition
//!
//! A GraphDefinition composes multiple resource templates into one generated
//! API. Registering a definition validates it (schema types, expression
//! syntax, dependency cycles) and installs a new CRD whose instances are
//! reconciled by the instance controller.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Specification for a GraphDefinition
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "GraphDefinition",
    plural = "graphdefinitions",
    shortname = "gd",
    status = "GraphDefinitionStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.schema.kind"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefinitionSpec {
    /// User-facing schema of the generated API
    pub schema: SchemaSpec,

    /// Resource templates composing the graph
    pub resources: Vec<ResourceNode>,
}

/// The user-facing schema block of a GraphDefinition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSpec {
    /// Version of the generated API (e.g. `v1alpha1`)
    pub api_version: String,

    /// Kind of the generated API (e.g. `WebApp`)
    pub kind: String,

    /// Spec field declarations: `field: "type | default=literal"` or nested
    /// objects
    #[serde(default)]
    pub spec: serde_json::Map<String, serde_json::Value>,

    /// Expression-valued status fields: `field: "${expr}"`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, String>,

    /// Instance validation rules evaluated against `schema.spec`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationRule>,
}

/// A boolean validation rule with its user-facing failure message
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ValidationRule {
    /// Boolean `${...}` expression over `schema`
    pub expression: String,

    /// Message surfaced when the expression evaluates to false
    pub message: String,
}

/// One resource template within a GraphDefinition, addressable by id
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNode {
    /// Stable identifier, unique within the definition; other nodes refer to
    /// this node's outputs as `<id>.<path>`
    pub id: String,

    /// Resource manifest with embedded `${...}` expressions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,

    /// Readiness predicates; the node is Ready once all evaluate to true
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_when: Vec<String>,

    /// Inclusion predicates; when any evaluates to false the node is skipped
    /// entirely for that instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_when: Vec<String>,

    /// Reference to an object owned elsewhere; read for bindings, never
    /// created or deleted by the instance controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
}

impl ResourceNode {
    /// True if this node observes an externally owned object
    pub fn is_external(&self) -> bool {
        self.external_ref.is_some()
    }
}

/// Reference to an externally owned object
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    /// API version of the referenced object
    pub api_version: String,
    /// Kind of the referenced object
    pub kind: String,
    /// Name of the referenced object
    pub name: String,
    /// Namespace; defaults to the instance's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl GraphDefinitionSpec {
    /// Structural validation that needs no compiled graph
    ///
    /// Deeper checks (expression parsing, cycle detection, schema types)
    /// happen in the definition controller where the whole graph is built.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.schema.kind.is_empty() {
            return Err(crate::Error::validation("schema.kind must not be empty"));
        }
        if !self
            .schema
            .kind
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase())
        {
            return Err(crate::Error::validation(
                "schema.kind must be a PascalCase type name",
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for node in &self.resources {
            if node.id.is_empty() {
                return Err(crate::Error::validation("resource id must not be empty"));
            }
            if !node
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
                || !node.id.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            {
                return Err(crate::Error::validation(format!(
                    "resource id '{}' must be a lower-camel identifier",
                    node.id
                )));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate resource id '{}'",
                    node.id
                )));
            }
            // reserved namespace roots cannot be shadowed by node ids
            if node.id == "schema" {
                return Err(crate::Error::validation(
                    "resource id 'schema' shadows the schema namespace",
                ));
            }
            if node.template.is_none() && node.external_ref.is_none() {
                return Err(crate::Error::validation(format!(
                    "resource '{}' needs either a template or an externalRef",
                    node.id
                )));
            }
            if node.template.is_some() && node.external_ref.is_some() {
                return Err(crate::Error::validation(format!(
                    "resource '{}' cannot have both a template and an externalRef",
                    node.id
                )));
            }
        }
        Ok(())
    }
}

/// Status for a GraphDefinition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefinitionStatus {
    /// Registration state of the definition
    #[serde(default)]
    pub state: DefinitionState,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing registration state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Node ids in the computed creation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topological_order: Vec<String>,

    /// Generation last processed by the definition controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Registration state of a GraphDefinition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DefinitionState {
    /// Not yet processed
    #[default]
    Pending,
    /// Validated, CRD installed, instance controller running
    Active,
    /// Rejected (cycle, type error, bad expression); no API generated
    Inactive,
}

impl std::fmt::Display for DefinitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Inactive => write!(f, "Inactive"),
        }
    }
}

impl GraphDefinitionStatus {
    /// Set the state and return self for chaining
    pub fn state(mut self, state: DefinitionState) -> Self {
        self.state = state;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        super::types::set_condition(&mut self.conditions, condition);
        self
    }

    /// Set the topological order and return self for chaining
    pub fn topological_order(mut self, order: Vec<String>) -> Self {
        self.topological_order = order;
        self
    }
}
