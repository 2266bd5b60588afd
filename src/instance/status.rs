//! Status projection for generated-API instances
//!
//! A pure function from observed node states and resolved bindings to the
//! status document. The reconcile loop computes the whole document and
//! writes it once per pass; nothing here touches the API.

use crate::crd::{Condition, InstanceState};
use crate::expr::{evaluate, Environment, ExprError};
use crate::schema::CompiledSchema;
use crate::{Error, Result};

use super::node::{NodeRecord, NodeState};

/// Build the full status document for one instance
///
/// Projected status fields whose expressions cannot resolve yet (a source
/// node still converging) are omitted; they appear once their inputs exist.
/// Any other evaluation failure is a definition bug and surfaces as an
/// error.
pub fn project_status(
    schema: &CompiledSchema,
    env: &Environment,
    nodes: &[NodeRecord],
    generation: Option<i64>,
) -> Result<serde_json::Value> {
    let state = instance_state(nodes);
    let condition = readiness_condition(&state, nodes, generation);

    let mut status = serde_json::Map::new();

    for field in &schema.status {
        match evaluate(&field.expr, env) {
            Ok(value) => {
                status.insert(field.name.clone(), value.into());
            }
            Err(ExprError::Unresolved(_)) => {}
            Err(e) => {
                return Err(Error::schema(format!(
                    "status field '{}' ({}): {e}",
                    field.name, field.source
                )));
            }
        }
    }

    let mut resources = serde_json::Map::new();
    for node in nodes {
        resources.insert(
            node.id.clone(),
            serde_json::Value::String(node.state.to_string()),
        );
    }

    status.insert("state".to_string(), serde_json::json!(state.to_string()));
    status.insert("resources".to_string(), serde_json::Value::Object(resources));
    status.insert("conditions".to_string(), serde_json::json!([condition]));
    if let Some(generation) = generation {
        status.insert("observedGeneration".to_string(), serde_json::json!(generation));
    }

    Ok(serde_json::Value::Object(status))
}

/// Aggregate node states into the instance state
pub fn instance_state(nodes: &[NodeRecord]) -> InstanceState {
    if nodes.iter().all(|n| n.state.is_resolved()) {
        InstanceState::Active
    } else {
        InstanceState::InProgress
    }
}

fn readiness_condition(
    state: &InstanceState,
    nodes: &[NodeRecord],
    generation: Option<i64>,
) -> Condition {
    let ready = nodes.iter().filter(|n| n.state == NodeState::Ready).count();
    let excluded = nodes.iter().filter(|n| n.state == NodeState::Excluded).count();
    let total = nodes.len();

    let condition = if *state == InstanceState::Active {
        Condition::ready(
            "AllNodesResolved",
            format!("{ready}/{total} ready, {excluded} excluded"),
        )
    } else {
        let waiting: Vec<&str> = nodes
            .iter()
            .filter(|n| !n.state.is_resolved())
            .map(|n| n.id.as_str())
            .collect();
        Condition::not_ready("NodesConverging", format!("waiting on: {}", waiting.join(", ")))
    };
    match generation {
        Some(generation) => condition.observed_generation(generation),
        None => condition,
    }
}
