//! Instance controller for generated APIs
//!
//! One controller runs per Active GraphDefinition, watching instances of the
//! generated kind through the dynamic API. A reconcile pass walks the
//! dependency graph level by level: evaluate inclusion, render each template
//! against everything resolved so far, apply the objects (only when they
//! actually drifted), and check readiness. Nodes within a level never read
//! each other, so a level dispatches concurrently. The pass ends with a
//! single status write; unconverged instances requeue and pick up where the
//! world left them.

mod node;
mod status;

pub use node::{NodeRecord, NodeState};
pub use status::{instance_state, project_status};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, info, instrument, warn};

use crate::crd::{Condition, InstanceState, ResourceNode};
use crate::expr::{
    evaluate, parse_standalone, render_document, render_string, Environment, ExprError, Value,
};
use crate::graph::DependencyGraph;
use crate::runtime::{
    attach_owner, manifest_gvk, manifest_matches, manifest_name, owner_reference, retained,
    KubeObjectClient, ObjectClient,
};
use crate::schema::CompiledSchema;
use crate::{Error, Result};

/// Finalizer guarding ordered teardown of composed objects
pub const FINALIZER: &str = "trellis.dev/instance-cleanup";

/// Requeue interval while an instance is converging
const CONVERGE_INTERVAL: Duration = Duration::from_secs(10);
/// Requeue interval for drift detection once an instance is Active
const DRIFT_INTERVAL: Duration = Duration::from_secs(300);

/// Compiled artifacts of one Active GraphDefinition
#[derive(Clone, Debug)]
pub struct RegisteredGraph {
    /// Name of the GraphDefinition this came from
    pub definition: String,
    /// GroupVersionKind of the generated API
    pub gvk: GroupVersionKind,
    /// Compiled user-facing schema
    pub schema: CompiledSchema,
    /// Dependency graph over the definition's resource nodes
    pub graph: DependencyGraph,
}

impl RegisteredGraph {
    /// Assemble the registered form of a compiled definition
    pub fn new(definition: impl Into<String>, schema: CompiledSchema, graph: DependencyGraph) -> Self {
        let gvk = GroupVersionKind::gvk(crate::API_GROUP, &schema.api_version, &schema.kind);
        Self {
            definition: definition.into(),
            gvk,
            schema,
            graph,
        }
    }
}

/// Result of one reconcile pass over an instance
#[derive(Clone, Debug)]
pub struct PassOutcome {
    /// Full status document to write
    pub status: serde_json::Value,
    /// True once every node is Ready or Excluded
    pub settled: bool,
}

/// Progress of ordered teardown
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// A composed object was just deleted; its predecessors wait until it is
    /// confirmed gone
    InProgress {
        /// Node id being deleted
        deleting: String,
    },
    /// Every composed object is gone (or retained by policy)
    Complete,
}

/// Walks instances of a generated API through their dependency graph
pub struct InstanceReconciler<C> {
    client: Arc<C>,
}

impl<C: ObjectClient> InstanceReconciler<C> {
    /// Create a reconciler over the given object client
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Run one reconcile pass and compute the status document
    ///
    /// The pass never writes status itself; the caller owns the single
    /// status write so a pass is observable as exactly one update.
    #[instrument(skip_all, fields(definition = %registered.definition))]
    pub async fn reconcile_pass(
        &self,
        registered: &RegisteredGraph,
        instance: &DynamicObject,
    ) -> Result<PassOutcome> {
        let name = instance
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("instance has no name"))?;
        let namespace = instance.metadata.namespace.as_deref().unwrap_or("default");
        let generation = instance.metadata.generation;

        let raw_spec = instance
            .data
            .get("spec")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let spec = registered.schema.apply_defaults(&raw_spec)?;

        let mut env = Environment::new().with_schema(Value::from(serde_json::json!({
            "spec": spec,
            "metadata": {"name": name, "namespace": namespace},
        })));

        for rule in &registered.schema.validation {
            let holds = evaluate(&rule.expr, &env)
                .and_then(|v| v.as_condition())
                .map_err(|e| Error::validation(format!("{}: {e}", rule.message)))?;
            if !holds {
                return Err(Error::validation(rule.message.clone()));
            }
        }

        // composed objects carry the instance as controller owner so cascade
        // GC covers anything the ordered teardown misses
        let owner = instance.metadata.uid.as_deref().map(|uid| {
            owner_reference(
                &format!("{}/{}", registered.gvk.group, registered.gvk.version),
                &registered.gvk.kind,
                name,
                uid,
            )
        });

        let mut records: Vec<NodeRecord> = Vec::new();
        let mut excluded: BTreeSet<String> = BTreeSet::new();

        let schedule = registered.graph.schedule();
        for level in schedule.levels() {
            let mut dispatch = Vec::new();
            for id in level {
                let Some(graph_node) = registered.graph.node(id) else {
                    continue;
                };

                // a node dispatches only once every dependency is Ready or Excluded
                let waiting: Vec<String> = registered
                    .graph
                    .dependencies_of(id)
                    .into_iter()
                    .filter(|dep| {
                        !records
                            .iter()
                            .any(|r| &r.id == dep && r.state.is_resolved())
                    })
                    .collect();
                if !waiting.is_empty() {
                    records.push(
                        NodeRecord::new(id, NodeState::NotStarted)
                            .with_message(format!("waiting on: {}", waiting.join(", "))),
                    );
                    continue;
                }

                if !self.included(id, &graph_node.resource, &env, &graph_node.references, &excluded)? {
                    debug!(node = %id, "excluded by includeWhen");
                    excluded.insert(id.clone());
                    records.push(NodeRecord::new(id, NodeState::Excluded));
                    continue;
                }

                dispatch.push(graph_node);
            }

            // nodes in a level never read each other, so they dispatch together
            let resolved = futures::future::try_join_all(dispatch.into_iter().map(|graph_node| {
                self.resolve_node(
                    &graph_node.resource.id,
                    &graph_node.resource,
                    &graph_node.references,
                    &excluded,
                    namespace,
                    owner.as_ref(),
                    &env,
                )
            }))
            .await?;

            for (record, bound) in resolved {
                if let Some(object) = bound {
                    bind_object(&mut env, &record.id, &object)?;
                }
                records.push(record);
            }
        }

        let status = project_status(&registered.schema, &env, &records, generation)?;
        let settled = records.iter().all(|r| r.state.is_resolved());
        Ok(PassOutcome { status, settled })
    }

    /// Evaluate a node's includeWhen predicates
    fn included(
        &self,
        id: &str,
        resource: &ResourceNode,
        env: &Environment,
        references: &BTreeSet<String>,
        excluded: &BTreeSet<String>,
    ) -> Result<bool> {
        for predicate in &resource.include_when {
            let expr = parse_standalone(predicate)?;
            match evaluate(&expr, env).and_then(|v| v.as_condition()) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e @ ExprError::Unresolved(_)) => {
                    return Err(unresolved_error(id, references, excluded, e));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Dispatch one included node: observe or apply its object, then check
    /// readiness
    ///
    /// Returns the live object alongside the record so the caller can bind
    /// it for downstream expressions once the whole level resolves.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_node(
        &self,
        id: &str,
        resource: &ResourceNode,
        references: &BTreeSet<String>,
        excluded: &BTreeSet<String>,
        namespace: &str,
        owner: Option<&serde_json::Value>,
        env: &Environment,
    ) -> Result<(NodeRecord, Option<DynamicObject>)> {
        if let Some(external) = &resource.external_ref {
            let gvk = gvk_of(&external.api_version, &external.kind);
            let ext_namespace = external.namespace.as_deref().unwrap_or(namespace);
            let ext_name = render_name(&external.name, env)?;

            let Some(live) = self.client.get(&gvk, ext_namespace, &ext_name).await? else {
                return Ok((
                    NodeRecord::new(id, NodeState::Pending).with_message(format!(
                        "external {} '{}' not found",
                        external.kind, ext_name
                    )),
                    None,
                ));
            };
            // readyWhen reads the node's own binding, so bind into a local
            // copy before evaluating
            let mut env = env.clone();
            bind_object(&mut env, id, &live)?;
            let record = readiness(id, resource, &env)?;
            return Ok((record, Some(live)));
        }

        let template = resource
            .template
            .as_ref()
            .ok_or_else(|| Error::graph(format!("resource '{id}' has no template")))?;

        let mut rendered = match render_document(template, env) {
            Ok(doc) => doc,
            Err(e @ ExprError::Unresolved(_)) => {
                match unresolved_error(id, references, excluded, e) {
                    // a bound-but-incomplete source object; wait for it
                    Error::DependencyNotReady(msg) => {
                        return Ok((
                            NodeRecord::new(id, NodeState::NotStarted).with_message(msg),
                            None,
                        ));
                    }
                    other => return Err(other),
                }
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(owner) = owner {
            attach_owner(&mut rendered, owner);
        }

        let gvk = manifest_gvk(&rendered)?;
        let obj_name = manifest_name(&rendered)?;

        let applied = match self.client.get(&gvk, namespace, &obj_name).await? {
            None => {
                info!(node = %id, kind = %gvk.kind, name = %obj_name, "creating object");
                self.client.create(&gvk, namespace, &rendered).await?
            }
            Some(live) => {
                let live_json = serde_json::to_value(&live)
                    .map_err(|e| Error::serialization(e.to_string()))?;
                if manifest_matches(&live_json, &rendered) {
                    live
                } else {
                    info!(node = %id, kind = %gvk.kind, name = %obj_name, "applying drifted object");
                    self.client.apply(&gvk, namespace, &obj_name, &rendered).await?
                }
            }
        };

        let mut env = env.clone();
        bind_object(&mut env, id, &applied)?;
        let record = readiness(id, resource, &env)?;
        Ok((record, Some(applied)))
    }

    /// Advance teardown by at most one deletion
    ///
    /// Composed objects go in the exact reverse of creation order, and a
    /// successor must be confirmed gone before its predecessors are touched.
    /// Objects annotated `trellis.dev/deletion-policy: retain` are left
    /// behind.
    #[instrument(skip_all, fields(definition = %registered.definition))]
    pub async fn teardown_step(
        &self,
        registered: &RegisteredGraph,
        instance: &DynamicObject,
    ) -> Result<TeardownOutcome> {
        let name = instance
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("instance has no name"))?;
        let namespace = instance.metadata.namespace.as_deref().unwrap_or("default");

        let raw_spec = instance
            .data
            .get("spec")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let spec = registered.schema.apply_defaults(&raw_spec)?;
        let mut env = Environment::new().with_schema(Value::from(serde_json::json!({
            "spec": spec,
            "metadata": {"name": name, "namespace": namespace},
        })));

        // Forward walk first: rebind every still-live object so a name that
        // embeds another node's outputs renders exactly as it did at creation.
        let mut composed: Vec<(String, GroupVersionKind, String, DynamicObject)> = Vec::new();
        for id in registered.graph.creation_order() {
            let Some(graph_node) = registered.graph.node(&id) else {
                continue;
            };

            // externally owned objects are observed, never deleted
            if let Some(external) = &graph_node.resource.external_ref {
                let gvk = gvk_of(&external.api_version, &external.kind);
                let ext_namespace = external.namespace.as_deref().unwrap_or(namespace);
                let Ok(ext_name) = render_name(&external.name, &env) else {
                    continue;
                };
                if let Some(live) = self.client.get(&gvk, ext_namespace, &ext_name).await? {
                    bind_object(&mut env, &id, &live)?;
                }
                continue;
            }
            let Some(template) = &graph_node.resource.template else {
                continue;
            };

            let gvk = manifest_gvk(template)?;
            let name_template = template
                .pointer("/metadata/name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::validation(format!("resource '{id}' template has no metadata.name"))
                })?;
            let obj_name = match render_string(name_template, &env) {
                Ok(Value::String(s)) => s,
                Ok(other) => {
                    return Err(Error::validation(format!(
                        "name '{name_template}' rendered to {}, expected string",
                        other.type_name()
                    )));
                }
                // the dependency this name reads is already gone; whatever
                // is left is collected through its owner reference
                Err(ExprError::Unresolved(_)) => {
                    debug!(node = %id, "name reads a deleted object, left to garbage collection");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let Some(live) = self.client.get(&gvk, namespace, &obj_name).await? else {
                continue;
            };
            bind_object(&mut env, &id, &live)?;
            composed.push((id, gvk, obj_name, live));
        }

        for (id, gvk, obj_name, live) in composed.iter().rev() {
            if retained(live) {
                debug!(node = %id, name = %obj_name, "retained by deletion policy");
                continue;
            }

            info!(node = %id, kind = %gvk.kind, name = %obj_name, "deleting object");
            self.client.delete(gvk, namespace, obj_name).await?;
            return Ok(TeardownOutcome::InProgress {
                deleting: id.clone(),
            });
        }

        Ok(TeardownOutcome::Complete)
    }

    /// Write the status document computed by a pass
    pub async fn write_status(
        &self,
        registered: &RegisteredGraph,
        instance: &DynamicObject,
        status: &serde_json::Value,
    ) -> Result<()> {
        let name = instance
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("instance has no name"))?;
        let namespace = instance.metadata.namespace.as_deref().unwrap_or("default");
        self.client
            .patch_status(&registered.gvk, namespace, name, status)
            .await
    }
}

/// Evaluate readyWhen; no predicates means ready-on-existence
fn readiness(id: &str, resource: &ResourceNode, env: &Environment) -> Result<NodeRecord> {
    for predicate in &resource.ready_when {
        let expr = parse_standalone(predicate)?;
        match evaluate(&expr, env).and_then(|v| v.as_condition()) {
            Ok(true) => {}
            Ok(false) => {
                return Ok(NodeRecord::new(id, NodeState::Pending)
                    .with_message(format!("{predicate} is false")));
            }
            Err(ExprError::Unresolved(path)) => {
                return Ok(NodeRecord::new(id, NodeState::Pending)
                    .with_message(format!("waiting for {path}")));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(NodeRecord::new(id, NodeState::Ready))
}

/// Classify an unresolved reference hit after all dependencies resolved
///
/// Reaching into an excluded node without a `?` guard is a definition bug
/// and terminal; a missing field inside a bound object just is not there yet.
fn unresolved_error(
    id: &str,
    references: &BTreeSet<String>,
    excluded: &BTreeSet<String>,
    cause: ExprError,
) -> Error {
    if let Some(gone) = references.iter().find(|r| excluded.contains(*r)) {
        return Error::validation(format!(
            "resource '{id}' references excluded node '{gone}' without an optional guard"
        ));
    }
    Error::dependency_not_ready(format!("resource '{id}': {cause}"))
}

fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    GroupVersionKind::gvk(group, version, kind)
}

/// Render a name field that may embed expressions; the result must be a
/// string
fn render_name(template: &str, env: &Environment) -> Result<String> {
    match render_string(template, env)? {
        Value::String(s) => Ok(s),
        other => Err(Error::validation(format!(
            "name '{template}' rendered to {}, expected string",
            other.type_name()
        ))),
    }
}

fn bind_object(env: &mut Environment, id: &str, object: &DynamicObject) -> Result<()> {
    let json = serde_json::to_value(object).map_err(|e| Error::serialization(e.to_string()))?;
    env.bind(id.to_string(), Value::from(json));
    Ok(())
}

// ============================================================================
// Controller wiring
// ============================================================================

/// Context shared by reconcile invocations of one generated API
pub struct Context {
    api: Api<DynamicObject>,
    reconciler: InstanceReconciler<KubeObjectClient>,
    registered: Arc<RegisteredGraph>,
}

/// Run the instance controller for one Active definition until shutdown
pub async fn run_controller(client: Client, registered: Arc<RegisteredGraph>) {
    let resource = ApiResource::from_gvk(&registered.gvk);
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
    let context = Arc::new(Context {
        api: api.clone(),
        reconciler: InstanceReconciler::new(Arc::new(KubeObjectClient::new(client))),
        registered,
    });

    info!(kind = %context.registered.gvk.kind, "starting instance controller");
    Controller::new_with(api, watcher::Config::default(), resource)
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled instance"),
                Err(e) => warn!(error = %e, "instance reconcile failed"),
            }
        })
        .await;
}

/// Reconcile one instance of a generated API
#[instrument(skip_all, fields(
    kind = %ctx.registered.gvk.kind,
    name = instance.metadata.name.as_deref().unwrap_or(""),
))]
pub async fn reconcile(instance: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action> {
    if instance.metadata.deletion_timestamp.is_some() {
        return match ctx
            .reconciler
            .teardown_step(&ctx.registered, &instance)
            .await?
        {
            TeardownOutcome::InProgress { deleting } => {
                debug!(node = %deleting, "teardown in progress");
                Ok(Action::requeue(CONVERGE_INTERVAL))
            }
            TeardownOutcome::Complete => {
                remove_finalizer(&ctx.api, &instance).await?;
                Ok(Action::await_change())
            }
        };
    }

    ensure_finalizer(&ctx.api, &instance).await?;

    match ctx.reconciler.reconcile_pass(&ctx.registered, &instance).await {
        Ok(outcome) => {
            ctx.reconciler
                .write_status(&ctx.registered, &instance, &outcome.status)
                .await?;
            if outcome.settled {
                Ok(Action::requeue(DRIFT_INTERVAL))
            } else {
                Ok(Action::requeue(CONVERGE_INTERVAL))
            }
        }
        Err(e) => {
            // surface the failure on status before handing the error to the
            // requeue policy
            let status = error_status(&e, instance.metadata.generation);
            if let Err(write_err) = ctx
                .reconciler
                .write_status(&ctx.registered, &instance, &status)
                .await
            {
                warn!(error = %write_err, "failed to write error status");
            }
            Err(e)
        }
    }
}

/// Requeue at the cadence of the error's class
pub fn error_policy(_instance: Arc<DynamicObject>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "instance reconcile error");
    Action::requeue(error.requeue_after())
}

fn error_status(error: &Error, generation: Option<i64>) -> serde_json::Value {
    let state = match error.class() {
        crate::ErrorClass::Terminal => InstanceState::Error,
        _ => InstanceState::InProgress,
    };
    let mut condition = Condition::degraded("ReconcileFailed", error.to_string());
    if let Some(generation) = generation {
        condition = condition.observed_generation(generation);
    }
    serde_json::json!({
        "state": state.to_string(),
        "conditions": [condition],
    })
}

async fn ensure_finalizer(api: &Api<DynamicObject>, instance: &DynamicObject) -> Result<()> {
    let mut finalizers = instance.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    finalizers.push(FINALIZER.to_string());
    patch_finalizers(api, instance, finalizers).await
}

async fn remove_finalizer(api: &Api<DynamicObject>, instance: &DynamicObject) -> Result<()> {
    let Some(finalizers) = instance.metadata.finalizers.clone() else {
        return Ok(());
    };
    if !finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let remaining: Vec<String> = finalizers.into_iter().filter(|f| f != FINALIZER).collect();
    patch_finalizers(api, instance, remaining).await
}

async fn patch_finalizers(
    api: &Api<DynamicObject>,
    instance: &DynamicObject,
    finalizers: Vec<String>,
) -> Result<()> {
    let name = instance
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::validation("instance has no name"))?;
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
