//! GraphDefinition registration controller
//!
//! Watches GraphDefinitions and turns each valid one into a generated API:
//! validate the spec, compile the schema, build the dependency graph, install
//! the generated CRD, and start an instance controller for the new kind. A
//! rejected definition goes Inactive with the reason on status and stays
//! there until its spec changes.

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::crd::{
    Condition, DefinitionState, GraphDefinition, GraphDefinitionSpec, GraphDefinitionStatus,
};
use crate::graph::DependencyGraph;
use crate::instance::RegisteredGraph;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::runtime::{KubeObjectClient, ObjectClient};
use crate::schema::CompiledSchema;
use crate::{Error, Result};

/// Compile a definition spec into its registered form
///
/// This is the whole registration pipeline short of cluster side effects:
/// structural validation, schema compilation, and graph construction with
/// cycle detection. Any failure is terminal for this generation of the spec.
pub fn compile_definition(name: &str, spec: &GraphDefinitionSpec) -> Result<RegisteredGraph> {
    spec.validate()?;
    let schema = CompiledSchema::compile(&spec.schema)?;
    let graph = DependencyGraph::build(&spec.resources)?;
    Ok(RegisteredGraph::new(name, schema, graph))
}

/// Build the CRD manifest for a compiled definition's generated API
pub fn generated_crd(registered: &RegisteredGraph) -> Result<CustomResourceDefinition> {
    let singular = registered.schema.kind.to_lowercase();
    let plural = format!("{singular}s");
    let manifest = serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": format!("{plural}.{}", crate::API_GROUP)},
        "spec": {
            "group": crate::API_GROUP,
            "names": {
                "kind": registered.schema.kind,
                "plural": plural,
                "singular": singular,
            },
            "scope": "Namespaced",
            "versions": [{
                "name": registered.schema.api_version,
                "served": true,
                "storage": true,
                "subresources": {"status": {}},
                "schema": {"openAPIV3Schema": registered.schema.openapi_schema()},
            }],
        },
    });
    serde_json::from_value(manifest).map_err(|e| Error::serialization(e.to_string()))
}

/// Live registry of Active definitions and their instance controllers
///
/// Keyed by GraphDefinition name. Replacing or removing an entry aborts the
/// instance controller that was serving the previous compilation.
#[derive(Default)]
pub struct GraphRegistry {
    entries: DashMap<String, RegistryEntry>,
}

struct RegistryEntry {
    registered: Arc<RegisteredGraph>,
    controller: Option<JoinHandle<()>>,
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        if let Some(handle) = &self.controller {
            handle.abort();
        }
    }
}

impl GraphRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiled definition, replacing any previous compilation
    pub fn register(
        &self,
        name: impl Into<String>,
        registered: Arc<RegisteredGraph>,
        controller: Option<JoinHandle<()>>,
    ) {
        self.entries.insert(
            name.into(),
            RegistryEntry {
                registered,
                controller,
            },
        );
    }

    /// Remove a definition, stopping its instance controller
    pub fn deregister(&self, name: &str) {
        self.entries.remove(name);
    }

    /// Look up a registered definition by name
    pub fn get(&self, name: &str) -> Option<Arc<RegisteredGraph>> {
        self.entries.get(name).map(|e| e.registered.clone())
    }

    /// Generated kinds currently served
    pub fn kinds(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.registered.gvk.kind.clone())
            .collect()
    }

    /// Number of Active definitions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Context shared by definition reconcile invocations
pub struct Context {
    /// Cluster connection for spawning instance controllers
    pub client: Client,
    /// Dynamic object access for CRD installation
    pub objects: Arc<KubeObjectClient>,
    /// Registry of Active definitions
    pub registry: Arc<GraphRegistry>,
}

/// Run the definition controller until shutdown
pub async fn run_controller(client: Client, registry: Arc<GraphRegistry>) {
    let api: Api<GraphDefinition> = Api::all(client.clone());
    let context = Arc::new(Context {
        objects: Arc::new(KubeObjectClient::new(client.clone())),
        client,
        registry,
    });

    info!("starting definition controller");
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled definition"),
                Err(e) => warn!(error = %e, "definition reconcile failed"),
            }
        })
        .await;
}

/// Reconcile one GraphDefinition
#[instrument(skip_all, fields(name = %definition.name_any()))]
pub async fn reconcile(definition: Arc<GraphDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let name = definition.name_any();

    if definition.metadata.deletion_timestamp.is_some() {
        info!("definition deleted, stopping instance controller");
        ctx.registry.deregister(&name);
        return Ok(Action::await_change());
    }

    let generation = definition.metadata.generation;

    match compile_definition(&name, &definition.spec).map(Arc::new) {
        Ok(registered) => {
            let crd = generated_crd(&registered)?;
            retry_with_backoff(&RetryConfig::default(), "install_crd", || async {
                ctx.objects.install_crd(&crd).await
            })
            .await?;

            let controller = tokio::spawn(crate::instance::run_controller(
                ctx.client.clone(),
                registered.clone(),
            ));
            ctx.registry.register(name.clone(), registered.clone(), Some(controller));
            info!(kind = %registered.gvk.kind, "definition active");

            let status = GraphDefinitionStatus::default()
                .state(DefinitionState::Active)
                .message(format!("serving {}", registered.gvk.kind))
                .topological_order(registered.graph.creation_order())
                .condition(condition_for(generation, None));
            write_status(&ctx.client, &definition, status, generation).await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            // the spec itself is wrong; nothing will change until the user
            // edits it
            warn!(error = %e, "definition rejected");
            ctx.registry.deregister(&name);
            let status = GraphDefinitionStatus::default()
                .state(DefinitionState::Inactive)
                .message(e.to_string())
                .condition(condition_for(generation, Some(&e)));
            write_status(&ctx.client, &definition, status, generation).await?;
            Ok(Action::await_change())
        }
    }
}

/// Requeue at the cadence of the error's class
pub fn error_policy(_definition: Arc<GraphDefinition>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "definition reconcile error");
    Action::requeue(error.requeue_after())
}

fn condition_for(generation: Option<i64>, error: Option<&Error>) -> Condition {
    let condition = match error {
        None => Condition::ready("Registered", "graph compiled and CRD installed"),
        Some(e) => Condition::not_ready("Rejected", e.to_string()),
    };
    match generation {
        Some(generation) => condition.observed_generation(generation),
        None => condition,
    }
}

async fn write_status(
    client: &Client,
    definition: &GraphDefinition,
    status: GraphDefinitionStatus,
    generation: Option<i64>,
) -> Result<()> {
    let namespace = definition.metadata.namespace.as_deref().unwrap_or("default");
    let api: Api<GraphDefinition> = Api::namespaced(client.clone(), namespace);
    let mut status = status;
    status.observed_generation = generation;
    let patch = serde_json::json!({"status": status});
    api.patch_status(
        &definition.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ResourceNode, SchemaSpec};

    fn definition_spec() -> GraphDefinitionSpec {
        GraphDefinitionSpec {
            schema: SchemaSpec {
                api_version: "v1alpha1".to_string(),
                kind: "WebApp".to_string(),
                spec: serde_json::json!({"name": "string", "replicas": "integer | default=1"})
                    .as_object()
                    .cloned()
                    .unwrap(),
                status: [("dbName".to_string(), "${db.metadata.name}".to_string())].into(),
                validation: vec![],
            },
            resources: vec![
                ResourceNode {
                    id: "db".to_string(),
                    template: Some(serde_json::json!({
                        "apiVersion": "v1",
                        "kind": "Service",
                        "metadata": {"name": "${schema.spec.name}-db"}
                    })),
                    ready_when: vec![],
                    include_when: vec![],
                    external_ref: None,
                },
                ResourceNode {
                    id: "app".to_string(),
                    template: Some(serde_json::json!({
                        "apiVersion": "apps/v1",
                        "kind": "Deployment",
                        "metadata": {"name": "${schema.spec.name}"},
                        "spec": {"db": "${db.metadata.name}"}
                    })),
                    ready_when: vec![],
                    include_when: vec![],
                    external_ref: None,
                },
            ],
        }
    }

    // =========================================================================
    // Compilation Stories
    // =========================================================================

    /// Story: A valid definition compiles into a registered graph
    #[test]
    fn story_valid_definition_compiles() {
        let registered = compile_definition("webapp-def", &definition_spec()).unwrap();
        assert_eq!(registered.gvk.kind, "WebApp");
        assert_eq!(registered.gvk.group, crate::API_GROUP);
        assert_eq!(registered.graph.creation_order(), vec!["db", "app"]);
    }

    /// Story: A cyclic definition is rejected at registration, not at
    /// instance time
    #[test]
    fn story_cyclic_definition_rejected_at_registration() {
        let mut spec = definition_spec();
        spec.resources[0].template = Some(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "${app.metadata.name}-db"}
        }));
        let err = compile_definition("webapp-def", &spec).unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert_eq!(err.class(), crate::ErrorClass::Terminal);
    }

    #[test]
    fn test_bad_schema_rejected() {
        let mut spec = definition_spec();
        spec.schema.spec = serde_json::json!({"replicas": "intger"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(compile_definition("webapp-def", &spec).is_err());
    }

    // =========================================================================
    // Generated CRD Stories
    // =========================================================================

    /// Story: The generated CRD serves the declared schema with a status
    /// subresource
    #[test]
    fn story_generated_crd_mirrors_schema() {
        let registered = compile_definition("webapp-def", &definition_spec()).unwrap();
        let crd = generated_crd(&registered).unwrap();

        assert_eq!(crd.metadata.name.as_deref(), Some("webapps.trellis.dev"));
        assert_eq!(crd.spec.group, "trellis.dev");
        assert_eq!(crd.spec.names.kind, "WebApp");
        assert_eq!(crd.spec.names.plural, "webapps");

        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version.served && version.storage);
        assert!(version.subresources.as_ref().unwrap().status.is_some());

        let schema = serde_json::to_value(
            &version.schema.as_ref().unwrap().open_api_v3_schema,
        )
        .unwrap();
        assert_eq!(
            schema["properties"]["spec"]["properties"]["replicas"]["type"],
            "integer"
        );
    }

    // =========================================================================
    // Registry Stories
    // =========================================================================

    /// Story: Re-registering a definition replaces the previous compilation
    #[tokio::test]
    async fn story_reregistration_replaces_entry() {
        let registry = GraphRegistry::new();
        let first = Arc::new(compile_definition("webapp-def", &definition_spec()).unwrap());

        registry.register("webapp-def", first.clone(), None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("webapp-def").unwrap().gvk.kind, "WebApp");

        let mut spec = definition_spec();
        spec.schema.kind = "WebSite".to_string();
        let second = Arc::new(compile_definition("webapp-def", &spec).unwrap());
        registry.register("webapp-def", second, None);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("webapp-def").unwrap().gvk.kind, "WebSite");
        assert_eq!(registry.kinds(), vec!["WebSite"]);
    }

    #[tokio::test]
    async fn story_deregistration_aborts_controller() {
        let registry = GraphRegistry::new();
        let registered = Arc::new(compile_definition("webapp-def", &definition_spec()).unwrap());
        let handle = tokio::spawn(async {
            futures::future::pending::<()>().await;
        });
        let probe = handle.abort_handle();

        registry.register("webapp-def", registered, Some(handle));
        registry.deregister("webapp-def");
        assert!(registry.is_empty());
        assert!(registry.get("webapp-def").is_none());

        for _ in 0..10 {
            if probe.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(probe.is_finished());
    }
}
