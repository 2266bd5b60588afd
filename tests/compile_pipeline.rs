//! End-to-end tests of the definition compile pipeline
//!
//! Everything here is pure: YAML in, compiled graph and generated CRD out.
//! No cluster involved; the controller scenarios live next to the
//! reconcilers where the mock clients are available.

use rstest::rstest;

use trellis::crd::GraphDefinitionSpec;
use trellis::definition::{compile_definition, generated_crd};
use trellis::expr::{evaluate, render_string, Environment, Expr, Value};

const WEB_APP_DEFINITION: &str = r#"
schema:
  apiVersion: v1alpha1
  kind: WebApp
  spec:
    name: string
    replicas: "integer | default=2"
    expose: "boolean | default=false"
  status:
    dbHost: "${db.status.host}"
  validation:
    - expression: "${schema.spec.replicas > 0}"
      message: replicas must be positive
resources:
  - id: db
    template:
      apiVersion: v1
      kind: Service
      metadata:
        name: "${schema.spec.name}-db"
    readyWhen:
      - "${(db.status.?host ?? '') != ''}"
  - id: config
    template:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: "${schema.spec.name}-config"
      data:
        host: "${db.status.host}"
  - id: app
    template:
      apiVersion: apps/v1
      kind: Deployment
      metadata:
        name: "${schema.spec.name}"
      spec:
        replicas: "${schema.spec.replicas}"
        configRef: "${config.metadata.name}"
  - id: ingress
    includeWhen:
      - "${schema.spec.expose}"
    template:
      apiVersion: networking.k8s.io/v1
      kind: Ingress
      metadata:
        name: "${schema.spec.name}"
      spec:
        backend: "${app.metadata.name}"
"#;

fn web_app_spec() -> GraphDefinitionSpec {
    serde_yaml::from_str(WEB_APP_DEFINITION).unwrap()
}

/// Story: A definition authored as YAML compiles into a graph whose
/// creation order respects every discovered reference
#[test]
fn story_yaml_definition_compiles_with_discovered_order() {
    let registered = compile_definition("web-app", &web_app_spec()).unwrap();

    let order = registered.graph.creation_order();
    let position = |id: &str| order.iter().position(|n| n == id).unwrap();
    assert!(position("db") < position("config"));
    assert!(position("config") < position("app"));
    assert!(position("app") < position("ingress"));

    let mut deletion = registered.graph.deletion_order();
    deletion.reverse();
    assert_eq!(deletion, order);
}

/// Story: The schedule groups independent nodes into the same level
#[test]
fn story_schedule_levels_follow_dependency_depth() {
    let registered = compile_definition("web-app", &web_app_spec()).unwrap();
    let schedule = registered.graph.schedule();

    assert_eq!(schedule.levels()[0], vec!["db".to_string()]);
    assert!(schedule.depth() >= 3);
}

/// Story: The generated CRD carries the declared spec schema and defaults
#[test]
fn story_generated_crd_serves_declared_schema() {
    let registered = compile_definition("web-app", &web_app_spec()).unwrap();
    let crd = generated_crd(&registered).unwrap();

    assert_eq!(crd.metadata.name.as_deref(), Some("webapps.trellis.dev"));
    let version = &crd.spec.versions[0];
    assert!(version.subresources.as_ref().unwrap().status.is_some());

    let schema =
        serde_json::to_value(&version.schema.as_ref().unwrap().open_api_v3_schema).unwrap();
    assert_eq!(
        schema["properties"]["spec"]["properties"]["replicas"]["default"],
        2
    );
    assert_eq!(
        schema["properties"]["spec"]["properties"]["expose"]["type"],
        "boolean"
    );
}

/// Story: Defaults and validation compose: an instance spec passes through
/// the compiled schema and its rules evaluate over the result
#[test]
fn story_instance_spec_defaults_then_validates() {
    let registered = compile_definition("web-app", &web_app_spec()).unwrap();

    let spec = registered
        .schema
        .apply_defaults(&serde_json::json!({"name": "shop"}))
        .unwrap();
    assert_eq!(spec["replicas"], 2);

    let env = Environment::new()
        .with_schema(Value::from(serde_json::json!({"spec": spec})));
    for rule in &registered.schema.validation {
        assert_eq!(evaluate(&rule.expr, &env).unwrap(), Value::Bool(true));
    }
}

/// Story: Rendering reaches through node bindings exactly as status
/// projection does at reconcile time
#[test]
fn story_rendered_values_flow_between_nodes() {
    let env = Environment::new()
        .with_schema(Value::from(serde_json::json!({"spec": {"name": "shop"}})))
        .with_binding(
            "db",
            Value::from(serde_json::json!({"status": {"host": "db.prod.svc"}})),
        );

    let host = render_string("${db.status.host}", &env).unwrap();
    assert_eq!(host, Value::String("db.prod.svc".into()));

    let name = render_string("${schema.spec.name}-config", &env).unwrap();
    assert_eq!(name, Value::String("shop-config".into()));
}

#[rstest]
#[case("${app.metadata.name}", true)]
#[case("${nowhere.metadata.name}", false)]
#[case("${schema.spec.name}", true)]
fn test_only_known_roots_compile(#[case] reference: &str, #[case] ok: bool) {
    let mut spec = web_app_spec();
    spec.resources[3].template.as_mut().unwrap()["spec"]["backend"] =
        serde_json::Value::String(reference.to_string());
    assert_eq!(compile_definition("web-app", &spec).is_ok(), ok);
}

#[rstest]
#[case("1 + 2 * 3", Value::Int(7))]
#[case("'a' + 'b'", Value::String("ab".into()))]
#[case("size([1, 2, 3])", Value::Int(3))]
#[case("true ? 'yes' : 'no'", Value::String("yes".into()))]
#[case("[1, 2, 3].exists(x, x > 2)", Value::Bool(true))]
fn test_expression_evaluation(#[case] source: &str, #[case] expected: Value) {
    let expr = Expr::parse(source).unwrap();
    assert_eq!(evaluate(&expr, &Environment::new()).unwrap(), expected);
}
