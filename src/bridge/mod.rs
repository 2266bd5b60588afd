//! EndpointBridge reconciler
//!
//! A phase-driven workflow for the imperative gaps a resource graph cannot
//! express: certificate issuance, access wiring, and a direct DNS call. The
//! driver resumes from the phase recorded on status, runs handlers until one
//! waits or the workflow completes, and performs exactly one status write
//! per pass.

mod phases;
mod remote;

pub use phases::{PassState, PhaseOutcome};
pub use remote::{LoggingRemote, RemoteClient};

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::crd::{
    set_condition, BridgePhase, Condition, EndpointBridge, EndpointBridgeStatus,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::runtime::{retained, KubeObjectClient, ObjectClient};
use crate::{Error, Result};

use phases::{access_name, certificate_gvk, certificate_name, role_binding_gvk, role_gvk};

/// Finalizer guarding remote and composed cleanup
pub const FINALIZER: &str = "trellis.dev/bridge-cleanup";

/// Requeue interval while a phase is waiting
const WAIT_INTERVAL: Duration = Duration::from_secs(30);
/// Requeue interval for a Ready bridge
const READY_INTERVAL: Duration = Duration::from_secs(300);

/// Drives EndpointBridges through their phase workflow
pub struct BridgeReconciler<C, R> {
    pub(crate) objects: Arc<C>,
    pub(crate) remote: Arc<R>,
}

impl<C: ObjectClient, R: RemoteClient> BridgeReconciler<C, R> {
    /// Create a reconciler over the given clients
    pub fn new(objects: Arc<C>, remote: Arc<R>) -> Self {
        Self { objects, remote }
    }

    /// Run one pass of the phase workflow and compute the status to write
    ///
    /// Starts from the phase on status when the generation matches; a spec
    /// edit restarts the workflow from Prerequisite. Phases that are already
    /// satisfied advance without side effects, so a resumed pass re-verifies
    /// nothing it does not have to.
    #[instrument(skip_all, fields(bridge = %bridge.name_any()))]
    pub async fn reconcile_pass(&self, bridge: &EndpointBridge) -> Result<EndpointBridgeStatus> {
        bridge.spec.validate()?;
        let name = bridge.name_any();
        let namespace = bridge.namespace().unwrap_or_else(|| "default".to_string());
        let generation = bridge.metadata.generation;

        let previous = bridge.status.clone().unwrap_or_default();
        let resume = generation.is_some() && previous.observed_generation == generation;
        let mut phase = if resume {
            previous.phase
        } else {
            BridgePhase::default()
        };
        let mut state = if resume {
            PassState {
                dns_record: previous.dns_record.clone(),
                certificate_secret: previous.certificate_secret.clone(),
            }
        } else {
            PassState::default()
        };

        loop {
            let outcome = match phase {
                BridgePhase::Prerequisite => self.phase_prerequisite(bridge, &namespace).await?,
                BridgePhase::PrimaryResource => {
                    self.phase_primary_resource(bridge, &namespace, &name, &mut state)
                        .await?
                }
                BridgePhase::SecondaryResources => {
                    self.phase_secondary_resources(bridge, &namespace, &name, &state)
                        .await?
                }
                BridgePhase::DirectRemoteCall => {
                    self.phase_direct_remote_call(bridge, &namespace, &mut state)
                        .await?
                }
                BridgePhase::Ready => self.phase_ready(),
            };

            match outcome {
                PhaseOutcome::Advance => {
                    debug!(phase = %phase, "phase satisfied");
                    phase = phase.next();
                }
                PhaseOutcome::Wait(condition) => {
                    return Ok(fold_status(previous, phase, false, condition, state, generation));
                }
                PhaseOutcome::Done(condition) => {
                    return Ok(fold_status(
                        previous,
                        BridgePhase::Ready,
                        true,
                        condition,
                        state,
                        generation,
                    ));
                }
            }
        }
    }

    /// Tear down everything the bridge wired up
    ///
    /// The DNS record goes first so traffic stops resolving to objects about
    /// to disappear. Composed deletes are best effort and honor the retain
    /// annotation; only the remote delete can fail the cleanup.
    #[instrument(skip_all, fields(bridge = %bridge.name_any()))]
    pub async fn cleanup(&self, bridge: &EndpointBridge) -> Result<()> {
        let name = bridge.name_any();
        let namespace = bridge.namespace().unwrap_or_else(|| "default".to_string());

        retry_with_backoff(&RetryConfig::default(), "delete_dns_record", || async {
            self.remote
                .delete_dns_record(&bridge.spec.dns_zone, &bridge.spec.hostname)
                .await
        })
        .await?;
        info!(fqdn = %bridge.spec.hostname, "dns record removed");

        let composed = [
            (role_binding_gvk(), access_name(&name)),
            (role_gvk(), access_name(&name)),
            (certificate_gvk(), certificate_name(&name)),
        ];
        for (gvk, obj_name) in composed {
            match self.objects.get(&gvk, &namespace, &obj_name).await {
                Ok(Some(live)) if retained(&live) => {
                    debug!(kind = %gvk.kind, name = %obj_name, "retained by deletion policy");
                }
                Ok(Some(_)) => {
                    if let Err(e) = self.objects.delete(&gvk, &namespace, &obj_name).await {
                        warn!(kind = %gvk.kind, name = %obj_name, error = %e,
                            "composed delete failed, continuing");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(kind = %gvk.kind, name = %obj_name, error = %e,
                        "composed lookup failed, continuing");
                }
            }
        }
        Ok(())
    }
}

/// Fold a pass's outcome into the single status document of the pass
fn fold_status(
    mut base: EndpointBridgeStatus,
    phase: BridgePhase,
    ready: bool,
    condition: Condition,
    state: PassState,
    generation: Option<i64>,
) -> EndpointBridgeStatus {
    base.phase = phase;
    base.ready = ready;
    if state.dns_record.is_some() {
        base.dns_record = state.dns_record;
    }
    if state.certificate_secret.is_some() {
        base.certificate_secret = state.certificate_secret;
    }
    let condition = match generation {
        Some(generation) => condition.observed_generation(generation),
        None => condition,
    };
    set_condition(&mut base.conditions, condition);
    base.observed_generation = generation;
    base
}

// ============================================================================
// Controller wiring
// ============================================================================

/// Context shared by bridge reconcile invocations
pub struct Context<R> {
    client: Client,
    reconciler: BridgeReconciler<KubeObjectClient, R>,
}

/// Run the bridge controller until shutdown
pub async fn run_controller<R: RemoteClient + 'static>(client: Client, remote: Arc<R>) {
    let api: Api<EndpointBridge> = Api::all(client.clone());
    let context = Arc::new(Context {
        reconciler: BridgeReconciler::new(Arc::new(KubeObjectClient::new(client.clone())), remote),
        client,
    });

    info!("starting bridge controller");
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled bridge"),
                Err(e) => warn!(error = %e, "bridge reconcile failed"),
            }
        })
        .await;
}

/// Reconcile one EndpointBridge
#[instrument(skip_all, fields(name = %bridge.name_any()))]
pub async fn reconcile<R: RemoteClient + 'static>(
    bridge: Arc<EndpointBridge>,
    ctx: Arc<Context<R>>,
) -> Result<Action> {
    let namespace = bridge.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<EndpointBridge> = Api::namespaced(ctx.client.clone(), &namespace);

    if bridge.metadata.deletion_timestamp.is_some() {
        ctx.reconciler.cleanup(&bridge).await?;
        remove_finalizer(&api, &bridge).await?;
        return Ok(Action::await_change());
    }

    ensure_finalizer(&api, &bridge).await?;

    let status = match ctx.reconciler.reconcile_pass(&bridge).await {
        Ok(status) => status,
        Err(e) => {
            // surface the failure on status before handing the error to the
            // requeue policy
            let status = error_status(&bridge, &e);
            let patch = serde_json::json!({"status": status});
            if let Err(write_err) = api
                .patch_status(
                    &bridge.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await
            {
                warn!(error = %write_err, "failed to write error status");
            }
            return Err(e);
        }
    };
    let ready = status.ready;
    let patch = serde_json::json!({"status": status});
    api.patch_status(
        &bridge.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(if ready {
        Action::requeue(READY_INTERVAL)
    } else {
        Action::requeue(WAIT_INTERVAL)
    })
}

/// Requeue at the cadence of the error's class
pub fn error_policy<R>(bridge: Arc<EndpointBridge>, error: &Error, _ctx: Arc<Context<R>>) -> Action {
    warn!(name = %bridge.name_any(), error = %error, "bridge reconcile error");
    Action::requeue(error.requeue_after())
}

/// Status document for a failed pass, layered over whatever was last written
fn error_status(bridge: &EndpointBridge, error: &Error) -> EndpointBridgeStatus {
    let mut base = bridge.status.clone().unwrap_or_default();
    base.ready = false;
    let mut condition = Condition::degraded("ReconcileFailed", error.to_string());
    if let Some(generation) = bridge.metadata.generation {
        condition = condition.observed_generation(generation);
    }
    set_condition(&mut base.conditions, condition);
    base
}

async fn ensure_finalizer(api: &Api<EndpointBridge>, bridge: &EndpointBridge) -> Result<()> {
    let mut finalizers = bridge.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &bridge.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn remove_finalizer(api: &Api<EndpointBridge>, bridge: &EndpointBridge) -> Result<()> {
    let Some(finalizers) = bridge.metadata.finalizers.clone() else {
        return Ok(());
    };
    if !finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let remaining: Vec<String> = finalizers.into_iter().filter(|f| f != FINALIZER).collect();
    let patch = serde_json::json!({"metadata": {"finalizers": remaining}});
    api.patch(
        &bridge.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        BackendRef, CertificateSpec, EndpointBridgeSpec, DELETION_POLICY_ANNOTATION,
        DELETION_POLICY_RETAIN,
    };
    use crate::runtime::MockObjectClient;
    use mockall::Sequence;
    use remote::MockRemoteClient;

    fn spec(certificate: bool) -> EndpointBridgeSpec {
        EndpointBridgeSpec {
            hostname: "shop.example.com".to_string(),
            dns_zone: "example.com".to_string(),
            backend: BackendRef {
                name: "shop".to_string(),
                port: 8080,
            },
            certificate: certificate.then(|| CertificateSpec {
                issuer: "letsencrypt-prod".to_string(),
                secret_name: None,
            }),
            allowed_service_accounts: vec![],
        }
    }

    fn bridge(certificate: bool) -> EndpointBridge {
        let mut bridge = EndpointBridge::new("shop-bridge", spec(certificate));
        bridge.metadata.namespace = Some("prod".to_string());
        bridge.metadata.generation = Some(1);
        bridge
    }

    fn service(with_lb: bool) -> kube::api::DynamicObject {
        let mut manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "shop", "namespace": "prod"},
            "spec": {"ports": [{"port": 8080}]}
        });
        if with_lb {
            manifest["status"] = serde_json::json!({
                "loadBalancer": {"ingress": [{"hostname": "lb.example.com"}]}
            });
        }
        serde_json::from_value(manifest).unwrap()
    }

    // =========================================================================
    // Happy Path Stories
    // =========================================================================

    /// Story: A bridge with no certificate wires up in one pass
    ///
    /// Prerequisite and DirectRemoteCall both observe the backend service;
    /// the whole pass produces one status: Ready, with the DNS record
    /// published exactly once.
    #[tokio::test]
    async fn story_full_pass_reaches_ready_with_one_dns_upsert() {
        let mut objects = MockObjectClient::new();
        objects
            .expect_get()
            .withf(|gvk, ns, name| gvk.kind == "Service" && ns == "prod" && name == "shop")
            .times(2)
            .returning(|_, _, _| Ok(Some(service(true))));

        let mut remote = MockRemoteClient::new();
        remote
            .expect_upsert_dns_record()
            .withf(|zone, fqdn, target| {
                zone == "example.com" && fqdn == "shop.example.com" && target == "lb.example.com"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let reconciler = BridgeReconciler::new(Arc::new(objects), Arc::new(remote));
        let status = reconciler.reconcile_pass(&bridge(false)).await.unwrap();

        assert_eq!(status.phase, BridgePhase::Ready);
        assert!(status.ready);
        assert_eq!(status.dns_record.as_deref(), Some("shop.example.com"));
        assert_eq!(status.observed_generation, Some(1));
    }

    /// Story: A missing backend parks the workflow in Prerequisite
    #[tokio::test]
    async fn story_missing_backend_waits_in_prerequisite() {
        let mut objects = MockObjectClient::new();
        objects.expect_get().times(1).returning(|_, _, _| Ok(None));
        let mut remote = MockRemoteClient::new();
        remote.expect_upsert_dns_record().never();

        let reconciler = BridgeReconciler::new(Arc::new(objects), Arc::new(remote));
        let status = reconciler.reconcile_pass(&bridge(false)).await.unwrap();

        assert_eq!(status.phase, BridgePhase::Prerequisite);
        assert!(!status.ready);
        assert_eq!(status.conditions[0].reason, "BackendMissing");
    }

    // =========================================================================
    // Certificate Phase Stories
    // =========================================================================

    /// Story: The certificate is created on first sight, then waited on
    #[tokio::test]
    async fn story_certificate_created_then_waits_for_issuance() {
        let mut objects = MockObjectClient::new();
        objects
            .expect_get()
            .withf(|gvk, _, _| gvk.kind == "Service")
            .times(1)
            .returning(|_, _, _| Ok(Some(service(false))));
        objects
            .expect_get()
            .withf(|gvk, _, name| gvk.kind == "Certificate" && name == "shop-bridge-cert")
            .times(1)
            .returning(|_, _, _| Ok(None));
        objects
            .expect_create()
            .withf(|gvk, ns, manifest| {
                gvk.kind == "Certificate"
                    && ns == "prod"
                    && manifest["spec"]["secretName"] == "shop-bridge-tls"
                    && manifest["spec"]["dnsNames"][0] == "shop.example.com"
            })
            .times(1)
            .returning(|_, _, manifest| Ok(serde_json::from_value(manifest.clone()).unwrap()));

        let mut remote = MockRemoteClient::new();
        remote.expect_upsert_dns_record().never();

        let reconciler = BridgeReconciler::new(Arc::new(objects), Arc::new(remote));
        let status = reconciler.reconcile_pass(&bridge(true)).await.unwrap();

        assert_eq!(status.phase, BridgePhase::PrimaryResource);
        assert_eq!(status.conditions[0].reason, "CertificateIssuing");
    }

    // =========================================================================
    // Resumption Stories
    // =========================================================================

    /// Story: A pass resumes from the phase recorded on status
    ///
    /// The previous pass stopped at DirectRemoteCall; this pass re-runs only
    /// that phase, never re-touching the certificate.
    #[tokio::test]
    async fn story_resumes_from_stored_phase() {
        let mut parked = bridge(true);
        parked.status = Some(
            EndpointBridgeStatus::default()
                .phase(BridgePhase::DirectRemoteCall)
                .observed_generation(1),
        );

        let mut objects = MockObjectClient::new();
        objects
            .expect_get()
            .withf(|gvk, _, _| gvk.kind == "Service")
            .times(1)
            .returning(|_, _, _| Ok(Some(service(true))));

        let mut remote = MockRemoteClient::new();
        remote
            .expect_upsert_dns_record()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let reconciler = BridgeReconciler::new(Arc::new(objects), Arc::new(remote));
        let status = reconciler.reconcile_pass(&parked).await.unwrap();
        assert_eq!(status.phase, BridgePhase::Ready);
        assert!(status.ready);
    }

    /// Story: A spec edit restarts the workflow from Prerequisite
    #[tokio::test]
    async fn story_new_generation_restarts_workflow() {
        let mut edited = bridge(false);
        edited.metadata.generation = Some(2);
        edited.status = Some(
            EndpointBridgeStatus::default()
                .phase(BridgePhase::Ready)
                .ready(true)
                .observed_generation(1),
        );

        let mut objects = MockObjectClient::new();
        objects
            .expect_get()
            .withf(|gvk, _, _| gvk.kind == "Service")
            .times(2)
            .returning(|_, _, _| Ok(Some(service(true))));
        let mut remote = MockRemoteClient::new();
        remote
            .expect_upsert_dns_record()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let reconciler = BridgeReconciler::new(Arc::new(objects), Arc::new(remote));
        let status = reconciler.reconcile_pass(&edited).await.unwrap();
        assert_eq!(status.phase, BridgePhase::Ready);
        assert_eq!(status.observed_generation, Some(2));
    }

    // =========================================================================
    // Failure Stories
    // =========================================================================

    /// Story: A failed pass still lands a Degraded condition on status
    ///
    /// An invalid spec is terminal; without the condition the bridge would
    /// sit with an empty status while the error only circled through the
    /// requeue policy.
    #[tokio::test]
    async fn story_failed_pass_surfaces_degraded_condition() {
        let mut broken = bridge(false);
        broken.spec.hostname = String::new();

        let reconciler = BridgeReconciler::new(
            Arc::new(MockObjectClient::new()),
            Arc::new(MockRemoteClient::new()),
        );
        let err = reconciler.reconcile_pass(&broken).await.unwrap_err();

        let status = error_status(&broken, &err);
        assert!(!status.ready);
        assert_eq!(status.conditions[0].type_, "Degraded");
        assert_eq!(status.conditions[0].reason, "ReconcileFailed");
        assert_eq!(status.conditions[0].observed_generation, Some(1));
        assert!(status.conditions[0].message.contains("hostname"));
    }

    // =========================================================================
    // Cleanup Stories
    // =========================================================================

    /// Story: Cleanup removes the remote record before any composed object
    #[tokio::test]
    async fn story_cleanup_removes_remote_record_first() {
        let mut seq = Sequence::new();

        let mut remote = MockRemoteClient::new();
        remote
            .expect_delete_dns_record()
            .withf(|zone, fqdn| zone == "example.com" && fqdn == "shop.example.com")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut objects = MockObjectClient::new();
        objects
            .expect_get()
            .withf(|gvk, _, _| gvk.kind == "Certificate")
            .times(1)
            .returning(|_, _, name| {
                Ok(Some(
                    serde_json::from_value(serde_json::json!({
                        "apiVersion": "cert-manager.io/v1",
                        "kind": "Certificate",
                        "metadata": {"name": name, "namespace": "prod"}
                    }))
                    .unwrap(),
                ))
            });
        objects
            .expect_get()
            .withf(|gvk, _, _| gvk.kind != "Certificate")
            .times(2)
            .returning(|_, _, _| Ok(None));
        objects
            .expect_delete()
            .withf(|gvk, _, name| gvk.kind == "Certificate" && name == "shop-bridge-cert")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let reconciler = BridgeReconciler::new(Arc::new(objects), Arc::new(remote));
        reconciler.cleanup(&bridge(true)).await.unwrap();
    }

    /// Story: A retained composed object survives cleanup
    #[tokio::test]
    async fn story_cleanup_honors_retain_annotation() {
        let mut remote = MockRemoteClient::new();
        remote
            .expect_delete_dns_record()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut objects = MockObjectClient::new();
        objects
            .expect_get()
            .withf(|gvk, _, _| gvk.kind == "Certificate")
            .times(1)
            .returning(|_, _, name| {
                Ok(Some(
                    serde_json::from_value(serde_json::json!({
                        "apiVersion": "cert-manager.io/v1",
                        "kind": "Certificate",
                        "metadata": {
                            "name": name,
                            "namespace": "prod",
                            "annotations": {DELETION_POLICY_ANNOTATION: DELETION_POLICY_RETAIN}
                        }
                    }))
                    .unwrap(),
                ))
            });
        objects
            .expect_get()
            .withf(|gvk, _, _| gvk.kind != "Certificate")
            .times(2)
            .returning(|_, _, _| Ok(None));
        objects.expect_delete().never();

        let reconciler = BridgeReconciler::new(Arc::new(objects), Arc::new(remote));
        reconciler.cleanup(&bridge(true)).await.unwrap();
    }

    /// Story: A failed composed delete does not abort cleanup
    #[tokio::test]
    async fn story_cleanup_is_best_effort_for_composed_objects() {
        let mut remote = MockRemoteClient::new();
        remote
            .expect_delete_dns_record()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut objects = MockObjectClient::new();
        objects.expect_get().times(3).returning(|gvk, ns, name| {
            Ok(Some(
                serde_json::from_value(serde_json::json!({
                    "apiVersion": "v1",
                    "kind": gvk.kind,
                    "metadata": {"name": name, "namespace": ns}
                }))
                .unwrap(),
            ))
        });
        objects
            .expect_delete()
            .times(3)
            .returning(|_, _, _| Err(Error::remote("apiserver unreachable")));

        let reconciler = BridgeReconciler::new(Arc::new(objects), Arc::new(remote));
        assert!(reconciler.cleanup(&bridge(true)).await.is_ok());
    }
}
