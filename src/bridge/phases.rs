//! Phase handlers for the EndpointBridge workflow
//!
//! Each handler checks its phase's postcondition against the live world and
//! performs the minimum work to move toward it. Handlers never write status;
//! they report a [`PhaseOutcome`] and the driver folds outcomes into the one
//! status update of the pass.

use kube::core::GroupVersionKind;
use tracing::{debug, info};

use crate::crd::{Condition, EndpointBridge};
use crate::runtime::{attach_owner, manifest_matches, owner_reference, ObjectClient};
use crate::{Error, Result};

use super::remote::RemoteClient;
use super::BridgeReconciler;

/// What a phase handler observed
#[derive(Clone, Debug)]
pub enum PhaseOutcome {
    /// Postcondition not met yet; stay in this phase and requeue with the
    /// given condition
    Wait(Condition),
    /// Postcondition met; the driver evaluates the next phase within the
    /// same pass
    Advance,
    /// The whole workflow is satisfied
    Done(Condition),
}

/// Facts gathered while phases run, folded into the final status
#[derive(Clone, Debug, Default)]
pub struct PassState {
    /// FQDN of the upserted DNS record
    pub dns_record: Option<String>,
    /// Secret holding the issued certificate
    pub certificate_secret: Option<String>,
}

pub(super) fn service_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Service")
}

pub(super) fn certificate_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("cert-manager.io", "v1", "Certificate")
}

pub(super) fn role_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "Role")
}

pub(super) fn role_binding_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "RoleBinding")
}

/// Name of the Certificate object composed for a bridge
pub fn certificate_name(bridge_name: &str) -> String {
    format!("{bridge_name}-cert")
}

/// Name of the secret the certificate lands in, honoring the override
pub fn certificate_secret_name(bridge: &EndpointBridge, bridge_name: &str) -> String {
    bridge
        .spec
        .certificate
        .as_ref()
        .and_then(|c| c.secret_name.clone())
        .unwrap_or_else(|| format!("{bridge_name}-tls"))
}

/// Name of the Role/RoleBinding pair granting secret access
pub fn access_name(bridge_name: &str) -> String {
    format!("{bridge_name}-secret-reader")
}

/// Controller owner reference for composed objects, when the bridge has been
/// persisted
fn owner_of(bridge: &EndpointBridge, bridge_name: &str) -> Option<serde_json::Value> {
    bridge
        .metadata
        .uid
        .as_deref()
        .map(|uid| owner_reference("trellis.dev/v1alpha1", "EndpointBridge", bridge_name, uid))
}

impl<C: ObjectClient, R: RemoteClient> BridgeReconciler<C, R> {
    /// Prerequisite: the backend service exists and serves the declared port
    pub(super) async fn phase_prerequisite(
        &self,
        bridge: &EndpointBridge,
        namespace: &str,
    ) -> Result<PhaseOutcome> {
        let backend = &bridge.spec.backend;
        let Some(service) = self
            .objects
            .get(&service_gvk(), namespace, &backend.name)
            .await?
        else {
            return Ok(PhaseOutcome::Wait(Condition::not_ready(
                "BackendMissing",
                format!("service '{}' not found", backend.name),
            )));
        };

        let live = serde_json::to_value(&service)
            .map_err(|e| Error::serialization(e.to_string()))?;
        let serves_port = live
            .pointer("/spec/ports")
            .and_then(|p| p.as_array())
            .is_some_and(|ports| {
                ports
                    .iter()
                    .any(|p| p.get("port").and_then(|v| v.as_i64()) == Some(backend.port as i64))
            });
        if !serves_port {
            return Ok(PhaseOutcome::Wait(Condition::not_ready(
                "BackendPortMissing",
                format!("service '{}' does not serve port {}", backend.name, backend.port),
            )));
        }
        Ok(PhaseOutcome::Advance)
    }

    /// PrimaryResource: the certificate object exists and is issued
    pub(super) async fn phase_primary_resource(
        &self,
        bridge: &EndpointBridge,
        namespace: &str,
        bridge_name: &str,
        state: &mut PassState,
    ) -> Result<PhaseOutcome> {
        let Some(certificate) = &bridge.spec.certificate else {
            return Ok(PhaseOutcome::Advance);
        };
        let cert_name = certificate_name(bridge_name);
        let secret_name = certificate_secret_name(bridge, bridge_name);

        let Some(live) = self
            .objects
            .get(&certificate_gvk(), namespace, &cert_name)
            .await?
        else {
            let mut manifest = serde_json::json!({
                "apiVersion": "cert-manager.io/v1",
                "kind": "Certificate",
                "metadata": {"name": cert_name, "namespace": namespace},
                "spec": {
                    "secretName": secret_name,
                    "dnsNames": [bridge.spec.hostname],
                    "issuerRef": {"name": certificate.issuer, "kind": "ClusterIssuer"},
                }
            });
            if let Some(owner) = owner_of(bridge, bridge_name) {
                attach_owner(&mut manifest, &owner);
            }
            info!(name = %cert_name, "creating certificate");
            self.objects
                .create(&certificate_gvk(), namespace, &manifest)
                .await?;
            return Ok(PhaseOutcome::Wait(Condition::not_ready(
                "CertificateIssuing",
                format!("certificate '{cert_name}' created, waiting for issuance"),
            )));
        };

        if !certificate_issued(&live)? {
            return Ok(PhaseOutcome::Wait(Condition::not_ready(
                "CertificateIssuing",
                format!("certificate '{cert_name}' not issued yet"),
            )));
        }
        state.certificate_secret = Some(secret_name);
        Ok(PhaseOutcome::Advance)
    }

    /// SecondaryResources: role and binding let the declared service
    /// accounts read the credential secret
    pub(super) async fn phase_secondary_resources(
        &self,
        bridge: &EndpointBridge,
        namespace: &str,
        bridge_name: &str,
        state: &PassState,
    ) -> Result<PhaseOutcome> {
        let Some(secret) = &state.certificate_secret else {
            return Ok(PhaseOutcome::Advance);
        };
        if bridge.spec.allowed_service_accounts.is_empty() {
            return Ok(PhaseOutcome::Advance);
        }
        let name = access_name(bridge_name);
        let owner = owner_of(bridge, bridge_name);

        let mut role = serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": {"name": name, "namespace": namespace},
            "rules": [{
                "apiGroups": [""],
                "resources": ["secrets"],
                "resourceNames": [secret],
                "verbs": ["get", "watch"],
            }],
        });
        if let Some(owner) = &owner {
            attach_owner(&mut role, owner);
        }
        self.ensure(&role_gvk(), namespace, &name, &role).await?;

        let subjects: Vec<serde_json::Value> = bridge
            .spec
            .allowed_service_accounts
            .iter()
            .map(|sa| {
                serde_json::json!({
                    "kind": "ServiceAccount",
                    "name": sa,
                    "namespace": namespace,
                })
            })
            .collect();
        let mut binding = serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "RoleBinding",
            "metadata": {"name": name, "namespace": namespace},
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "Role",
                "name": name,
            },
            "subjects": subjects,
        });
        if let Some(owner) = &owner {
            attach_owner(&mut binding, owner);
        }
        self.ensure(&role_binding_gvk(), namespace, &name, &binding).await?;
        Ok(PhaseOutcome::Advance)
    }

    /// DirectRemoteCall: upsert the DNS record at the backend's external
    /// address
    pub(super) async fn phase_direct_remote_call(
        &self,
        bridge: &EndpointBridge,
        namespace: &str,
        state: &mut PassState,
    ) -> Result<PhaseOutcome> {
        let backend = &bridge.spec.backend;
        let Some(service) = self
            .objects
            .get(&service_gvk(), namespace, &backend.name)
            .await?
        else {
            return Ok(PhaseOutcome::Wait(Condition::not_ready(
                "BackendMissing",
                format!("service '{}' disappeared", backend.name),
            )));
        };
        let live = serde_json::to_value(&service)
            .map_err(|e| Error::serialization(e.to_string()))?;

        let Some(target) = external_target(&live) else {
            return Ok(PhaseOutcome::Wait(Condition::not_ready(
                "IngressPending",
                format!("service '{}' has no external address yet", backend.name),
            )));
        };

        self.remote
            .upsert_dns_record(&bridge.spec.dns_zone, &bridge.spec.hostname, &target)
            .await?;
        debug!(fqdn = %bridge.spec.hostname, target = %target, "dns record upserted");
        state.dns_record = Some(bridge.spec.hostname.clone());
        Ok(PhaseOutcome::Advance)
    }

    /// Ready: nothing left to do
    pub(super) fn phase_ready(&self) -> PhaseOutcome {
        PhaseOutcome::Done(Condition::ready("Reconciled", "endpoint wired"))
    }

    /// Create-or-apply an object, skipping the write when nothing drifted
    async fn ensure(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        manifest: &serde_json::Value,
    ) -> Result<()> {
        match self.objects.get(gvk, namespace, name).await? {
            None => {
                info!(kind = %gvk.kind, name, "creating object");
                self.objects.create(gvk, namespace, manifest).await?;
            }
            Some(live) => {
                let live = serde_json::to_value(&live)
                    .map_err(|e| Error::serialization(e.to_string()))?;
                if !manifest_matches(&live, manifest) {
                    info!(kind = %gvk.kind, name, "applying drifted object");
                    self.objects.apply(gvk, namespace, name, manifest).await?;
                }
            }
        }
        Ok(())
    }
}

/// True when the certificate carries a Ready=True condition
fn certificate_issued(live: &kube::api::DynamicObject) -> Result<bool> {
    let json = serde_json::to_value(live).map_err(|e| Error::serialization(e.to_string()))?;
    Ok(json
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        }))
}

/// External address of a service, preferring a load balancer hostname over
/// its IP
fn external_target(live: &serde_json::Value) -> Option<String> {
    let ingress = live.pointer("/status/loadBalancer/ingress")?.as_array()?;
    let first = ingress.first()?;
    first
        .get("hostname")
        .or_else(|| first.get("ip"))
        .and_then(|v| v.as_str())
        .map(String::from)
}
