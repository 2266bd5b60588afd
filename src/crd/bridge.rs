//! EndpointBridge Custom Resource Definition
//!
//! An EndpointBridge fills the capability gap between independently authored
//! per-resource controllers when exposing a service externally: certificate
//! issuance, DNS registration, and access wiring need imperative ordering
//! that no single composed controller provides. The bridge reconciler drives
//! these steps as explicit idempotent phases.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition};

/// Annotation that tells a composed object's native controller to leave the
/// object behind on deletion; the bridge owns deletion policy itself
pub const DELETION_POLICY_ANNOTATION: &str = "trellis.dev/deletion-policy";

/// Annotation value requesting retain-on-delete
pub const DELETION_POLICY_RETAIN: &str = "retain";

/// Specification for an EndpointBridge
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "EndpointBridge",
    plural = "endpointbridges",
    shortname = "eb",
    status = "EndpointBridgeStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.hostname"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EndpointBridgeSpec {
    /// Fully qualified hostname to expose (e.g. `shop.example.com`)
    pub hostname: String,

    /// DNS zone the hostname belongs to (e.g. `example.com`)
    pub dns_zone: String,

    /// Backend service receiving the traffic
    pub backend: BackendRef,

    /// Certificate issuance configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateSpec>,

    /// Service accounts granted access to the endpoint's credential secret
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_service_accounts: Vec<String>,
}

impl EndpointBridgeSpec {
    /// Validate the bridge specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.hostname.is_empty() {
            return Err(crate::Error::validation("hostname must not be empty"));
        }
        if !self.hostname.ends_with(&self.dns_zone) {
            return Err(crate::Error::validation(format!(
                "hostname '{}' is not within dns zone '{}'",
                self.hostname, self.dns_zone
            )));
        }
        if self.backend.name.is_empty() {
            return Err(crate::Error::validation("backend.name must not be empty"));
        }
        if self.backend.port == 0 {
            return Err(crate::Error::validation("backend.port must be non-zero"));
        }
        Ok(())
    }
}

/// Backend service reference
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    /// Service name in the bridge's namespace
    pub name: String,
    /// Service port
    pub port: u16,
}

/// Certificate issuance configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Issuer name understood by the certificate controller
    pub issuer: String,
    /// Secret name the issued certificate lands in; defaults to
    /// `<bridge-name>-tls`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Phases of the bridge reconciler's workflow, in execution order
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BridgePhase {
    /// Verify the backend service exists and capture its endpoint
    #[default]
    Prerequisite,
    /// Ensure the certificate object exists and is issued
    PrimaryResource,
    /// Ensure access wiring (role and binding for the credential secret)
    SecondaryResources,
    /// Upsert the DNS record in the remote zone
    DirectRemoteCall,
    /// All phases satisfied
    Ready,
}

impl BridgePhase {
    /// The phase after this one; Ready is a fixed point
    pub fn next(self) -> Self {
        match self {
            Self::Prerequisite => Self::PrimaryResource,
            Self::PrimaryResource => Self::SecondaryResources,
            Self::SecondaryResources => Self::DirectRemoteCall,
            Self::DirectRemoteCall => Self::Ready,
            Self::Ready => Self::Ready,
        }
    }
}

impl std::fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prerequisite => write!(f, "Prerequisite"),
            Self::PrimaryResource => write!(f, "PrimaryResource"),
            Self::SecondaryResources => write!(f, "SecondaryResources"),
            Self::DirectRemoteCall => write!(f, "DirectRemoteCall"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Status for an EndpointBridge
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointBridgeStatus {
    /// Current phase of the bridge workflow
    #[serde(default)]
    pub phase: BridgePhase,

    /// True once every phase is satisfied
    #[serde(default)]
    pub ready: bool,

    /// Conditions describing the bridge state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// FQDN of the upserted DNS record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_record: Option<String>,

    /// Name of the secret holding the issued certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_secret: Option<String>,

    /// Generation last processed by the bridge reconciler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl EndpointBridgeStatus {
    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: BridgePhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set readiness and return self for chaining
    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ConditionStatus;

    fn sample_spec() -> EndpointBridgeSpec {
        EndpointBridgeSpec {
            hostname: "shop.example.com".to_string(),
            dns_zone: "example.com".to_string(),
            backend: BackendRef {
                name: "shop".to_string(),
                port: 8080,
            },
            certificate: Some(CertificateSpec {
                issuer: "letsencrypt-prod".to_string(),
                secret_name: None,
            }),
            allowed_service_accounts: vec!["shop-frontend".to_string()],
        }
    }

    // =========================================================================
    // Validation Stories
    // =========================================================================

    /// Story: A hostname outside the declared zone fails validation
    ///
    /// The DNS upsert would otherwise target a zone that cannot contain the
    /// record; catching it at validation keeps the error terminal and clear.
    #[test]
    fn story_hostname_must_be_within_zone() {
        let mut spec = sample_spec();
        spec.hostname = "shop.other.org".to_string();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("not within dns zone"));
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn test_backend_port_must_be_nonzero() {
        let mut spec = sample_spec();
        spec.backend.port = 0;
        assert!(spec.validate().is_err());
    }

    // =========================================================================
    // Phase Ordering Stories
    // =========================================================================

    /// Story: Phases advance in a fixed imperative order and Ready is final
    #[test]
    fn story_phases_advance_in_order() {
        let mut phase = BridgePhase::default();
        let mut seen = vec![phase];
        while phase != BridgePhase::Ready {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                BridgePhase::Prerequisite,
                BridgePhase::PrimaryResource,
                BridgePhase::SecondaryResources,
                BridgePhase::DirectRemoteCall,
                BridgePhase::Ready,
            ]
        );
        assert_eq!(BridgePhase::Ready.next(), BridgePhase::Ready);
    }

    #[test]
    fn test_status_builder() {
        let status = EndpointBridgeStatus::default()
            .phase(BridgePhase::DirectRemoteCall)
            .condition(Condition::new(
                "Ready",
                ConditionStatus::False,
                "DnsPending",
                "waiting for record propagation",
            ))
            .observed_generation(2);

        assert_eq!(status.phase, BridgePhase::DirectRemoteCall);
        assert!(!status.ready);
        assert_eq!(status.observed_generation, Some(2));
    }

    /// Story: User defines a bridge in YAML
    #[test]
    fn story_yaml_manifest_defines_bridge() {
        let yaml = r#"
hostname: api.example.com
dnsZone: example.com
backend:
  name: api
  port: 8443
certificate:
  issuer: letsencrypt-prod
allowedServiceAccounts:
  - api-gateway
"#;
        let spec: EndpointBridgeSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.backend.port, 8443);
        assert_eq!(spec.certificate.unwrap().issuer, "letsencrypt-prod");
    }
}
