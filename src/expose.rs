//! Deciding whether a `Service` belongs on the tailnet.
//!
//! A `Service` is exposed (ingress) when it is a `LoadBalancer` service of
//! the `tailscale` class, or carries the expose annotation. It points at a
//! tailnet destination (egress) when it carries a tailnet target annotation.
//! Anything else, or anything being deleted, gets cleaned up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use regex::Regex;

use crate::conditions::{Condition, ConditionedResource};

/// Finalizer the controller puts on every `Service` it manages.
pub const FINALIZER_NAME: &str = "tailscale.com/finalizer";

/// `loadBalancerClass` handled by this controller.
pub const LOAD_BALANCER_CLASS: &str = "tailscale";

/// Label marking resources created by this controller.
pub const LABEL_MANAGED: &str = "tailscale.com/managed";
/// Label naming the parent of a managed resource.
pub const LABEL_PARENT_NAME: &str = "tailscale.com/parent-resource";
/// Label naming the namespace of the parent of a managed resource.
pub const LABEL_PARENT_NAMESPACE: &str = "tailscale.com/parent-resource-ns";
/// Label naming the kind of the parent of a managed resource.
pub const LABEL_PARENT_TYPE: &str = "tailscale.com/parent-resource-type";

static MAGIC_DNS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9-]+\.[a-zA-Z0-9-]+\.ts\.net\.?$").expect("valid MagicDNS regex")
});

/// Annotations the controller reads from a `Service`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Annotation {
    /// `"true"` asks for the service to be exposed on the tailnet.
    Expose,
    /// Tailnet IP the service should forward to.
    TailnetTargetIp,
    /// Deprecated spelling of [`Annotation::TailnetTargetIp`].
    TailnetTargetIpLegacy,
    /// Tailnet FQDN the service should forward to.
    TailnetTargetFqdn,
    /// Overrides the `<name>-<namespace>` stem of the service DNS name.
    ServiceDnsName,
}

impl Annotation {
    /// The annotation key.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Expose => "tailscale.com/expose",
            Self::TailnetTargetIp => "tailscale.com/tailnet-ip",
            Self::TailnetTargetIpLegacy => "tailscale.com/ts-tailnet-target-ip",
            Self::TailnetTargetFqdn => "tailscale.com/tailnet-fqdn",
            Self::ServiceDnsName => "tailscale.com/service-dns-name",
        }
    }

    /// The annotation's value on `svc`. Empty values count as unset.
    #[must_use]
    pub fn get(self, svc: &ExposureRequest) -> Option<&str> {
        svc.annotations
            .get(self.key())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// The parts of a `Service` the controller looks at.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExposureRequest {
    /// Service name.
    pub name: String,
    /// Service namespace.
    pub namespace: String,
    /// Service UID.
    pub uid: String,
    /// `spec.type`, e.g. `LoadBalancer`.
    pub service_type: Option<String>,
    /// `spec.clusterIP`.
    pub cluster_ip: Option<String>,
    /// `spec.loadBalancerClass`.
    pub load_balancer_class: Option<String>,
    /// `spec.externalName`.
    pub external_name: Option<String>,
    /// `metadata.annotations`.
    pub annotations: BTreeMap<String, String>,
    /// Whether `metadata.deletionTimestamp` is set.
    pub deletion_requested: bool,
    /// `metadata.finalizers`.
    pub finalizers: Vec<String>,
    /// `metadata.generation`.
    pub generation: i64,
    /// The controller's own conditions from `status.conditions`.
    pub conditions: Vec<Condition>,
    /// Other conditions found in `status.conditions`, kept verbatim.
    pub foreign_conditions: Vec<serde_json::Value>,
}

impl From<&Service> for ExposureRequest {
    fn from(svc: &Service) -> Self {
        let spec = svc.spec.as_ref();
        let (conditions, foreign_conditions) = split_conditions(svc);

        Self {
            name: svc.name_any(),
            namespace: svc.namespace().unwrap_or_default(),
            uid: svc.uid().unwrap_or_default(),
            service_type: spec.and_then(|s| s.type_.clone()),
            cluster_ip: spec.and_then(|s| s.cluster_ip.clone()),
            load_balancer_class: spec.and_then(|s| s.load_balancer_class.clone()),
            external_name: spec.and_then(|s| s.external_name.clone()),
            annotations: svc.annotations().clone(),
            deletion_requested: svc.metadata.deletion_timestamp.is_some(),
            finalizers: svc.finalizers().to_vec(),
            generation: svc.metadata.generation.unwrap_or_default(),
            conditions,
            foreign_conditions,
        }
    }
}

/// Splits `status.conditions` into the ones this controller owns and the rest.
///
/// Goes through JSON so only the wire format matters.
fn split_conditions(svc: &Service) -> (Vec<Condition>, Vec<serde_json::Value>) {
    let raw = svc
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.iter().filter_map(|c| serde_json::to_value(c).ok()).collect::<Vec<_>>())
        .unwrap_or_default();

    let mut ours = Vec::new();
    let mut foreign = Vec::new();
    for value in raw {
        match serde_json::from_value::<Condition>(value.clone()) {
            Ok(c) => ours.push(c),
            Err(_) => foreign.push(value),
        }
    }
    (ours, foreign)
}

impl ExposureRequest {
    /// Reports whether the controller's finalizer is present.
    #[must_use]
    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == FINALIZER_NAME)
    }

    /// `namespace/name`, for logs.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl ConditionedResource for ExposureRequest {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn generation(&self) -> i64 {
        self.generation
    }
}

/// A reason a `Service`'s annotations can't be acted on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// Both tailnet target annotations are set.
    ConflictingTargets,
    /// The FQDN annotation isn't a MagicDNS name.
    InvalidFqdn(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingTargets => write!(
                f,
                "only one of annotations {} and {} can be set",
                Annotation::TailnetTargetIp,
                Annotation::TailnetTargetFqdn
            ),
            Self::InvalidFqdn(fqdn) => write!(
                f,
                "invalid value of annotation {}: {fqdn:?} does not appear to be a valid MagicDNS name",
                Annotation::TailnetTargetFqdn
            ),
        }
    }
}

/// What a reconcile has to do with a `Service`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    /// Tear down whatever was created for the service.
    pub must_cleanup: bool,
    /// Expose the service on the tailnet.
    pub must_provision: bool,
    /// The service forwards to a tailnet target.
    pub egress: bool,
    /// Annotation problems to report.
    pub violations: Vec<Violation>,
}

/// Classifies `Service`s according to the controller's configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct Classifier {
    /// Whether services without a `loadBalancerClass` belong to this
    /// controller.
    pub is_default_load_balancer: bool,
}

impl Classifier {
    /// Creates a classifier.
    #[must_use]
    pub fn new(is_default_load_balancer: bool) -> Self {
        Self {
            is_default_load_balancer,
        }
    }

    /// Works out what a reconcile has to do with `svc`.
    #[must_use]
    pub fn classify(&self, svc: &ExposureRequest) -> Classification {
        let expose = self.should_expose(svc);
        let has_target = !tailnet_target_ip(svc).is_empty()
            || Annotation::TailnetTargetFqdn.get(svc).is_some();

        let must_cleanup = svc.deletion_requested || (!expose && !has_target);

        Classification {
            must_cleanup,
            must_provision: !must_cleanup && expose,
            egress: !must_cleanup && has_target,
            violations: validate(svc),
        }
    }

    /// Reports whether `svc` should be reachable from the tailnet.
    #[must_use]
    pub fn should_expose(&self, svc: &ExposureRequest) -> bool {
        self.should_expose_cluster_ip(svc) || self.should_expose_dns_name(svc)
    }

    /// Reports whether `svc` is an `ExternalName` service asking to be
    /// exposed.
    #[must_use]
    pub fn should_expose_dns_name(&self, svc: &ExposureRequest) -> bool {
        has_expose_annotation(svc)
            && svc.service_type.as_deref() == Some("ExternalName")
            && svc.external_name.as_deref().is_some_and(|n| !n.is_empty())
    }

    /// Reports whether `svc` has a cluster IP and either belongs to this
    /// load balancer or asks to be exposed.
    #[must_use]
    pub fn should_expose_cluster_ip(&self, svc: &ExposureRequest) -> bool {
        match svc.cluster_ip.as_deref() {
            None | Some("" | "None") => false,
            Some(_) => self.is_tailscale_load_balancer(svc) || has_expose_annotation(svc),
        }
    }

    fn is_tailscale_load_balancer(&self, svc: &ExposureRequest) -> bool {
        svc.service_type.as_deref() == Some("LoadBalancer")
            && match svc.load_balancer_class.as_deref() {
                Some(class) => class == LOAD_BALANCER_CLASS,
                None => self.is_default_load_balancer,
            }
    }
}

fn has_expose_annotation(svc: &ExposureRequest) -> bool {
    Annotation::Expose.get(svc) == Some("true")
}

/// Checks `svc`'s tailnet annotations.
#[must_use]
pub fn validate(svc: &ExposureRequest) -> Vec<Violation> {
    let mut violations = Vec::new();
    let fqdn = Annotation::TailnetTargetFqdn.get(svc);

    if fqdn.is_some() && Annotation::TailnetTargetIp.get(svc).is_some() {
        violations.push(Violation::ConflictingTargets);
    }

    if let Some(fqdn) = fqdn
        && !is_magic_dns_name(fqdn)
    {
        violations.push(Violation::InvalidFqdn(fqdn.to_string()));
    }

    violations
}

/// Reports whether `name` looks like `<host>.<tailnet>.ts.net`.
#[must_use]
pub fn is_magic_dns_name(name: &str) -> bool {
    MAGIC_DNS_NAME.is_match(name)
}

/// The tailnet IP `svc` forwards to, preferring the current annotation over
/// the deprecated one. Empty if neither is set.
#[must_use]
pub fn tailnet_target_ip(svc: &ExposureRequest) -> &str {
    Annotation::TailnetTargetIp
        .get(svc)
        .or_else(|| Annotation::TailnetTargetIpLegacy.get(svc))
        .unwrap_or_default()
}

/// The DNS name a service is published under inside `cluster_domain`.
#[must_use]
pub fn dns_name_for_svc(svc: &ExposureRequest, cluster_domain: &str) -> String {
    match Annotation::ServiceDnsName.get(svc) {
        Some(stem) => format!("{stem}.{cluster_domain}"),
        None => format!("{}-{}.{cluster_domain}", svc.name, svc.namespace),
    }
}

/// Labels identifying the proxy resources created for a parent resource.
///
/// Owner references can't cross namespaces, so proxies are tied to their
/// parent with labels instead.
#[must_use]
pub fn child_resource_labels(name: &str, namespace: &str, type_: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_PARENT_NAME.to_string(), name.to_string()),
        (LABEL_PARENT_NAMESPACE.to_string(), namespace.to_string()),
        (LABEL_PARENT_TYPE.to_string(), type_.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ServiceSpec, ServiceStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::conditions::{ConditionStatus, ConditionType};

    fn request(service_type: &str, annotations: &[(Annotation, &str)]) -> ExposureRequest {
        ExposureRequest {
            name: "web".to_string(),
            namespace: "default".to_string(),
            uid: "uid-1".to_string(),
            service_type: Some(service_type.to_string()),
            cluster_ip: Some("10.96.0.12".to_string()),
            annotations: annotations
                .iter()
                .map(|(a, v)| (a.key().to_string(), (*v).to_string()))
                .collect(),
            generation: 1,
            ..Default::default()
        }
    }

    fn load_balancer(class: Option<&str>) -> ExposureRequest {
        ExposureRequest {
            load_balancer_class: class.map(String::from),
            ..request("LoadBalancer", &[])
        }
    }

    // Classifier tests

    #[test]
    fn default_load_balancer_exposes_unclassed_service() {
        let svc = load_balancer(None);

        assert!(Classifier::new(true).should_expose(&svc));
        assert!(!Classifier::new(false).should_expose(&svc));
    }

    #[test]
    fn tailscale_class_is_exposed() {
        let svc = load_balancer(Some("tailscale"));
        assert!(Classifier::new(false).should_expose(&svc));
    }

    #[test]
    fn other_class_is_not_exposed() {
        let svc = load_balancer(Some("metallb"));

        assert!(!Classifier::new(true).should_expose(&svc));
        let c = Classifier::new(true).classify(&svc);
        assert!(c.must_cleanup);
        assert!(!c.must_provision);
    }

    #[test]
    fn expose_annotation_on_cluster_ip_service() {
        let svc = request("ClusterIP", &[(Annotation::Expose, "true")]);
        let c = Classifier::default().classify(&svc);

        assert!(!c.must_cleanup);
        assert!(c.must_provision);
        assert!(!c.egress);
        assert!(c.violations.is_empty());
    }

    #[test]
    fn expose_annotation_must_be_true() {
        let svc = request("ClusterIP", &[(Annotation::Expose, "yes")]);
        assert!(!Classifier::default().should_expose(&svc));
    }

    #[test]
    fn headless_service_is_not_exposed_by_cluster_ip() {
        for ip in [None, Some(""), Some("None")] {
            let svc = ExposureRequest {
                cluster_ip: ip.map(String::from),
                ..request("ClusterIP", &[(Annotation::Expose, "true")])
            };
            assert!(!Classifier::default().should_expose_cluster_ip(&svc), "{ip:?}");
        }
    }

    #[test]
    fn external_name_service_with_annotation() {
        let svc = ExposureRequest {
            cluster_ip: None,
            external_name: Some("db.example.com".to_string()),
            ..request("ExternalName", &[(Annotation::Expose, "true")])
        };
        let classifier = Classifier::default();

        assert!(classifier.should_expose_dns_name(&svc));
        assert!(classifier.should_expose(&svc));

        let no_name = ExposureRequest {
            external_name: None,
            ..svc
        };
        assert!(!classifier.should_expose_dns_name(&no_name));
    }

    #[test]
    fn deletion_forces_cleanup() {
        let svc = ExposureRequest {
            deletion_requested: true,
            ..request("ClusterIP", &[(Annotation::Expose, "true")])
        };
        let c = Classifier::default().classify(&svc);

        assert!(c.must_cleanup);
        assert!(!c.must_provision);
        assert!(!c.egress);
    }

    #[test]
    fn egress_target_prevents_cleanup() {
        let svc = ExposureRequest {
            cluster_ip: None,
            ..request("ExternalName", &[(Annotation::TailnetTargetIp, "100.64.0.7")])
        };
        let c = Classifier::default().classify(&svc);

        assert!(!c.must_cleanup);
        assert!(!c.must_provision);
        assert!(c.egress);
    }

    #[test]
    fn legacy_egress_target_prevents_cleanup() {
        let svc = request("ExternalName", &[(Annotation::TailnetTargetIpLegacy, "100.64.0.7")]);
        let c = Classifier::default().classify(&svc);

        assert!(!c.must_cleanup);
        assert!(c.egress);
    }

    #[test]
    fn both_targets_is_one_violation() {
        let svc = request(
            "ExternalName",
            &[
                (Annotation::TailnetTargetIp, "100.64.0.7"),
                (Annotation::TailnetTargetFqdn, "db.tailnet-abc.ts.net"),
            ],
        );
        let c = Classifier::default().classify(&svc);

        assert_eq!(c.violations, vec![Violation::ConflictingTargets]);
        assert!(!c.must_cleanup);
    }

    #[test]
    fn invalid_fqdn_is_a_violation() {
        let svc = request("ExternalName", &[(Annotation::TailnetTargetFqdn, "db.example.com")]);
        let violations = validate(&svc);

        assert_eq!(
            violations,
            vec![Violation::InvalidFqdn("db.example.com".to_string())]
        );
        assert!(violations[0].to_string().contains("tailscale.com/tailnet-fqdn"));
    }

    #[test]
    fn magic_dns_names() {
        assert!(is_magic_dns_name("db.tailnet-abc.ts.net"));
        assert!(is_magic_dns_name("db.tailnet-abc.ts.net."));
        assert!(!is_magic_dns_name("tailnet-abc.ts.net"));
        assert!(!is_magic_dns_name("db.tailnet.example.net"));
        assert!(!is_magic_dns_name("a.b.c.ts.net"));
    }

    // annotation helpers

    #[test]
    fn tailnet_target_prefers_current_annotation() {
        let both = request(
            "ExternalName",
            &[
                (Annotation::TailnetTargetIp, "100.64.0.1"),
                (Annotation::TailnetTargetIpLegacy, "100.64.0.2"),
            ],
        );
        assert_eq!(tailnet_target_ip(&both), "100.64.0.1");

        let legacy = request("ExternalName", &[(Annotation::TailnetTargetIpLegacy, "100.64.0.2")]);
        assert_eq!(tailnet_target_ip(&legacy), "100.64.0.2");

        let neither = request("ExternalName", &[]);
        assert_eq!(tailnet_target_ip(&neither), "");
    }

    #[test]
    fn empty_annotation_counts_as_unset() {
        let svc = request(
            "ExternalName",
            &[
                (Annotation::TailnetTargetIp, ""),
                (Annotation::TailnetTargetIpLegacy, "100.64.0.2"),
            ],
        );
        assert_eq!(tailnet_target_ip(&svc), "100.64.0.2");
    }

    #[test]
    fn dns_name_uses_annotation_stem() {
        let svc = request("ClusterIP", &[(Annotation::ServiceDnsName, "foo")]);
        assert_eq!(dns_name_for_svc(&svc, "cluster.local"), "foo.cluster.local");
    }

    #[test]
    fn dns_name_defaults_to_name_and_namespace() {
        let svc = request("ClusterIP", &[]);
        assert_eq!(
            dns_name_for_svc(&svc, "cluster.local"),
            "web-default.cluster.local"
        );
    }

    #[test]
    fn child_labels() {
        let labels = child_resource_labels("web", "default", "svc");

        assert_eq!(labels[LABEL_MANAGED], "true");
        assert_eq!(labels[LABEL_PARENT_NAME], "web");
        assert_eq!(labels[LABEL_PARENT_NAMESPACE], "default");
        assert_eq!(labels[LABEL_PARENT_TYPE], "svc");
    }

    // From<&Service>

    #[test]
    fn request_from_service() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("abc".to_string()),
                generation: Some(3),
                finalizers: Some(vec![FINALIZER_NAME.to_string()]),
                annotations: Some(BTreeMap::from([(
                    "tailscale.com/expose".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                cluster_ip: Some("10.96.0.1".to_string()),
                load_balancer_class: Some("tailscale".to_string()),
                ..Default::default()
            }),
            status: None,
        };

        let req = ExposureRequest::from(&svc);

        assert_eq!(req.key(), "default/web");
        assert_eq!(req.uid, "abc");
        assert_eq!(req.generation, 3);
        assert!(req.has_finalizer());
        assert!(!req.deletion_requested);
        assert!(req.conditions.is_empty());
        assert!(Classifier::default().should_expose(&req));
    }

    #[test]
    fn request_splits_own_and_foreign_conditions() {
        let status: ServiceStatus = serde_json::from_value(serde_json::json!({
            "conditions": [
                {
                    "type": "TailscaleProxyReady",
                    "status": "True",
                    "reason": "ProxyCreated",
                    "message": "",
                    "observedGeneration": 2,
                    "lastTransitionTime": "2024-01-01T00:00:00Z"
                },
                {
                    "type": "SomethingElse",
                    "status": "False",
                    "reason": "Other",
                    "message": "not ours",
                    "lastTransitionTime": "2024-01-01T00:00:00Z"
                }
            ]
        }))
        .unwrap();
        let svc = Service {
            status: Some(status),
            ..Default::default()
        };

        let req = ExposureRequest::from(&svc);

        assert_eq!(req.conditions.len(), 1);
        assert_eq!(req.conditions[0].type_, ConditionType::ProxyReady);
        assert_eq!(req.conditions[0].status, ConditionStatus::True);
        assert_eq!(req.foreign_conditions.len(), 1);
        assert_eq!(req.foreign_conditions[0]["type"], "SomethingElse");
    }
}
