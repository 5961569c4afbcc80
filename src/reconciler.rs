//! Per-`Service` reconciliation.
//!
//! # How It Works
//!
//! 1. Fetches the `Service`; a missing one is treated as already deleted
//! 2. Classifies it as needing cleanup, ingress, egress, or nothing
//! 3. Cleanup: asks the proxy reconciler to tear down, releases the address
//!    record, then drops the finalizer
//! 4. Provisioning: adds the finalizer, assigns a DNS name and address,
//!    asks the proxy reconciler to converge, and records conditions
//!
//! The scheduler guarantees a single evaluation per `Service` at a time; the
//! shared address records are the only state contended across services.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::conditions::{self, ConditionStatus, ConditionType, set_condition};
use crate::domain::{self, DEFAULT_CLUSTER_DOMAIN, RESOLV_CONF_PATH};
use crate::error::{Error, Result};
use crate::expose::{
    Annotation, Classification, Classifier, ExposureRequest, FINALIZER_NAME,
    child_resource_labels, dns_name_for_svc, tailnet_target_ip,
};
use crate::records::{
    CidrPool, DEFAULT_ALLOCATION_ATTEMPTS, RecordStore, allocate_and_persist, release_and_persist,
};
use crate::registry::{ProxyCounts, ProxyRegistry};

/// Reason set when a `Service`'s annotations can't be acted on.
pub const REASON_PROXY_INVALID: &str = "ProxyInvalid";
/// Reason set once the proxy has been converged.
pub const REASON_PROXY_CREATED: &str = "ProxyCreated";
/// Reason set once the service has an address.
pub const REASON_RECORD_CREATED: &str = "RecordCreated";
/// Reason set when no pool has a free address.
pub const REASON_POOL_EXHAUSTED: &str = "PoolExhausted";

/// Configuration for the `Service` reconciler.
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Namespace the operator runs in; holds the service records.
    pub operator_namespace: String,

    /// DNS domain service names are published under.
    pub cluster_domain: String,

    /// Pool service addresses are drawn from.
    pub pool: CidrPool,

    /// Whether `LoadBalancer` services without a class are handled.
    pub is_default_load_balancer: bool,

    /// Seed for address selection. Random if `None`.
    pub seed: Option<u64>,

    /// Allocate-then-write cycles to try against a contended record store.
    pub allocation_attempts: u32,
}

impl ReconcilerConfig {
    /// Creates a configuration with the default cluster domain.
    #[must_use]
    pub fn new(operator_namespace: impl Into<String>, pool: CidrPool) -> Self {
        Self {
            operator_namespace: operator_namespace.into(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            pool,
            is_default_load_balancer: false,
            seed: None,
            allocation_attempts: DEFAULT_ALLOCATION_ATTEMPTS,
        }
    }

    /// Sets an explicit cluster domain.
    #[must_use]
    pub fn cluster_domain(mut self, domain: impl Into<String>) -> Self {
        self.cluster_domain = domain.into();
        self
    }

    /// Infers the cluster domain from `/etc/resolv.conf`.
    #[must_use]
    pub fn cluster_domain_from_resolv_conf(self) -> Self {
        let domain = domain::retrieve_cluster_domain(RESOLV_CONF_PATH, &self.operator_namespace);
        self.cluster_domain(domain)
    }

    /// Handles `LoadBalancer` services that don't name a class.
    #[must_use]
    pub fn default_load_balancer(mut self, yes: bool) -> Self {
        self.is_default_load_balancer = yes;
        self
    }

    /// Makes address selection reproducible.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets how many conflicting record writes to tolerate.
    #[must_use]
    pub fn allocation_attempts(mut self, attempts: u32) -> Self {
        self.allocation_attempts = attempts;
        self
    }
}

/// Access to `Service` objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Fetches a `Service`; `None` if it doesn't exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Replaces the `Service`'s finalizers.
    async fn set_finalizers(&self, namespace: &str, name: &str, finalizers: &[String])
    -> Result<()>;

    /// Replaces the `Service`'s `status.conditions`.
    async fn patch_status_conditions(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[serde_json::Value],
    ) -> Result<()>;
}

/// What the proxy for a `Service` should do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyTarget {
    /// Serve the `Service` to the tailnet under `dns_name` at `addr`.
    Ingress {
        /// Published DNS name.
        dns_name: String,
        /// Assigned address.
        addr: Ipv4Addr,
    },
    /// Forward traffic for the `Service` to a tailnet IP or FQDN.
    Egress {
        /// The tailnet destination.
        target: String,
    },
}

/// The workload reconciler that runs the actual proxies.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProxyReconciler: Send + Sync {
    /// Creates or updates the proxy for `svc`, labelled with `labels`.
    async fn ensure(
        &self,
        svc: &ExposureRequest,
        labels: &BTreeMap<String, String>,
        target: &ProxyTarget,
    ) -> Result<()>;

    /// Deletes the proxy resources labelled with `labels`.
    ///
    /// Returns `false` while resources are still going away.
    async fn cleanup(&self, labels: &BTreeMap<String, String>) -> Result<bool>;
}

/// Result of a successful reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until the `Service` changes.
    Done,
    /// Cleanup is in progress; look again later.
    Requeue,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Reconciles `Service`s onto the tailnet.
pub struct ServiceReconciler {
    client: Arc<dyn ServiceClient>,
    records: Arc<dyn RecordStore>,
    proxies: Arc<dyn ProxyReconciler>,
    config: ReconcilerConfig,
    classifier: Classifier,
    registry: ProxyRegistry,
    rng: Mutex<StdRng>,
    clock: Clock,
}

impl ServiceReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        client: Arc<dyn ServiceClient>,
        records: Arc<dyn RecordStore>,
        proxies: Arc<dyn ProxyReconciler>,
        config: ReconcilerConfig,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            client,
            records,
            proxies,
            classifier: Classifier::new(config.is_default_load_balancer),
            config,
            registry: ProxyRegistry::new(),
            rng: Mutex::new(rng),
            clock: Arc::new(Utc::now),
        }
    }

    /// Uses `clock` instead of the system clock for condition timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The number of proxies currently managed.
    #[must_use]
    pub fn proxy_counts(&self) -> ProxyCounts {
        self.registry.counts()
    }

    /// Brings the `Service` `namespace/name` to its desired tailnet state.
    ///
    /// # Errors
    ///
    /// Propagates API and proxy reconciler failures, and
    /// [`Error::PoolExhausted`] when the service can't be given an address.
    #[instrument(skip_all, fields(service_ns = %namespace, service_name = %name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome> {
        debug!("starting reconcile");

        let Some(svc) = self.client.get(namespace, name).await? else {
            debug!("service not found, assuming it was deleted");
            return Ok(Outcome::Done);
        };

        let mut svc = ExposureRequest::from(&svc);
        let class = self.classifier.classify(&svc);

        let outcome = if class.must_cleanup {
            debug!(
                "service is being deleted or is (no longer) referring to the tailnet, ensuring any created resources are cleaned up"
            );
            self.maybe_cleanup(&svc).await
        } else {
            self.maybe_provision(&mut svc, &class).await
        };

        debug!("reconcile finished");
        outcome
    }

    /// Removes the proxy and address record created for `svc`, then its
    /// finalizer.
    async fn maybe_cleanup(&self, svc: &ExposureRequest) -> Result<Outcome> {
        if !svc.has_finalizer() {
            debug!("no finalizer, nothing to do");
            self.registry.remove(&svc.uid);
            return Ok(Outcome::Done);
        }

        let labels = child_resource_labels(&svc.name, &svc.namespace, "svc");
        if !self.proxies.cleanup(&labels).await? {
            debug!("cleanup not done yet, waiting for next reconcile");
            return Ok(Outcome::Requeue);
        }

        let dns_name = dns_name_for_svc(svc, &self.config.cluster_domain);
        release_and_persist(
            self.records.as_ref(),
            &dns_name,
            self.config.allocation_attempts,
        )
        .await?;

        let finalizers: Vec<String> = svc
            .finalizers
            .iter()
            .filter(|f| *f != FINALIZER_NAME)
            .cloned()
            .collect();
        self.client
            .set_finalizers(&svc.namespace, &svc.name, &finalizers)
            .await?;

        // Printed exactly once: with the finalizer gone, later reconciles
        // exit early above.
        info!("unexposed service from tailnet");

        self.registry.remove(&svc.uid);
        Ok(Outcome::Done)
    }

    /// Exposes `svc` on the tailnet, adding the finalizer first so the
    /// exposure can be torn down in order later.
    async fn maybe_provision(
        &self,
        svc: &mut ExposureRequest,
        class: &Classification,
    ) -> Result<Outcome> {
        let before = svc.conditions.clone();
        let was_ready =
            conditions::is_ready(&svc.conditions, ConditionType::ProxyReady, svc.generation);
        let now = (self.clock)();

        if !class.violations.is_empty() {
            let msg = class
                .violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!("unable to provision proxy resources: invalid Service: {msg}");
            set_condition(
                svc,
                ConditionType::ProxyReady,
                ConditionStatus::False,
                REASON_PROXY_INVALID,
                &msg,
                now,
            );
            self.patch_conditions_if_changed(svc, &before).await?;
            return Ok(Outcome::Done);
        }

        if !class.must_provision && !class.egress {
            return Ok(Outcome::Done);
        }

        if !svc.has_finalizer() {
            info!("exposing service over tailnet");
            let mut finalizers = svc.finalizers.clone();
            finalizers.push(FINALIZER_NAME.to_string());
            self.client
                .set_finalizers(&svc.namespace, &svc.name, &finalizers)
                .await?;
            svc.finalizers = finalizers;
        }

        let target = if class.must_provision {
            self.assign_address(svc, &before, now).await?
        } else {
            egress_target(svc)
        };

        let labels = child_resource_labels(&svc.name, &svc.namespace, "svc");
        self.proxies.ensure(svc, &labels, &target).await?;

        match target {
            ProxyTarget::Ingress { .. } => {
                self.registry.set_ingress(&svc.uid);
            }
            ProxyTarget::Egress { .. } => {
                // An egress proxy serves no address of its own.
                conditions::remove(&mut svc.conditions, ConditionType::RecordReady);
                self.registry.set_egress(&svc.uid);
            }
        }

        set_condition(
            svc,
            ConditionType::ProxyReady,
            ConditionStatus::True,
            REASON_PROXY_CREATED,
            "",
            now,
        );
        self.patch_conditions_if_changed(svc, &before).await?;

        if !was_ready
            && conditions::is_ready(&svc.conditions, ConditionType::ProxyReady, svc.generation)
        {
            info!("exposed service on tailnet");
        }

        Ok(Outcome::Done)
    }

    /// Gives `svc` its DNS name and address and records the result in its
    /// `RecordReady` condition.
    async fn assign_address(
        &self,
        svc: &mut ExposureRequest,
        before: &[conditions::Condition],
        now: DateTime<Utc>,
    ) -> Result<ProxyTarget> {
        let dns_name = dns_name_for_svc(svc, &self.config.cluster_domain);

        // Each allocation draws its own generator so no lock is held across
        // the store round trips.
        let mut rng = StdRng::seed_from_u64(self.rng.lock().next_u64());

        let result = allocate_and_persist(
            self.records.as_ref(),
            &self.config.pool,
            &dns_name,
            &mut rng,
            self.config.allocation_attempts,
        )
        .await;

        match result {
            Ok(addr) => {
                set_condition(
                    svc,
                    ConditionType::RecordReady,
                    ConditionStatus::True,
                    REASON_RECORD_CREATED,
                    &format!("{dns_name} resolves to {addr}"),
                    now,
                );
                Ok(ProxyTarget::Ingress { dns_name, addr })
            }
            Err(e @ Error::PoolExhausted { .. }) => {
                error!("{e}");
                set_condition(
                    svc,
                    ConditionType::RecordReady,
                    ConditionStatus::False,
                    REASON_POOL_EXHAUSTED,
                    &e.to_string(),
                    now,
                );
                self.patch_conditions_if_changed(svc, before).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn patch_conditions_if_changed(
        &self,
        svc: &ExposureRequest,
        before: &[conditions::Condition],
    ) -> Result<()> {
        if svc.conditions == before {
            return Ok(());
        }

        let mut all = svc.foreign_conditions.clone();
        for c in &svc.conditions {
            all.push(serde_json::to_value(c)?);
        }

        self.client
            .patch_status_conditions(&svc.namespace, &svc.name, &all)
            .await
    }
}

/// Where an egress proxy for `svc` forwards to, preferring the FQDN.
fn egress_target(svc: &ExposureRequest) -> ProxyTarget {
    let target = Annotation::TailnetTargetFqdn
        .get(svc)
        .unwrap_or_else(|| tailnet_target_ip(svc))
        .to_string();
    ProxyTarget::Egress { target }
}

/// [`ServiceClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeServiceClient {
    client: Client,
}

impl KubeServiceClient {
    /// Creates a new client wrapping the given kube `Client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ServiceClient for KubeServiceClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "finalizers": finalizers }
        });

        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn patch_status_conditions(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[serde_json::Value],
    ) -> Result<()> {
        let patch = serde_json::json!({
            "status": { "conditions": conditions }
        });

        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}
