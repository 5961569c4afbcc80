//! Wiring of [`ServiceReconciler`] into a `kube` controller.
//!
//! Every `Service` in the cluster is watched. A finished reconcile waits for
//! the next change, unfinished cleanup is polled, and failures are retried
//! sooner or later depending on [`Error::is_transient`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};

use crate::error::{Error, Result};
use crate::reconciler::{
    KubeServiceClient, Outcome, ProxyReconciler, ReconcilerConfig, ServiceReconciler,
};
use crate::records::ConfigMapRecordStore;

/// Delay before looking again at a `Service` whose proxies are still going away.
const CLEANUP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before retrying after a failure that may clear up by itself.
const TRANSIENT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before retrying after a failure that needs someone to act.
const PERMANENT_RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Starts reconciling every `Service` in the cluster onto the tailnet.
///
/// This function spawns a background task that watches `Service` resources
/// and runs each change through a [`ServiceReconciler`]. Address records are
/// kept in a `ConfigMap` in the operator's namespace. Proxy workloads are
/// delegated to `proxies`.
///
/// # Arguments
///
/// * `client` - Kubernetes client used for watching and patching
/// * `config` - Reconciler configuration
/// * `proxies` - Creates and deletes the proxy workloads
///
/// # Panics
///
/// Panics if called outside of a Tokio runtime.
pub fn run(client: Client, config: ReconcilerConfig, proxies: Arc<dyn ProxyReconciler>) {
    tokio::spawn(controller_loop(client, config, proxies));
}

async fn controller_loop(client: Client, config: ReconcilerConfig, proxies: Arc<dyn ProxyReconciler>) {
    let services: Api<Service> = Api::all(client.clone());
    let records = Arc::new(ConfigMapRecordStore::new(
        client.clone(),
        &config.operator_namespace,
    ));

    tracing::info!(
        "starting service reconciler (cluster domain {}, pool {})",
        config.cluster_domain,
        config.pool
    );

    let reconciler = Arc::new(ServiceReconciler::new(
        Arc::new(KubeServiceClient::new(client)),
        records,
        proxies,
        config,
    ));

    Controller::new(services, WatcherConfig::default())
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => tracing::debug!("reconciled service {obj}"),
                Err(e) => tracing::warn!("service reconcile failed: {e}"),
            }
        })
        .await;

    tracing::warn!("service watch ended, stopping reconciler");
}

async fn reconcile(svc: Arc<Service>, ctx: Arc<ServiceReconciler>) -> Result<Action> {
    let namespace = svc.namespace().unwrap_or_default();
    let outcome = ctx.reconcile(&namespace, &svc.name_any()).await?;
    Ok(action_for(outcome))
}

fn error_policy(svc: Arc<Service>, err: &Error, _ctx: Arc<ServiceReconciler>) -> Action {
    tracing::error!(
        ?err,
        service = %svc.name_any(),
        "reconciliation failed"
    );
    Action::requeue(retry_interval(err))
}

fn action_for(outcome: Outcome) -> Action {
    match outcome {
        Outcome::Done => Action::await_change(),
        Outcome::Requeue => Action::requeue(CLEANUP_POLL_INTERVAL),
    }
}

fn retry_interval(err: &Error) -> Duration {
    if err.is_transient() {
        TRANSIENT_RETRY_INTERVAL
    } else {
        PERMANENT_RETRY_INTERVAL
    }
}
