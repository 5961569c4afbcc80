//! Service exposure controller with a logging proxy reconciler.
//!
//! Watches every `Service` in the cluster, maintains finalizers, address
//! records and status conditions, and logs what a real proxy reconciler would
//! create or delete.
//!
//! # Running locally
//!
//! ```bash
//! cargo run --example service-exposure
//! ```
//!
//! # Environment Variables
//!
//! - `OPERATOR_NAMESPACE`: Namespace holding the service records (default: tailscale)
//! - `SERVICE_POOL`: Comma-separated IPv4 prefixes to allocate from (default: 100.100.0.0/16)
//! - `IS_DEFAULT_LOADBALANCER`: Handle `LoadBalancer` services without a class (default: false)

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tailnet_expose_k8s::{
    CidrPool, ExposureRequest, ProxyReconciler, ProxyTarget, ReconcilerConfig, Result, run,
};
use tracing::{Level, info};

#[derive(Debug, Default)]
struct LoggingProxies;

#[async_trait]
impl ProxyReconciler for LoggingProxies {
    async fn ensure(
        &self,
        svc: &ExposureRequest,
        labels: &BTreeMap<String, String>,
        target: &ProxyTarget,
    ) -> Result<()> {
        match target {
            ProxyTarget::Ingress { dns_name, addr } => {
                info!("would serve {} as {dns_name} ({addr}), labels {labels:?}", svc.key());
            }
            ProxyTarget::Egress { target } => {
                info!("would forward {} to {target}, labels {labels:?}", svc.key());
            }
        }
        Ok(())
    }

    async fn cleanup(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        info!("would delete proxies labelled {labels:?}");
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let namespace = env::var("OPERATOR_NAMESPACE").unwrap_or_else(|_| "tailscale".to_string());
    let pool: CidrPool = env::var("SERVICE_POOL")
        .unwrap_or_else(|_| "100.100.0.0/16".to_string())
        .parse()?;
    let is_default = env::var("IS_DEFAULT_LOADBALANCER").is_ok_and(|v| v == "true");

    let config = ReconcilerConfig::new(namespace, pool)
        .cluster_domain_from_resolv_conf()
        .default_load_balancer(is_default);

    info!("Allocating service addresses from {}", config.pool);

    let client = kube::Client::try_default().await?;
    run(client, config, Arc::new(LoggingProxies));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}
