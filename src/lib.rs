#![cfg_attr(not(test), deny(missing_docs))]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Exposure of Kubernetes `Service`s onto a tailnet.
//!
//! A `Service` opts in by being a `LoadBalancer` of class `tailscale` (or of
//! no class, when this controller is the default load balancer), or by
//! carrying the `tailscale.com/expose: "true"` annotation. It can instead
//! name a tailnet destination with `tailscale.com/tailnet-ip` or
//! `tailscale.com/tailnet-fqdn` to have cluster traffic forwarded there.
//!
//! # Features
//!
//! - **Finalizer-guarded lifecycle**: proxies are always torn down before the `Service` goes away
//! - **Address records**: every exposed service gets a stable DNS name and IPv4 address from a pool
//! - **Optimistic concurrency**: record writes are retried when another writer got there first
//! - **Status conditions**: `TailscaleProxyReady` and `TailscaleRecordReady` report progress
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use tailnet_expose_k8s::{ReconcilerConfig, run};
//!
//! let config = ReconcilerConfig::new("tailscale", "100.100.0.0/16".parse()?)
//!     .cluster_domain_from_resolv_conf()
//!     .default_load_balancer(true);
//!
//! // `MyProxies` implements `ProxyReconciler` and runs the actual proxy pods
//! run(client, config, Arc::new(MyProxies::default()));
//! ```

pub mod conditions;
mod controller;
pub mod domain;
mod error;
pub mod expose;
mod reconciler;
pub mod records;
mod registry;

pub use controller::run;
pub use error::{Error, Result};
pub use expose::{Classification, Classifier, ExposureRequest, Violation};
pub use reconciler::{
    KubeServiceClient, Outcome, ProxyReconciler, ProxyTarget, ReconcilerConfig, ServiceClient,
    ServiceReconciler,
};
pub use records::{CidrPool, ConfigMapRecordStore, RecordStore, Records};
pub use registry::{ProxyCounts, ProxyRegistry};
