//! Cluster DNS domain discovery from the pod's resolver configuration.
//!
//! Kubernetes writes an ordered triple of search domains into every pod's
//! `/etc/resolv.conf`:
//!
//! ```text
//! search <namespace>.svc.<cluster-domain> svc.<cluster-domain> <cluster-domain>
//! ```
//!
//! When the first three entries have exactly that shape, the cluster domain is
//! taken from them. Anything else falls back to `cluster.local`, which the vast
//! majority of clusters use anyway. Nothing in here ever fails.

use std::path::Path;

/// Where the pod's resolver configuration lives.
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Domain used when the resolver configuration can't be trusted.
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Reads the resolver configuration at `path` and infers the cluster domain
/// for a pod running in `namespace`.
pub fn retrieve_cluster_domain(path: impl AsRef<Path>, namespace: &str) -> String {
    let path = path.as_ref();
    tracing::info!("attempting to retrieve cluster domain from {}", path.display());

    match std::fs::read_to_string(path) {
        Ok(contents) => {
            cluster_domain_from_search_domains(&parse_search_domains(&contents), namespace)
        }
        Err(e) => {
            tracing::info!(
                "[unexpected] error reading {}: {e}; defaulting cluster domain to '{DEFAULT_CLUSTER_DOMAIN}'",
                path.display()
            );
            DEFAULT_CLUSTER_DOMAIN.to_string()
        }
    }
}

/// Extracts the search domains from resolver configuration file contents.
///
/// Both `search` and `domain` directives set the list; the last one wins,
/// as with the system resolver.
#[must_use]
pub fn parse_search_domains(contents: &str) -> Vec<String> {
    let mut search = Vec::new();

    for line in contents.lines() {
        let line = line.split(['#', ';']).next().unwrap_or_default();
        let mut fields = line.split_whitespace();

        if let Some("search" | "domain") = fields.next() {
            search = fields.map(String::from).collect();
        }
    }

    search
}

/// Infers the cluster domain from an ordered search domain list.
///
/// Expects the list to start with `<namespace>.svc.<domain>`,
/// `svc.<domain>`, `<domain>` and returns `<domain>` without a trailing dot.
/// Returns [`DEFAULT_CLUSTER_DOMAIN`] otherwise.
#[must_use]
pub fn cluster_domain_from_search_domains<S: AsRef<str>>(search: &[S], namespace: &str) -> String {
    let [first, second, third, ..] = search else {
        tracing::info!(
            "[unexpected] resolver config contains only {} search domains, at least three expected; defaulting cluster domain to '{DEFAULT_CLUSTER_DOMAIN}'",
            search.len()
        );
        return DEFAULT_CLUSTER_DOMAIN.to_string();
    };
    let (first, second, third) = (first.as_ref(), second.as_ref(), third.as_ref());

    if !first.starts_with(&format!("{namespace}.svc")) {
        tracing::info!(
            "[unexpected] first search domain in resolver config is {first}; expected {namespace}.svc.<cluster-domain>; defaulting cluster domain to '{DEFAULT_CLUSTER_DOMAIN}'"
        );
        return DEFAULT_CLUSTER_DOMAIN.to_string();
    }

    if !second.starts_with("svc") {
        tracing::info!(
            "[unexpected] second search domain in resolver config is {second}; expected svc.<cluster-domain>; defaulting cluster domain to '{DEFAULT_CLUSTER_DOMAIN}'"
        );
        return DEFAULT_CLUSTER_DOMAIN.to_string();
    }

    // The domain was historically hardcoded without a trailing dot.
    let second = without_trailing_dot(second);
    let candidate = second.strip_prefix("svc.").unwrap_or(second);

    if !without_trailing_dot(third).eq_ignore_ascii_case(candidate) {
        tracing::info!(
            "[unexpected] expected search domains <namespace>.svc.<cluster-domain>, svc.<cluster-domain>, <cluster-domain>; got {first} {second} {third}; defaulting cluster domain to '{DEFAULT_CLUSTER_DOMAIN}'"
        );
        return DEFAULT_CLUSTER_DOMAIN.to_string();
    }

    tracing::info!("cluster domain {candidate:?} extracted from resolver config");
    candidate.to_string()
}

fn without_trailing_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}
