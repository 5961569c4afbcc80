//! Service address records and IPv4 allocation.
//!
//! Every exposed `Service` gets a synthetic DNS name and an IPv4 address
//! drawn from the configured [`CidrPool`]. The assignments live in a single
//! JSON document shared by all reconciles, so writes go through
//! [`allocate_and_persist`], which re-reads and retries when another writer
//! got there first.
//!
//! # Allocation
//!
//! For each pool prefix in order, a random starting address is picked and
//! the prefix is scanned forward from there, wrapping at its end, until an
//! address is found that is neither assigned nor the reserved nameserver
//! address. A name that already has an address keeps it.
//!
//! Addresses go back to the pool through [`release_and_persist`] once the
//! service is no longer exposed.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Format tag written into every records document.
pub const RECORDS_VERSION: &str = "v1alpha1";

/// Name of the `ConfigMap` holding the records.
pub const RECORDS_CONFIGMAP_NAME: &str = "servicerecords";

/// Binary data key of the records document inside the `ConfigMap`.
pub const RECORDS_KEY: &str = "servicerecords.json";

/// How many allocate-then-write cycles to try before giving up on a
/// contended record store.
pub const DEFAULT_ALLOCATION_ATTEMPTS: u32 = 3;

/// The persisted mapping between service DNS names and addresses.
///
/// Every address in `addrs_to_domain` appears in exactly one `ip4` entry and
/// vice versa.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Records {
    /// Format tag, [`RECORDS_VERSION`].
    pub version: String,

    /// DNS name to assigned IPv4 addresses.
    #[serde(default)]
    pub ip4: BTreeMap<String, Vec<String>>,

    /// Assigned IPv4 address to DNS name.
    #[serde(default)]
    pub addrs_to_domain: BTreeMap<String, String>,

    /// Address of the tailnet nameserver; never handed out to a service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_addr: Option<String>,
}

impl Default for Records {
    fn default() -> Self {
        Self::new()
    }
}

impl Records {
    /// Creates an empty records document.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: RECORDS_VERSION.to_string(),
            ip4: BTreeMap::new(),
            addrs_to_domain: BTreeMap::new(),
            dns_addr: None,
        }
    }

    /// Decodes a records document. Empty input is an empty document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if `bytes` is not a records document.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes the document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The address assigned to `dns_name`, if any.
    #[must_use]
    pub fn address_for(&self, dns_name: &str) -> Option<Ipv4Addr> {
        self.ip4.get(dns_name)?.iter().find_map(|a| a.parse().ok())
    }

    /// The DNS name `addr` is assigned to, if any.
    #[must_use]
    pub fn domain_for(&self, addr: Ipv4Addr) -> Option<&str> {
        self.addrs_to_domain
            .get(&addr.to_string())
            .map(String::as_str)
    }

    /// The reserved nameserver address, if one is recorded and parses.
    #[must_use]
    pub fn reserved_addr(&self) -> Option<Ipv4Addr> {
        self.dns_addr.as_deref().and_then(|a| a.parse().ok())
    }

    /// Assigns `addr` to `dns_name`, replacing anything `dns_name` had.
    pub fn insert(&mut self, dns_name: &str, addr: Ipv4Addr) {
        if let Some(old) = self.ip4.remove(dns_name) {
            for a in old {
                self.addrs_to_domain.remove(&a);
            }
        }

        let addr = addr.to_string();
        self.addrs_to_domain.insert(addr.clone(), dns_name.to_string());
        self.ip4.insert(dns_name.to_string(), vec![addr]);
    }

    /// Drops whatever `dns_name` was assigned. Returns whether anything was.
    pub fn remove(&mut self, dns_name: &str) -> bool {
        let Some(old) = self.ip4.remove(dns_name) else {
            return false;
        };
        for a in old {
            self.addrs_to_domain.remove(&a);
        }
        true
    }

    fn used_addrs(&self) -> HashSet<Ipv4Addr> {
        self.addrs_to_domain
            .keys()
            .filter_map(|a| a.parse().ok())
            .collect()
    }
}

/// An ordered list of masked IPv4 prefixes addresses are drawn from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CidrPool(Vec<Ipv4Net>);

impl CidrPool {
    /// Creates a pool from prefixes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPool`] if the list is empty or a prefix has
    /// host bits set.
    pub fn new(prefixes: Vec<Ipv4Net>) -> Result<Self> {
        if prefixes.is_empty() {
            return Err(Error::invalid_pool("no IPv4 prefixes specified"));
        }

        if let Some(p) = prefixes.iter().find(|p| p.trunc() != **p) {
            return Err(Error::invalid_pool(format!("{p} is not a masked prefix")));
        }

        Ok(Self(prefixes))
    }

    /// The pool's prefixes, in allocation order.
    #[must_use]
    pub fn prefixes(&self) -> &[Ipv4Net] {
        &self.0
    }

    /// Reports whether `addr` lies inside any prefix of the pool.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.0.iter().any(|p| p.contains(&addr))
    }
}

impl FromStr for CidrPool {
    type Err = Error;

    /// Parses a comma separated list such as `100.100.0.0/24, 100.100.8.0/22`.
    fn from_str(s: &str) -> Result<Self> {
        let prefixes = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                p.parse::<Ipv4Net>()
                    .map_err(|e| Error::invalid_pool(format!("{p}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(prefixes)
    }
}

impl fmt::Display for CidrPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

/// Returns the address assigned to `dns_name`, assigning a free one from
/// `pool` first if needed.
///
/// `records` is only modified when a new address is assigned.
///
/// # Errors
///
/// Returns [`Error::PoolExhausted`] when every prefix is fully used; `records`
/// is left untouched in that case.
pub fn allocate<R: Rng>(
    pool: &CidrPool,
    records: &mut Records,
    dns_name: &str,
    rng: &mut R,
) -> Result<Ipv4Addr> {
    if let Some(addr) = records.address_for(dns_name) {
        return Ok(addr);
    }

    let used = records.used_addrs();
    let reserved = records.reserved_addr();

    let free = pool
        .prefixes()
        .iter()
        .find_map(|prefix| scan_prefix(*prefix, rng, |a| !used.contains(&a) && Some(a) != reserved));

    let Some(addr) = free else {
        return Err(Error::PoolExhausted {
            dns_name: dns_name.to_string(),
        });
    };

    records.insert(dns_name, addr);
    Ok(addr)
}

/// Scans `prefix` from a random offset, wrapping around, for the first
/// address accepted by `is_free`.
fn scan_prefix<R, F>(prefix: Ipv4Net, rng: &mut R, is_free: F) -> Option<Ipv4Addr>
where
    R: Rng,
    F: Fn(Ipv4Addr) -> bool,
{
    let base = u32::from(prefix.network());
    let hostmask = u32::from(prefix.hostmask());
    let start = rng.gen_range(0..=hostmask);

    (0..=hostmask)
        .map(|i| Ipv4Addr::from(base | (start.wrapping_add(i) & hostmask)))
        .find(|a| is_free(*a))
}

/// Opaque version of a stored records document, used to detect concurrent
/// writers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreVersion(String);

impl StoreVersion {
    /// Wraps a version string such as a `resourceVersion`.
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// The version string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Shared, versioned storage for [`Records`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Reads the current document and its version.
    async fn load(&self) -> Result<(Records, StoreVersion)>;

    /// Writes `records` only if the stored version is still `version`.
    ///
    /// Returns [`Error::Conflict`] if someone else wrote in between.
    async fn store(&self, records: &Records, version: &StoreVersion) -> Result<()>;
}

/// Returns the address for `dns_name`, allocating and persisting one if the
/// name has none yet.
///
/// Each attempt re-reads the store, so a lost race is resolved against the
/// winner's records. A name that already has an address causes no write.
///
/// # Errors
///
/// Returns [`Error::PoolExhausted`] without writing when no address is free,
/// and [`Error::ConflictRetriesExhausted`] when all `attempts` lost the race.
/// Store errors are propagated.
pub async fn allocate_and_persist<S, R>(
    store: &S,
    pool: &CidrPool,
    dns_name: &str,
    rng: &mut R,
    attempts: u32,
) -> Result<Ipv4Addr>
where
    S: RecordStore + ?Sized,
    R: Rng + Send,
{
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        let (mut records, version) = store.load().await?;

        if let Some(addr) = records.address_for(dns_name) {
            tracing::debug!("record for {dns_name} found with address {addr}");
            return Ok(addr);
        }

        let addr = allocate(pool, &mut records, dns_name, rng)?;

        match store.store(&records, &version).await {
            Ok(()) => {
                tracing::info!("assigned {addr} to {dns_name}");
                return Ok(addr);
            }
            Err(Error::Conflict) => {
                tracing::debug!(
                    "service records changed while assigning {dns_name} (attempt {attempt}/{attempts}), retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }

    tracing::warn!("giving up assigning {dns_name} after {attempts} conflicting writes");
    Err(Error::ConflictRetriesExhausted { attempts })
}

/// Returns the address of `dns_name` to the pool.
///
/// A name without a record, or a store that doesn't exist, needs no write.
///
/// # Errors
///
/// Returns [`Error::ConflictRetriesExhausted`] when all `attempts` lost the
/// race. Other store errors are propagated.
pub async fn release_and_persist<S>(store: &S, dns_name: &str, attempts: u32) -> Result<()>
where
    S: RecordStore + ?Sized,
{
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        let (mut records, version) = match store.load().await {
            Ok(loaded) => loaded,
            Err(Error::NotFound(what)) => {
                tracing::debug!("{what} not found, no record to release for {dns_name}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !records.remove(dns_name) {
            return Ok(());
        }

        match store.store(&records, &version).await {
            Ok(()) => {
                tracing::info!("released address of {dns_name}");
                return Ok(());
            }
            Err(Error::Conflict) => {
                tracing::debug!(
                    "service records changed while releasing {dns_name} (attempt {attempt}/{attempts}), retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }

    tracing::warn!("giving up releasing {dns_name} after {attempts} conflicting writes");
    Err(Error::ConflictRetriesExhausted { attempts })
}

/// [`RecordStore`] backed by a `ConfigMap` in the operator namespace.
///
/// The document is kept as binary data under [`RECORDS_KEY`]. Writes carry
/// the `resourceVersion` that was read, so the API server rejects them with
/// `409 Conflict` if the `ConfigMap` changed in the meantime.
#[derive(Clone)]
pub struct ConfigMapRecordStore {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapRecordStore {
    /// Creates a store over the [`RECORDS_CONFIGMAP_NAME`] `ConfigMap` in
    /// `namespace`.
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: RECORDS_CONFIGMAP_NAME.to_string(),
        }
    }

    /// Uses a differently named `ConfigMap`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl RecordStore for ConfigMapRecordStore {
    async fn load(&self) -> Result<(Records, StoreVersion)> {
        let cm = match self.api.get(&self.name).await {
            Ok(cm) => cm,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::NotFound(format!(
                    "ConfigMap {}/{}",
                    self.namespace, self.name
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let records = match cm.binary_data.as_ref().and_then(|d| d.get(RECORDS_KEY)) {
            Some(bytes) => Records::from_json(&bytes.0)?,
            None => Records::new(),
        };
        let version = StoreVersion::new(cm.metadata.resource_version.unwrap_or_default());

        Ok((records, version))
    }

    async fn store(&self, records: &Records, version: &StoreVersion) -> Result<()> {
        let mut binary_data = BTreeMap::new();
        binary_data.insert(RECORDS_KEY.to_string(), ByteString(records.to_json()?));

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": version.as_str() },
            "binaryData": binary_data,
        });

        match self
            .api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::Conflict),
            Err(e) => Err(e.into()),
        }
    }
}
