//! Status conditions with Kubernetes transition semantics.
//!
//! Conditions are keyed by [`ConditionType`]; a list never holds two entries
//! of the same type. `lastTransitionTime` only moves when a condition's
//! status actually changes, so repeated reconciles of a steady resource
//! leave it alone.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a condition.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The controller can't tell.
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// The aspects of a `Service` this controller reports on.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// The tailnet proxy for the service is up to date.
    #[serde(rename = "TailscaleProxyReady")]
    ProxyReady,
    /// The service has an address in the service records.
    #[serde(rename = "TailscaleRecordReady")]
    RecordReady,
}

impl ConditionType {
    /// The name under which the condition is stored on the resource.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProxyReady => "TailscaleProxyReady",
            Self::RecordReady => "TailscaleRecordReady",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single status condition, in the `metav1.Condition` wire format.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Which aspect this condition describes.
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Whether the condition holds.
    pub status: ConditionStatus,

    /// Machine-readable reason for the last update.
    pub reason: String,

    /// Human-readable message.
    pub message: String,

    /// Resource generation the condition was computed from.
    #[serde(default)]
    pub observed_generation: i64,

    /// When `status` last changed.
    pub last_transition_time: DateTime<Utc>,
}

/// A resource that carries a condition list and a generation.
pub trait ConditionedResource {
    /// The resource's conditions.
    fn conditions(&self) -> &[Condition];

    /// Mutable access to the resource's conditions.
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// The resource's current `metadata.generation`.
    fn generation(&self) -> i64;
}

/// Finds the condition of the given type.
#[must_use]
pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Ensures `conditions` holds a condition of `type_` with the given
/// attributes.
///
/// A new entry, or an entry whose status changes, gets `now` as its
/// transition time. An entry whose status is unchanged keeps its old
/// transition time and only has its reason, message and observed
/// generation refreshed.
pub fn upsert(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    observed_generation: i64,
    now: DateTime<Utc>,
) {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) else {
        conditions.push(Condition {
            type_,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
            last_transition_time: now,
        });
        return;
    };

    if existing.status != status {
        tracing::info!(
            "status change for condition {type_} from {} to {status}",
            existing.status
        );
        existing.status = status;
        existing.last_transition_time = now;
    }

    existing.reason = reason.to_string();
    existing.message = message.to_string();
    existing.observed_generation = observed_generation;
}

/// Sets a condition on `resource`, observing its current generation.
pub fn set_condition<R: ConditionedResource>(
    resource: &mut R,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let generation = resource.generation();
    upsert(
        resource.conditions_mut(),
        type_,
        status,
        reason,
        message,
        generation,
        now,
    );
}

/// Removes the condition of the given type, if any.
pub fn remove(conditions: &mut Vec<Condition>, type_: ConditionType) {
    conditions.retain(|c| c.type_ != type_);
}

/// Reports whether the condition of `type_` is `True` and was computed from
/// `current_generation`.
///
/// A missing or stale condition is simply not ready.
#[must_use]
pub fn is_ready(conditions: &[Condition], type_: ConditionType, current_generation: i64) -> bool {
    find(conditions, type_).is_some_and(|c| {
        c.status == ConditionStatus::True && c.observed_generation == current_generation
    })
}
