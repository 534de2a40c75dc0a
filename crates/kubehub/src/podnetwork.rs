//! `multinetwork.x-k8s.io/v1alpha1` PodNetwork.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::chrono::{TimeZone, Utc};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub const CONDITION_ACCEPTED: &str = "Accepted";
pub const CONDITION_READY: &str = "Ready";

/// A logical network on the cluster. Cluster-scoped.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "multinetwork.x-k8s.io",
    version = "v1alpha1",
    kind = "PodNetwork",
    plural = "podnetworks",
    shortname = "pnw",
    category = "network",
    status = "PodNetworkStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PodNetworkSpec {
    /// Administrative switch; a disabled network never reports Ready.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// DRA device class backing this network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class_name: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for PodNetworkSpec {
    fn default() -> Self {
        Self { enabled: true, device_class_name: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodNetworkStatus {
    /// Keyed by `type`; at most one entry per condition type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PodNetworkStatus {
    /// Status a network carries before its controller has looked at it.
    pub fn pending() -> Self {
        Self {
            conditions: vec![Condition {
                type_: CONDITION_ACCEPTED.to_string(),
                status: "Unknown".to_string(),
                reason: "Pending".to_string(),
                message: "Waiting for controller".to_string(),
                last_transition_time: Time(Utc.timestamp_opt(0, 0).single().unwrap_or_default()),
                observed_generation: None,
            }],
        }
    }
}

impl PodNetwork {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status.as_ref()?.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Status of the `Ready` condition (`True`/`False`/`Unknown`), if reported.
    pub fn ready(&self) -> Option<&str> {
        self.condition(CONDITION_READY).map(|c| c.status.as_str())
    }
}

impl tern_core::Resource for PodNetwork {
    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.labels.as_ref()
    }
}
