// Copyright 2025 Smart Scheduler Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::strategy::AffinityKind;
use crate::types;
use crate::types::error::NoNamespaceSnafu;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{CustomResource, KubeSchema, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::OptionExt;
use std::collections::BTreeMap;

/// A structured placement policy applied to every workload matching its
/// selector. The policy translator renders it into the compact strategy
/// annotation consumed by the admission webhook.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, KubeSchema)]
#[kube(
    group = "smart-scheduler.io",
    version = "v1alpha1",
    kind = "PodPlacementPolicy",
    namespaced,
    status = "crate::types::v1alpha1::policy::PodPlacementPolicyStatus",
    shortname = "ppp",
    plural = "podplacementpolicies",
    singular = "podplacementpolicy",
    printcolumn = r#"{"name":"Enabled", "type":"boolean", "jsonPath":".spec.enabled"}"#,
    printcolumn = r#"{"name":"Priority", "type":"integer", "jsonPath":".spec.priority"}"#,
    printcolumn = r#"{"name":"Avg Drift", "type":"number", "jsonPath":".status.statistics.averageDrift"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    crates(serde_json = "k8s_openapi::serde_json")
)]
#[serde(rename_all = "camelCase")]
pub struct PodPlacementPolicySpec {
    /// Selects the workloads this policy applies to, within its namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<metav1::LabelSelector>,

    pub strategy: StrategySpec,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Precedence when multiple policies match the same workload.
    #[serde(default)]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StrategySpec {
    /// Pods guaranteed to the first rule before weighting applies.
    #[serde(default)]
    pub base: u32,

    pub rules: Vec<RuleSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebalance_policy: Option<RebalancePolicySpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(default)]
    pub weight: u32,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affinity: Vec<AffinityRuleSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AffinityRuleSpec {
    #[serde(rename = "type")]
    pub kind: AffinityKind,

    pub label_selector: BTreeMap<String, String>,

    pub topology_key: String,

    /// Hard vs soft constraint; defaults to preferred (soft).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_during_scheduling: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RebalancePolicySpec {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Drift percentage that triggers rebalancing. Default 20.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_threshold: Option<f64>,

    /// How often to check for drift, e.g. "10m". Default 10m.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval: Option<String>,

    /// Deletion budget per reconcile pass. Default 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods_per_rebalance: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebalance_window: Option<TimeWindowSpec>,
}

/// Weekly recurring wall-clock window during which deletion-driven
/// rebalancing is permitted.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindowSpec {
    /// Inclusive start in "HH:MM" (24h).
    pub start_time: String,

    /// Exclusive end in "HH:MM" (24h).
    pub end_time: String,

    /// Weekdays the window is active on (Mon..Sun); empty means every day.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<String>,

    /// IANA timezone name; defaults to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodPlacementPolicyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_workloads: Vec<WorkloadReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<PolicyStatistics>,

    #[serde(default)]
    pub observed_generation: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    pub name: String,
    pub namespace: String,

    #[serde(default)]
    pub current_drift: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<metav1::Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatistics {
    #[serde(default)]
    pub total_pods_managed: u32,

    #[serde(default)]
    pub average_drift: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<metav1::Time>,
}

impl PodPlacementPolicy {
    pub fn namespace(&self) -> Result<String, types::error::Error> {
        ResourceExt::namespace(self).context(NoNamespaceSnafu)
    }

    pub fn name(&self) -> String {
        ResourceExt::name_any(self)
    }
}
