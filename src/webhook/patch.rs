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

//! Pod mutation: applying a placement rule, and computing the JSON patch
//! between the pre- and post-mutation pod.

use crate::strategy::{AffinityKind, AffinityRule, PlacementRule};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Default weight for preferred (soft) affinity terms.
const PREFERRED_TERM_WEIGHT: i32 = 100;

/// Merge the rule's node selector and affinity terms into the pod.
/// Selector keys already set by the caller win over the rule's values.
pub fn apply_rule(pod: &mut corev1::Pod, rule: &PlacementRule) {
    let spec = pod.spec.get_or_insert_with(Default::default);

    if !rule.node_selector.is_empty() {
        let selector = spec.node_selector.get_or_insert_with(BTreeMap::new);
        for (key, value) in &rule.node_selector {
            selector.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    for affinity in &rule.affinity {
        apply_affinity_term(spec, affinity);
    }
}

fn apply_affinity_term(spec: &mut corev1::PodSpec, rule: &AffinityRule) {
    let term = corev1::PodAffinityTerm {
        label_selector: Some(metav1::LabelSelector {
            match_labels: Some(rule.label_selector.clone()),
            ..Default::default()
        }),
        topology_key: rule.topology_key.clone(),
        ..Default::default()
    };

    let affinity = spec.affinity.get_or_insert_with(Default::default);

    match rule.kind {
        AffinityKind::Affinity => {
            let block = affinity.pod_affinity.get_or_insert_with(Default::default);
            if rule.required {
                block
                    .required_during_scheduling_ignored_during_execution
                    .get_or_insert_with(Vec::new)
                    .push(term);
            } else {
                block
                    .preferred_during_scheduling_ignored_during_execution
                    .get_or_insert_with(Vec::new)
                    .push(corev1::WeightedPodAffinityTerm {
                        weight: PREFERRED_TERM_WEIGHT,
                        pod_affinity_term: term,
                    });
            }
        }
        AffinityKind::AntiAffinity => {
            let block = affinity.pod_anti_affinity.get_or_insert_with(Default::default);
            if rule.required {
                block
                    .required_during_scheduling_ignored_during_execution
                    .get_or_insert_with(Vec::new)
                    .push(term);
            } else {
                block
                    .preferred_during_scheduling_ignored_during_execution
                    .get_or_insert_with(Vec::new)
                    .push(corev1::WeightedPodAffinityTerm {
                        weight: PREFERRED_TERM_WEIGHT,
                        pod_affinity_term: term,
                    });
            }
        }
    }
}

/// JSON patch from the original to the modified pod, covering the node
/// selector, the affinity block, and the annotations.
pub fn diff(
    original: &corev1::Pod,
    modified: &corev1::Pod,
) -> Result<json_patch::Patch, serde_json::Error> {
    let mut operations = Vec::new();

    let original_selector = original.spec.as_ref().and_then(|s| s.node_selector.as_ref());
    let modified_selector = modified.spec.as_ref().and_then(|s| s.node_selector.as_ref());
    push_field_ops(
        &mut operations,
        "/spec/nodeSelector",
        original_selector,
        modified_selector,
    )?;

    let original_affinity = original.spec.as_ref().and_then(|s| s.affinity.as_ref());
    let modified_affinity = modified.spec.as_ref().and_then(|s| s.affinity.as_ref());
    push_field_ops(
        &mut operations,
        "/spec/affinity",
        original_affinity,
        modified_affinity,
    )?;

    push_field_ops(
        &mut operations,
        "/metadata/annotations",
        original.metadata.annotations.as_ref(),
        modified.metadata.annotations.as_ref(),
    )?;

    serde_json::from_value(Value::Array(operations))
}

fn push_field_ops<T: PartialEq + serde::Serialize>(
    operations: &mut Vec<Value>,
    path: &str,
    original: Option<&T>,
    modified: Option<&T>,
) -> Result<(), serde_json::Error> {
    if original == modified {
        return Ok(());
    }

    match modified {
        Some(value) => {
            let op = if original.is_some() { "replace" } else { "add" };
            operations.push(json!({
                "op": op,
                "path": path,
                "value": serde_json::to_value(value)?,
            }));
        }
        None => {
            operations.push(json!({ "op": "remove", "path": path }));
        }
    }

    Ok(())
}
