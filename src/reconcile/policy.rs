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

//! The policy translator: renders each `PodPlacementPolicy` into the compact
//! strategy annotation on every matching workload, resolving priority
//! conflicts, and reports matched workloads and drift in the policy status.

use crate::annotations;
use crate::context::Context;
use crate::reconcile::Error;
use crate::reconcile::rebalance::{DEFAULT_DRIFT_THRESHOLD, DriftReport};
use crate::state::{self, Clock, PodLister, WorkloadRef};
use crate::strategy::PlacementStrategy;
use crate::types::v1alpha1::policy::{
    PodPlacementPolicy, PodPlacementPolicyStatus, PolicyStatistics, WorkloadReference,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::ResourceExt;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const REQUEUE_STATUS: Duration = Duration::from_secs(600);
const REQUEUE_DEGRADED: Duration = Duration::from_secs(120);

pub struct PolicyContext {
    pub ctx: Arc<Context>,
    pub pods: Arc<dyn PodLister>,
    pub clock: Arc<dyn Clock>,
    /// Namespaces in scope; empty means all.
    pub namespaces: Vec<String>,
}

pub async fn reconcile_policy(
    policy: Arc<PodPlacementPolicy>,
    pctx: Arc<PolicyContext>,
) -> Result<Action, Error> {
    let namespace = policy.namespace()?;
    if !pctx.namespaces.is_empty() && !pctx.namespaces.contains(&namespace) {
        return Ok(Action::await_change());
    }

    let name = policy.name();
    let Some(latest) = pctx
        .ctx
        .get_opt::<PodPlacementPolicy>(&name, &namespace)
        .await?
    else {
        info!(policy = %name, %namespace, "policy gone, erasing derived annotations");
        cleanup_policy_annotations(&pctx.ctx, &namespace, &name).await?;
        return Ok(Action::await_change());
    };

    if latest.metadata.deletion_timestamp.is_some() {
        cleanup_policy_annotations(&pctx.ctx, &namespace, &name).await?;
        return Ok(Action::await_change());
    }

    if !latest.spec.enabled {
        info!(policy = %name, "policy disabled");
        let status = ready_status(&latest, Vec::new(), None, pctx.clock.now(), "PolicyDisabled");
        update_status(&pctx.ctx, &latest, status).await;
        return Ok(Action::requeue(REQUEUE_STATUS));
    }

    let strategy = match PlacementStrategy::try_from(&latest.spec.strategy) {
        Ok(strategy) => strategy,
        Err(parse_error) => {
            warn!(policy = %name, error = %parse_error, "invalid strategy, not writing annotations");
            let status = failed_status(&latest, pctx.clock.now(), "InvalidStrategy", &parse_error.to_string());
            update_status(&pctx.ctx, &latest, status).await;
            return Ok(Action::requeue(REQUEUE_STATUS));
        }
    };

    let selector = match latest.spec.selector.as_ref().map(selector_string).transpose() {
        Ok(selector) => selector,
        Err(message) => {
            warn!(policy = %name, error = %message, "invalid selector, not writing annotations");
            let status = failed_status(&latest, pctx.clock.now(), "InvalidSelector", &message);
            update_status(&pctx.ctx, &latest, status).await;
            return Ok(Action::requeue(REQUEUE_STATUS));
        }
    };

    let workloads = match &selector {
        Some(selector) => {
            pctx.ctx
                .list::<appsv1::Deployment>(&namespace, &ListParams::default().labels(selector))
                .await?
                .items
        }
        // A policy without a selector matches nothing.
        None => Vec::new(),
    };

    info!(policy = %name, matched = workloads.len(), "processing placement policy");

    let annotation = strategy.emit();
    let mut references = Vec::new();
    let mut total_pods = 0u32;
    let mut drift_sum = 0.0;

    for workload in &workloads {
        if has_higher_priority(workload, latest.spec.priority) {
            info!(
                policy = %name,
                workload = %workload.name_any(),
                "workload holds a higher priority policy, skipping"
            );
            continue;
        }

        let now = pctx.clock.now();
        if let Err(apply_error) =
            apply_annotations(&pctx.ctx, workload, &namespace, &latest, &annotation, now).await
        {
            warn!(
                policy = %name,
                workload = %workload.name_any(),
                error = %apply_error,
                "failed to annotate workload"
            );
            continue;
        }

        let (current_drift, live_total) =
            workload_drift(&pctx, workload, &strategy, now).await;
        total_pods += live_total;
        drift_sum += current_drift;

        references.push(WorkloadReference {
            name: workload.name_any(),
            namespace: namespace.clone(),
            current_drift,
            last_applied: Some(metav1::Time(now)),
        });
    }

    let statistics = PolicyStatistics {
        total_pods_managed: total_pods,
        average_drift: if references.is_empty() {
            0.0
        } else {
            drift_sum / references.len() as f64
        },
        last_updated: Some(metav1::Time(pctx.clock.now())),
    };

    let status = ready_status(
        &latest,
        references,
        Some(statistics),
        pctx.clock.now(),
        "PolicyApplied",
    );
    update_status(&pctx.ctx, &latest, status).await;

    Ok(Action::requeue(REQUEUE_STATUS))
}

pub fn error_policy(
    _policy: Arc<PodPlacementPolicy>,
    error: &Error,
    _pctx: Arc<PolicyContext>,
) -> Action {
    if let Error::Context { source } = error
        && source.is_not_found()
    {
        return Action::await_change();
    }

    error!("{:?}", error);
    Action::requeue(REQUEUE_DEGRADED)
}

async fn apply_annotations(
    ctx: &Context,
    workload: &appsv1::Deployment,
    namespace: &str,
    policy: &PodPlacementPolicy,
    annotation: &str,
    now: DateTime<Utc>,
) -> Result<(), crate::context::Error> {
    let mut derived = serde_json::Map::new();
    derived.insert(
        annotations::SCHEDULE_STRATEGY.to_owned(),
        Value::String(annotation.to_owned()),
    );
    derived.insert(annotations::POLICY_NAME.to_owned(), Value::String(policy.name()));
    derived.insert(
        annotations::POLICY_PRIORITY.to_owned(),
        Value::String(policy.spec.priority.to_string()),
    );
    derived.insert(
        annotations::POLICY_APPLIED.to_owned(),
        Value::String(now.to_rfc3339()),
    );
    let patch = json!({ "metadata": { "annotations": Value::Object(derived) } });

    ctx.merge_patch::<appsv1::Deployment>(&workload.name_any(), namespace, &patch)
        .await?;
    Ok(())
}

async fn workload_drift(
    pctx: &PolicyContext,
    workload: &appsv1::Deployment,
    strategy: &PlacementStrategy,
    now: DateTime<Utc>,
) -> (f64, u32) {
    let Ok(workload_ref) = WorkloadRef::from_deployment(workload) else {
        return (0.0, 0);
    };

    match pctx
        .pods
        .list_pods(&workload_ref.namespace, &workload_ref.selector)
        .await
    {
        Ok(pods) => {
            let live = state::bucket_pods(&pods, strategy);
            let report = DriftReport::compute(strategy, &live, DEFAULT_DRIFT_THRESHOLD, now);
            (report.drift_percentage, live.live_total)
        }
        Err(list_error) => {
            warn!(workload = %workload_ref.name, error = %list_error, "drift computation failed");
            (0.0, 0)
        }
    }
}

/// Annotation cleanup after policy deletion: every workload carrying this
/// policy's name loses the derived annotations.
async fn cleanup_policy_annotations(
    ctx: &Context,
    namespace: &str,
    policy_name: &str,
) -> Result<(), Error> {
    let workloads = ctx
        .list::<appsv1::Deployment>(namespace, &ListParams::default())
        .await?;

    for workload in workloads {
        let applied = workload
            .annotations()
            .get(annotations::POLICY_NAME)
            .is_some_and(|name| name == policy_name);
        if !applied {
            continue;
        }

        let mut erase = serde_json::Map::new();
        for key in [
            annotations::SCHEDULE_STRATEGY,
            annotations::POLICY_NAME,
            annotations::POLICY_PRIORITY,
            annotations::POLICY_APPLIED,
        ] {
            erase.insert(key.to_owned(), Value::Null);
        }
        let patch = json!({ "metadata": { "annotations": Value::Object(erase) } });

        match ctx
            .merge_patch::<appsv1::Deployment>(&workload.name_any(), namespace, &patch)
            .await
        {
            Ok(_) => info!(workload = %workload.name_any(), "erased policy annotations"),
            Err(patch_error) => warn!(
                workload = %workload.name_any(),
                error = %patch_error,
                "failed to erase policy annotations"
            ),
        }
    }

    Ok(())
}

/// Apply only when the incumbent priority annotation does not exceed ours.
pub(crate) fn has_higher_priority(workload: &appsv1::Deployment, priority: i32) -> bool {
    workload
        .annotations()
        .get(annotations::POLICY_PRIORITY)
        .and_then(|value| value.parse::<i32>().ok())
        .is_some_and(|incumbent| incumbent > priority)
}

/// Render a label selector into the string form the list API takes.
pub(crate) fn selector_string(selector: &metav1::LabelSelector) -> Result<String, String> {
    let mut parts = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            parts.push(format!("{key}={value}"));
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let values = expression.values.clone().unwrap_or_default();
            match expression.operator.as_str() {
                "In" => parts.push(format!("{} in ({})", expression.key, values.join(","))),
                "NotIn" => parts.push(format!("{} notin ({})", expression.key, values.join(","))),
                "Exists" => parts.push(expression.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", expression.key)),
                other => return Err(format!("unsupported selector operator '{other}'")),
            }
        }
    }

    if parts.is_empty() {
        return Err("selector matches nothing".to_owned());
    }

    Ok(parts.join(","))
}

fn ready_status(
    policy: &PodPlacementPolicy,
    matched_workloads: Vec<WorkloadReference>,
    statistics: Option<PolicyStatistics>,
    now: DateTime<Utc>,
    reason: &str,
) -> PodPlacementPolicyStatus {
    let message = format!("Policy applied to {} workloads", matched_workloads.len());
    PodPlacementPolicyStatus {
        conditions: vec![condition(policy, "True", reason, &message, now)],
        matched_workloads,
        statistics,
        observed_generation: policy.metadata.generation.unwrap_or_default(),
    }
}

fn failed_status(
    policy: &PodPlacementPolicy,
    now: DateTime<Utc>,
    reason: &str,
    message: &str,
) -> PodPlacementPolicyStatus {
    PodPlacementPolicyStatus {
        conditions: vec![condition(policy, "False", reason, message, now)],
        matched_workloads: Vec::new(),
        statistics: None,
        observed_generation: policy.metadata.generation.unwrap_or_default(),
    }
}

fn condition(
    policy: &PodPlacementPolicy,
    status: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> metav1::Condition {
    metav1::Condition {
        type_: "Ready".to_owned(),
        status: status.to_owned(),
        reason: reason.to_owned(),
        message: message.to_owned(),
        last_transition_time: metav1::Time(now),
        observed_generation: policy.metadata.generation,
    }
}

async fn update_status(
    ctx: &Context,
    policy: &PodPlacementPolicy,
    status: PodPlacementPolicyStatus,
) {
    if let Err(status_error) = ctx.update_policy_status(policy, status).await {
        warn!(policy = %policy.name(), error = %status_error, "failed to update policy status");
    }
}
