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

//! Drift detection and gradual rebalance.
//!
//! Each pass compares the declared distribution against the live one and,
//! past the threshold, deletes a bounded number of over-allocated pods so
//! the workload controller reschedules them through the admission path.

use crate::annotations;
use crate::context::{self, Context};
use crate::placement;
use crate::reconcile::Error;
use crate::state::{self, Clock, LiveCounts, PodLister, StateStore, WorkloadRef};
use crate::stats::Stats;
use crate::strategy::{self, PlacementStrategy};
use crate::types::error::NoNamespaceSnafu;
use crate::types::v1alpha1::policy::{PodPlacementPolicy, TimeWindowSpec};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_DRIFT_THRESHOLD: f64 = 20.0;
pub const DEFAULT_MAX_PODS_PER_REBALANCE: u32 = 1;

/// Steady-state requeue cadence.
const REQUEUE_IDLE: Duration = Duration::from_secs(600);
/// Requeue after a deletion, to watch the rebalance converge.
const REQUEUE_ACTIVE: Duration = Duration::from_secs(120);
/// Requeue after a rebalance pass that deleted nothing.
const REQUEUE_SETTLED: Duration = Duration::from_secs(300);
/// Requeue on transient read failures.
const REQUEUE_DEGRADED: Duration = Duration::from_secs(120);
/// Requeue when the annotation cannot be parsed.
const REQUEUE_INVALID: Duration = Duration::from_secs(300);

/// Event publication seam; the production impl records Kubernetes events.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn publish(
        &self,
        workload: &appsv1::Deployment,
        reason: &str,
        note: &str,
    ) -> Result<(), context::Error>;
}

/// Publishes events under the `smart-scheduler-rebalancer` component.
pub struct RecorderEmitter {
    recorder: Recorder,
}

impl RecorderEmitter {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "smart-scheduler-rebalancer".into(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self { recorder: Recorder::new(client, reporter) }
    }
}

#[async_trait]
impl EventEmitter for RecorderEmitter {
    async fn publish(
        &self,
        workload: &appsv1::Deployment,
        reason: &str,
        note: &str,
    ) -> Result<(), context::Error> {
        self.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.to_owned(),
                    note: Some(note.to_owned()),
                    action: "Rebalance".into(),
                    secondary: None,
                },
                &kube::Resource::object_ref(workload, &()),
            )
            .await
            .context(context::RecordSnafu)
    }
}

pub struct RebalanceContext {
    pub ctx: Arc<Context>,
    pub store: StateStore,
    pub pods: Arc<dyn PodLister>,
    pub emitter: Arc<dyn EventEmitter>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<Stats>,
    /// Namespaces in scope; empty means all.
    pub namespaces: Vec<String>,
}

/// Expected-vs-actual distribution for one workload at one point in time.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub expected: BTreeMap<String, u32>,
    pub actual: BTreeMap<String, u32>,
    pub drift_percentage: f64,
    pub requires_rebalance: bool,
    pub timestamp: DateTime<Utc>,
}

impl DriftReport {
    pub fn compute(
        strategy: &PlacementStrategy,
        live: &LiveCounts,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Self {
        // Pods matching no rule still push the expected distribution up;
        // they simply contribute to no actual bucket.
        let expected = placement::expected_distribution(strategy, live.live_total);
        let actual = live.per_rule.clone();

        let mut total_drift = 0u64;
        let mut total_expected = 0u64;
        for (group, expected_count) in &expected {
            let actual_count = actual.get(group).copied().unwrap_or(0);
            total_drift += u64::from(expected_count.abs_diff(actual_count));
            total_expected += u64::from(*expected_count);
        }

        let drift_percentage = if total_expected > 0 {
            total_drift as f64 / total_expected as f64 * 100.0
        } else {
            0.0
        };

        DriftReport {
            expected,
            actual,
            drift_percentage,
            requires_rebalance: drift_percentage > threshold,
            timestamp: now,
        }
    }
}

/// Effective rebalance settings for one workload: policy-supplied when the
/// workload carries provenance annotations, defaults otherwise.
#[derive(Clone, Debug)]
pub struct RebalanceSettings {
    pub enabled: bool,
    pub threshold: f64,
    pub max_pods: u32,
    pub check_interval: Duration,
    pub window: Option<TimeWindowSpec>,
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_DRIFT_THRESHOLD,
            max_pods: DEFAULT_MAX_PODS_PER_REBALANCE,
            check_interval: REQUEUE_IDLE,
            window: None,
        }
    }
}

impl RebalanceSettings {
    pub fn from_policy(policy: &PodPlacementPolicy) -> Self {
        let mut settings = Self::default();
        let Some(rebalance) = &policy.spec.strategy.rebalance_policy else {
            return settings;
        };

        settings.enabled = rebalance.enabled;
        if let Some(threshold) = rebalance.drift_threshold {
            settings.threshold = threshold;
        }
        if let Some(max_pods) = rebalance.max_pods_per_rebalance {
            settings.max_pods = max_pods;
        }
        if let Some(interval) = rebalance
            .check_interval
            .as_deref()
            .and_then(parse_duration)
        {
            settings.check_interval = interval;
        }
        settings.window = rebalance.rebalance_window.clone();
        settings
    }
}

/// Parse a Go-style duration like "10m", "90s" or "1h30m".
pub(crate) fn parse_duration(input: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut digits = String::new();

    for ch in input.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }

        let value: u64 = digits.parse().ok()?;
        digits.clear();
        total += match ch {
            's' => Duration::from_secs(value),
            'm' => Duration::from_secs(value * 60),
            'h' => Duration::from_secs(value * 3600),
            _ => return None,
        };
    }

    if !digits.is_empty() || total == Duration::ZERO {
        return None;
    }
    Some(total)
}

/// True when `now`, in the window's timezone, falls on a listed weekday
/// within [start, end). Unparseable windows disable deletions.
pub fn window_permits(window: &TimeWindowSpec, now: DateTime<Utc>) -> bool {
    let timezone = window.timezone.as_deref().unwrap_or("UTC");
    let Ok(tz) = timezone.parse::<chrono_tz::Tz>() else {
        warn!(timezone, "invalid rebalance window timezone, deletions stay disabled");
        return false;
    };

    let local = now.with_timezone(&tz);

    if !window.days.is_empty()
        && !window.days.iter().any(|day| weekday_matches(day, local.weekday()))
    {
        return false;
    }

    let (Ok(start), Ok(end)) = (
        NaiveTime::parse_from_str(&window.start_time, "%H:%M"),
        NaiveTime::parse_from_str(&window.end_time, "%H:%M"),
    ) else {
        warn!(
            start = %window.start_time,
            end = %window.end_time,
            "invalid rebalance window times, deletions stay disabled"
        );
        return false;
    };

    let time = local.time();
    if start <= end {
        time >= start && time < end
    } else {
        // Window wraps midnight.
        time >= start || time < end
    }
}

fn weekday_matches(name: &str, weekday: Weekday) -> bool {
    let name = name.to_ascii_lowercase();
    let short = match weekday {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    };
    name.starts_with(short) || (short == "tue" && name.starts_with("tues"))
}

/// Pods to delete to reduce drift: the excess of every over-allocated
/// group, newest pods first.
pub fn select_victims<'a>(
    pods: &'a [corev1::Pod],
    strategy: &PlacementStrategy,
    report: &DriftReport,
) -> Vec<&'a corev1::Pod> {
    let mut by_group: BTreeMap<String, Vec<&corev1::Pod>> = BTreeMap::new();

    for pod in pods {
        if !state::pod_is_live(pod) {
            continue;
        }

        let empty = BTreeMap::new();
        let pod_selector = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_selector.as_ref())
            .unwrap_or(&empty);

        for rule in &strategy.rules {
            if strategy::selector_is_subset(&rule.node_selector, pod_selector) {
                by_group.entry(rule.group_key()).or_default().push(pod);
                break;
            }
        }
    }

    let mut victims = Vec::new();
    for (group, actual) in &report.actual {
        let expected = report.expected.get(group).copied().unwrap_or(0);
        if *actual <= expected {
            continue;
        }

        let mut group_pods = by_group.remove(group).unwrap_or_default();
        // Newest first, for the least operational disruption.
        group_pods.sort_by(|a, b| {
            b.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .cmp(&a.metadata.creation_timestamp.as_ref().map(|t| t.0))
        });
        victims.extend(group_pods.into_iter().take((*actual - expected) as usize));
    }

    victims
}

pub async fn reconcile_rebalance(
    workload: Arc<appsv1::Deployment>,
    rctx: Arc<RebalanceContext>,
) -> Result<Action, Error> {
    let namespace = workload.namespace().context(NoNamespaceSnafu)?;
    if !rctx.namespaces.is_empty() && !rctx.namespaces.contains(&namespace) {
        return Ok(Action::await_change());
    }

    let name = workload.name_any();
    let Some(latest) = rctx
        .ctx
        .get_opt::<appsv1::Deployment>(&name, &namespace)
        .await?
    else {
        info!(workload = %name, %namespace, "workload gone, cleaning up placement state");
        rctx.stats.clear_drift(&format!("{namespace}/{name}"));
        if let Err(error) = rctx.store.cleanup(&namespace).await {
            warn!(%namespace, %error, "placement state cleanup failed");
        }
        return Ok(Action::await_change());
    };

    let Some(raw_strategy) = latest.annotations().get(annotations::SCHEDULE_STRATEGY) else {
        return Ok(Action::await_change());
    };

    let strategy = match strategy::parse(raw_strategy) {
        Ok(strategy) => strategy,
        Err(error) => {
            warn!(workload = %name, %error, "unparseable strategy annotation, skipping rebalance");
            return Ok(Action::requeue(REQUEUE_INVALID));
        }
    };

    let settings = rebalance_settings(&rctx, &latest, &namespace).await;
    let workload_ref = WorkloadRef::from_deployment(&latest)?;

    // Keeps the persisted record synthesized and ground-truth aligned.
    if let Err(error) = rctx.store.read(&workload_ref, &strategy).await {
        warn!(workload = %name, %error, "placement state read failed");
        return Ok(Action::requeue(REQUEUE_DEGRADED));
    }

    let pods = match rctx.pods.list_pods(&namespace, &workload_ref.selector).await {
        Ok(pods) => pods,
        Err(error) => {
            warn!(workload = %name, %error, "pod listing failed");
            return Ok(Action::requeue(REQUEUE_DEGRADED));
        }
    };

    let live = state::bucket_pods(&pods, &strategy);
    let report = DriftReport::compute(&strategy, &live, settings.threshold, rctx.clock.now());
    rctx.stats
        .set_drift(&format!("{namespace}/{name}"), report.drift_percentage);

    info!(
        workload = %name,
        drift_percentage = report.drift_percentage,
        requires_rebalance = report.requires_rebalance,
        "drift analysis complete"
    );

    if !report.requires_rebalance || !settings.enabled {
        return Ok(Action::requeue(settings.check_interval));
    }

    if let Some(window) = &settings.window
        && !window_permits(window, rctx.clock.now())
    {
        info!(workload = %name, "drift above threshold but outside the rebalance window");
        return Ok(Action::requeue(settings.check_interval));
    }

    let victims = select_victims(&pods, &strategy, &report);

    let mut attempted = 0u32;
    let mut deleted = 0u32;
    for pod in victims {
        if attempted >= settings.max_pods {
            break;
        }
        attempted += 1;

        let pod_name = pod.name_any();
        info!(workload = %name, pod = %pod_name, "deleting pod for rebalancing");

        if let Err(error) = rctx.ctx.delete::<corev1::Pod>(&pod_name, &namespace).await {
            warn!(pod = %pod_name, %error, "failed to delete pod for rebalancing");
            continue;
        }
        deleted += 1;
        rctx.stats.count_deletion();

        let note = format!(
            "Pod {pod_name} deleted for placement rebalancing, drift: {:.1}%",
            report.drift_percentage
        );
        if let Err(error) = rctx.emitter.publish(&latest, "PodDeleted", &note).await {
            warn!(pod = %pod_name, %error, "failed to record rebalance event");
        }
    }

    if deleted > 0 {
        info!(workload = %name, deleted, "rebalancing in progress");
        Ok(Action::requeue(REQUEUE_ACTIVE))
    } else {
        Ok(Action::requeue(REQUEUE_SETTLED))
    }
}

async fn rebalance_settings(
    rctx: &RebalanceContext,
    workload: &appsv1::Deployment,
    namespace: &str,
) -> RebalanceSettings {
    let Some(policy_name) = workload.annotations().get(annotations::POLICY_NAME) else {
        return RebalanceSettings::default();
    };

    match rctx
        .ctx
        .get_opt::<PodPlacementPolicy>(policy_name, namespace)
        .await
    {
        Ok(Some(policy)) => RebalanceSettings::from_policy(&policy),
        Ok(None) => RebalanceSettings::default(),
        Err(error) => {
            warn!(policy = %policy_name, %error, "failed to fetch rebalance policy, using defaults");
            RebalanceSettings::default()
        }
    }
}

pub fn error_policy(
    _workload: Arc<appsv1::Deployment>,
    error: &Error,
    _rctx: Arc<RebalanceContext>,
) -> Action {
    if let Error::Context { source } = error
        && source.is_not_found()
    {
        return Action::await_change();
    }

    error!("{:?}", error);
    Action::requeue(Duration::from_secs(5))
}

/// Watch-boundary filter: only pods bearing the processed marker reach the
/// queue, mapped to their owning Deployment by trimming the ReplicaSet
/// pod-template-hash suffix.
pub fn map_pod_to_workload(pod: corev1::Pod) -> Option<ObjectRef<appsv1::Deployment>> {
    pod.annotations().get(annotations::PROCESSED)?;

    let owner = pod
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller == Some(true) && reference.kind == "ReplicaSet")?;
    let (deployment, _hash) = owner.name.rsplit_once('-')?;
    let namespace = pod.namespace()?;

    Some(ObjectRef::new(deployment).within(&namespace))
}
