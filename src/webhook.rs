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

//! The mutating pod admission webhook.
//!
//! Admission is fail-open without exception: no internal failure may deny a
//! pod the cluster would otherwise admit. Every error path degrades to an
//! unmodified allow or to a fallback-annotated allow.

use crate::annotations;
use crate::context;
use crate::placement;
use crate::state::{StateStore, StoreError, WorkloadRef};
use crate::stats::{AdmissionOutcome, Stats};
use crate::strategy;
use crate::types;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::ResourceExt;
use kube::api::Api;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use snafu::Snafu;
use snafu::futures::TryFutureExt as _;
use std::sync::Arc;
use tracing::{debug, warn};

pub mod patch;
pub mod server;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(transparent)]
    Store { source: StoreError },

    #[snafu(transparent)]
    Types { source: types::error::Error },

    #[snafu(display("failed to build admission patch: {}", source))]
    Diff { source: serde_json::Error },

    #[snafu(display("failed to serialize admission patch: {}", msg))]
    PatchSerialize { msg: String },
}

/// Owner-chain lookups for the admission path. Production reads through the
/// kube client; tests substitute an in-memory double.
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<appsv1::ReplicaSet>, context::Error>;

    async fn workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<appsv1::Deployment>, context::Error>;
}

pub struct ApiOwnerLookup {
    client: kube::Client,
}

impl ApiOwnerLookup {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OwnerLookup for ApiOwnerLookup {
    async fn replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<appsv1::ReplicaSet>, context::Error> {
        let api: Api<appsv1::ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).context(context::KubeSnafu).await
    }

    async fn workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<appsv1::Deployment>, context::Error> {
        let api: Api<appsv1::Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).context(context::KubeSnafu).await
    }
}

pub struct PodMutator {
    owners: Arc<dyn OwnerLookup>,
    store: StateStore,
    stats: Arc<Stats>,
}

impl PodMutator {
    pub fn new(owners: Arc<dyn OwnerLookup>, store: StateStore, stats: Arc<Stats>) -> Self {
        Self { owners, store, stats }
    }

    /// Handle one admission request. Never denies.
    pub async fn handle(&self, req: AdmissionRequest<corev1::Pod>) -> AdmissionResponse {
        let started = std::time::Instant::now();

        let (response, outcome) = match self.admit(&req).await {
            Ok(result) => result,
            Err(error) => {
                warn!(pod = %req.name, %error, "admission failed internally, allowing unmodified");
                (AdmissionResponse::from(&req), AdmissionOutcome::Passthrough)
            }
        };

        self.stats.count_admission(outcome);
        self.stats.observe_webhook_latency(started.elapsed());
        debug!(pod = %req.name, ?outcome, "admission handled");
        response
    }

    async fn admit(
        &self,
        req: &AdmissionRequest<corev1::Pod>,
    ) -> Result<(AdmissionResponse, AdmissionOutcome), Error> {
        let Some(pod) = req.object.as_ref() else {
            return Ok(passthrough(req));
        };

        // Loop prevention: a second pass over a processed pod is a no-op.
        if pod.annotations().contains_key(annotations::PROCESSED) {
            debug!(pod = %req.name, "pod already processed, skipping");
            return Ok(passthrough(req));
        }

        let Some(namespace) = req
            .namespace
            .clone()
            .or_else(|| pod.namespace())
        else {
            return Ok(passthrough(req));
        };

        let Some(owner) = controller_owner(&pod.metadata) else {
            debug!(pod = %req.name, "pod has no controller owner, skipping");
            return Ok(passthrough(req));
        };

        // Only the two-level pod -> ReplicaSet -> Deployment chain is
        // followed; other owner shapes admit unmodified.
        if owner.kind != "ReplicaSet" {
            return Ok(passthrough(req));
        }

        let workload = match self.resolve_workload(&namespace, &owner.name).await {
            Ok(Some(workload)) => workload,
            Ok(None) => return Ok(passthrough(req)),
            Err(error) => {
                warn!(pod = %req.name, %error, "owner chain lookup failed, allowing unmodified");
                return Ok(passthrough(req));
            }
        };

        mutate_for_workload(&self.store, req, pod, &workload).await
    }

    async fn resolve_workload(
        &self,
        namespace: &str,
        replica_set: &str,
    ) -> Result<Option<appsv1::Deployment>, Error> {
        let Some(rs) = self.owners.replica_set(namespace, replica_set).await? else {
            return Ok(None);
        };

        let Some(owner) = controller_owner(&rs.metadata) else {
            return Ok(None);
        };
        if owner.kind != "Deployment" {
            return Ok(None);
        }

        Ok(self.owners.workload(namespace, &owner.name).await?)
    }
}

fn passthrough(req: &AdmissionRequest<corev1::Pod>) -> (AdmissionResponse, AdmissionOutcome) {
    (AdmissionResponse::from(req), AdmissionOutcome::Passthrough)
}

fn controller_owner(metadata: &metav1::ObjectMeta) -> Option<&metav1::OwnerReference> {
    metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller == Some(true))
}

/// The mutation core, separated from the owner-chain I/O so it can run
/// against in-memory stores in tests.
pub(crate) async fn mutate_for_workload(
    store: &StateStore,
    req: &AdmissionRequest<corev1::Pod>,
    pod: &corev1::Pod,
    workload: &appsv1::Deployment,
) -> Result<(AdmissionResponse, AdmissionOutcome), Error> {
    let Some(raw_strategy) = workload.annotations().get(annotations::SCHEDULE_STRATEGY) else {
        debug!(workload = %workload.name_any(), "no strategy annotation, skipping");
        return Ok(passthrough(req));
    };

    let strategy = match strategy::parse(raw_strategy) {
        Ok(strategy) => strategy,
        Err(error) => {
            warn!(
                workload = %workload.name_any(),
                strategy = %raw_strategy,
                %error,
                "invalid strategy annotation, falling back to default scheduling"
            );
            return Ok((fallback_response(req, pod)?, AdmissionOutcome::Fallback));
        }
    };

    let workload_ref = WorkloadRef::from_deployment(workload)?;

    let (counts, degraded) = match store.read(&workload_ref, &strategy).await {
        Ok(state) => (state.pod_counts, false),
        Err(error) => {
            warn!(workload = %workload_ref.name, %error, "state read failed, degrading to live pod counts");
            match store.live_counts(&workload_ref, &strategy).await {
                Ok(live) => (live.per_rule, true),
                Err(error) => {
                    warn!(workload = %workload_ref.name, %error, "live pod count failed, allowing unmodified");
                    return Ok(passthrough(req));
                }
            }
        }
    };

    let rule = match placement::select_rule(&strategy, &counts) {
        Ok(rule) => rule,
        Err(error) => {
            warn!(workload = %workload_ref.name, %error, "strategy not applicable, falling back");
            return Ok((fallback_response(req, pod)?, AdmissionOutcome::Fallback));
        }
    };
    let group_key = rule.group_key();

    let mut modified = pod.clone();
    patch::apply_rule(&mut modified, rule);

    let pod_annotations = modified.metadata.annotations.get_or_insert_with(Default::default);
    pod_annotations.insert(annotations::PROCESSED.to_owned(), "true".to_owned());
    pod_annotations.insert(annotations::STRATEGY_APPLIED.to_owned(), raw_strategy.clone());
    pod_annotations.insert(annotations::PLACEMENT_RULE.to_owned(), group_key.clone());
    if degraded {
        pod_annotations.insert(annotations::FALLBACK_MODE.to_owned(), "true".to_owned());
    }

    // Losing the increment only skews the next decision until the reconciler
    // refreshes from ground truth; it must not fail the admission.
    if !degraded
        && let Err(error) = store.increment(&workload_ref, &strategy, &group_key).await
    {
        warn!(workload = %workload_ref.name, group = %group_key, %error, "placement state increment failed");
    }

    let patch = patch::diff(pod, &modified).map_err(|source| Error::Diff { source })?;
    let response = AdmissionResponse::from(req)
        .with_patch(patch)
        .map_err(|error| Error::PatchSerialize { msg: error.to_string() })?;

    let outcome = if degraded {
        AdmissionOutcome::Fallback
    } else {
        AdmissionOutcome::Modified
    };
    Ok((response, outcome))
}

/// Allow the pod with fallback markers and no scheduling changes.
fn fallback_response(
    req: &AdmissionRequest<corev1::Pod>,
    pod: &corev1::Pod,
) -> Result<AdmissionResponse, Error> {
    let mut modified = pod.clone();
    let pod_annotations = modified.metadata.annotations.get_or_insert_with(Default::default);
    pod_annotations.insert(annotations::PROCESSED.to_owned(), "true".to_owned());
    pod_annotations.insert(annotations::FALLBACK_MODE.to_owned(), "true".to_owned());

    let patch = patch::diff(pod, &modified).map_err(|source| Error::Diff { source })?;
    AdmissionResponse::from(req)
        .with_patch(patch)
        .map_err(|error| Error::PatchSerialize { msg: error.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{MemoryStore, StaticPodLister, fixed_clock};
    use crate::tests::{test_deployment, test_pod};
    use serde_json::json;
    use std::collections::BTreeMap;

    const STRATEGY: &str =
        "base=1,weight=1,nodeSelector=node-type:ondemand;weight=2,nodeSelector=node-type:spot";

    fn memory_store() -> (StateStore, Arc<StaticPodLister>) {
        let lister = Arc::new(StaticPodLister::default());
        let store = StateStore::with_parts(
            Arc::new(MemoryStore::default()),
            lister.clone(),
            fixed_clock(),
        );
        (store, lister)
    }

    fn owner_ref(kind: &str, name: &str) -> metav1::OwnerReference {
        metav1::OwnerReference {
            api_version: "apps/v1".into(),
            kind: kind.into(),
            name: name.into(),
            controller: Some(true),
            ..Default::default()
        }
    }

    fn replica_set(name: &str, owner: Option<metav1::OwnerReference>) -> appsv1::ReplicaSet {
        appsv1::ReplicaSet {
            metadata: metav1::ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                owner_references: owner.map(|reference| vec![reference]),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    /// In-memory [`OwnerLookup`] serving fixed objects by name.
    #[derive(Default)]
    struct StaticOwnerLookup {
        replica_sets: Vec<appsv1::ReplicaSet>,
        workloads: Vec<appsv1::Deployment>,
    }

    #[async_trait]
    impl OwnerLookup for StaticOwnerLookup {
        async fn replica_set(
            &self,
            _namespace: &str,
            name: &str,
        ) -> Result<Option<appsv1::ReplicaSet>, context::Error> {
            Ok(self.replica_sets.iter().find(|rs| rs.name_any() == name).cloned())
        }

        async fn workload(
            &self,
            _namespace: &str,
            name: &str,
        ) -> Result<Option<appsv1::Deployment>, context::Error> {
            Ok(self
                .workloads
                .iter()
                .find(|workload| workload.name_any() == name)
                .cloned())
        }
    }

    /// A `web-abc123` ReplicaSet owned by a `web` Deployment carrying the
    /// two-group strategy.
    fn standard_lookup() -> StaticOwnerLookup {
        StaticOwnerLookup {
            replica_sets: vec![replica_set(
                "web-abc123",
                Some(owner_ref("Deployment", "web")),
            )],
            workloads: vec![test_deployment(
                "web",
                &[(annotations::SCHEDULE_STRATEGY, STRATEGY)],
            )],
        }
    }

    fn mutator_with(lookup: StaticOwnerLookup) -> PodMutator {
        let (store, _) = memory_store();
        PodMutator::new(Arc::new(lookup), store, Arc::new(Stats::default()))
    }

    fn replica_set_pod() -> corev1::Pod {
        let mut pod = test_pod("web-abc123-x", "web", "Pending", &[], 0);
        pod.metadata.owner_references = Some(vec![owner_ref("ReplicaSet", "web-abc123")]);
        pod
    }

    fn admission_request(pod: &corev1::Pod) -> AdmissionRequest<corev1::Pod> {
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "requestKind": {"group": "", "version": "v1", "kind": "Pod"},
                "requestResource": {"group": "", "version": "v1", "resource": "pods"},
                "name": pod.name_any(),
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {"username": "system:serviceaccount:kube-system:replicaset-controller"},
                "object": serde_json::to_value(pod).unwrap(),
                "dryRun": false
            }
        });
        let review: kube::core::admission::AdmissionReview<corev1::Pod> =
            serde_json::from_value(review).unwrap();
        review.try_into().unwrap()
    }

    fn patched_annotations(response: &AdmissionResponse) -> BTreeMap<String, String> {
        let patch: serde_json::Value =
            serde_json::from_slice(response.patch.as_ref().expect("patch present")).unwrap();
        patch
            .as_array()
            .unwrap()
            .iter()
            .find(|op| op["path"] == "/metadata/annotations")
            .map(|op| serde_json::from_value(op["value"].clone()).unwrap())
            .unwrap_or_default()
    }

    fn patched_selector(response: &AdmissionResponse) -> Option<BTreeMap<String, String>> {
        let patch: serde_json::Value =
            serde_json::from_slice(response.patch.as_ref()?).unwrap();
        patch
            .as_array()
            .unwrap()
            .iter()
            .find(|op| op["path"] == "/spec/nodeSelector")
            .map(|op| serde_json::from_value(op["value"].clone()).unwrap())
    }

    #[tokio::test]
    async fn assigns_first_pod_to_base_group() {
        let (store, _) = memory_store();
        let workload = test_deployment("web", &[(annotations::SCHEDULE_STRATEGY, STRATEGY)]);
        let pod = test_pod("web-abc123-x", "web", "Pending", &[], 0);
        let req = admission_request(&pod);

        let (response, outcome) = mutate_for_workload(&store, &req, &pod, &workload)
            .await
            .unwrap();

        assert!(response.allowed);
        assert_eq!(outcome, AdmissionOutcome::Modified);
        assert_eq!(
            patched_selector(&response).unwrap().get("node-type").map(String::as_str),
            Some("ondemand")
        );

        let annotations = patched_annotations(&response);
        assert_eq!(annotations.get(annotations::PROCESSED).map(String::as_str), Some("true"));
        assert_eq!(
            annotations.get(annotations::STRATEGY_APPLIED).map(String::as_str),
            Some(STRATEGY)
        );
        assert_eq!(
            annotations.get(annotations::PLACEMENT_RULE).map(String::as_str),
            Some("node-type=ondemand")
        );
        assert!(!annotations.contains_key(annotations::FALLBACK_MODE));
    }

    #[tokio::test]
    async fn unparseable_strategy_falls_back_without_selector_changes() {
        let (store, _) = memory_store();
        let workload = test_deployment("web", &[(annotations::SCHEDULE_STRATEGY, "garbage")]);
        let pod = test_pod("web-abc123-x", "web", "Pending", &[], 0);
        let req = admission_request(&pod);

        let (response, outcome) = mutate_for_workload(&store, &req, &pod, &workload)
            .await
            .unwrap();

        assert!(response.allowed);
        assert_eq!(outcome, AdmissionOutcome::Fallback);
        assert!(patched_selector(&response).is_none(), "no selector changes in fallback");

        let annotations = patched_annotations(&response);
        assert_eq!(
            annotations.get(annotations::FALLBACK_MODE).map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    async fn missing_annotation_passes_through() {
        let (store, _) = memory_store();
        let workload = test_deployment("web", &[]);
        let pod = test_pod("web-abc123-x", "web", "Pending", &[], 0);
        let req = admission_request(&pod);

        let (response, outcome) = mutate_for_workload(&store, &req, &pod, &workload)
            .await
            .unwrap();

        assert!(response.allowed);
        assert_eq!(outcome, AdmissionOutcome::Passthrough);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn zero_weight_beyond_base_falls_back() {
        let (store, lister) = memory_store();
        // One live pod consumes the base slot, so the next decision needs
        // weights and the all-zero strategy becomes invalid.
        lister.pods.lock().unwrap().push(test_pod(
            "web-abc123-a",
            "web",
            "Running",
            &[("zone", "a")],
            0,
        ));
        let workload = test_deployment(
            "web",
            &[(
                annotations::SCHEDULE_STRATEGY,
                "base=1,weight=0,nodeSelector=zone:a;weight=0,nodeSelector=zone:b",
            )],
        );
        let pod = test_pod("web-abc123-x", "web", "Pending", &[], 0);
        let req = admission_request(&pod);

        let (response, outcome) = mutate_for_workload(&store, &req, &pod, &workload)
            .await
            .unwrap();

        assert!(response.allowed);
        assert_eq!(outcome, AdmissionOutcome::Fallback);
        assert!(patched_selector(&response).is_none());
    }

    #[tokio::test]
    async fn stale_seeded_state_self_corrects() {
        let (store, lister) = memory_store();
        // Five spot pods already live; the next admission must repair the
        // ondemand deficit.
        {
            let mut pods = lister.pods.lock().unwrap();
            for index in 0..5 {
                pods.push(test_pod(
                    &format!("web-abc123-{index}"),
                    "web",
                    "Running",
                    &[("node-type", "spot")],
                    index,
                ));
            }
        }
        let workload = test_deployment("web", &[(annotations::SCHEDULE_STRATEGY, STRATEGY)]);
        let pod = test_pod("web-abc123-x", "web", "Pending", &[], 0);
        let req = admission_request(&pod);

        let (response, _) = mutate_for_workload(&store, &req, &pod, &workload)
            .await
            .unwrap();

        assert_eq!(
            patched_selector(&response).unwrap().get("node-type").map(String::as_str),
            Some("ondemand")
        );
    }

    #[tokio::test]
    async fn caller_selector_survives_mutation() {
        let (store, _) = memory_store();
        let workload = test_deployment("web", &[(annotations::SCHEDULE_STRATEGY, STRATEGY)]);
        let pod = test_pod("web-abc123-x", "web", "Pending", &[("node-type", "custom")], 0);
        let req = admission_request(&pod);

        let (response, _) = mutate_for_workload(&store, &req, &pod, &workload)
            .await
            .unwrap();

        // The caller's node-type wins; only annotations may change it.
        if let Some(selector) = patched_selector(&response) {
            assert_eq!(selector.get("node-type").map(String::as_str), Some("custom"));
        }
    }

    #[tokio::test]
    async fn resolves_two_level_owner_chain() {
        let mutator = mutator_with(standard_lookup());
        let pod = replica_set_pod();

        let response = mutator.handle(admission_request(&pod)).await;

        assert!(response.allowed);
        assert_eq!(
            patched_selector(&response).unwrap().get("node-type").map(String::as_str),
            Some("ondemand")
        );
    }

    #[tokio::test]
    async fn second_pass_over_processed_pod_is_identical() {
        let mutator = mutator_with(standard_lookup());
        let mut pod = replica_set_pod();

        let first = mutator.handle(admission_request(&pod)).await;
        assert!(first.allowed);
        assert!(first.patch.is_some(), "first pass must mutate");

        // Second pass carries the processed marker the first pass applied.
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(annotations::PROCESSED.to_owned(), "true".to_owned());

        let second = mutator.handle(admission_request(&pod)).await;
        assert!(second.allowed);
        assert!(second.patch.is_none(), "second pass must not patch");

        // Repeated passes are byte-identical.
        let third = mutator.handle(admission_request(&pod)).await;
        assert_eq!(
            serde_json::to_vec(&second.into_review()).unwrap(),
            serde_json::to_vec(&third.into_review()).unwrap(),
        );
    }

    #[tokio::test]
    async fn pod_without_controller_owner_passes_through() {
        let mutator = mutator_with(standard_lookup());
        // No owner references at all.
        let pod = test_pod("orphan", "web", "Pending", &[], 0);

        let response = mutator.handle(admission_request(&pod)).await;

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn non_replicaset_owner_passes_through() {
        let mutator = mutator_with(standard_lookup());
        let mut pod = test_pod("web-0", "web", "Pending", &[], 0);
        pod.metadata.owner_references = Some(vec![owner_ref("StatefulSet", "web")]);

        let response = mutator.handle(admission_request(&pod)).await;

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn replicaset_without_workload_owner_passes_through() {
        let lookup = StaticOwnerLookup {
            replica_sets: vec![replica_set("web-abc123", None)],
            workloads: vec![test_deployment(
                "web",
                &[(annotations::SCHEDULE_STRATEGY, STRATEGY)],
            )],
        };
        let mutator = mutator_with(lookup);
        let pod = replica_set_pod();

        let response = mutator.handle(admission_request(&pod)).await;

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn missing_replicaset_passes_through() {
        let mutator = mutator_with(StaticOwnerLookup::default());
        let pod = replica_set_pod();

        let response = mutator.handle(admission_request(&pod)).await;

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }
}
