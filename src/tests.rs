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

use crate::state::WorkloadRef;
use chrono::{Duration, TimeZone, Utc};
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

// Helper functions shared by the module tests.

/// A pod in `default` labelled `app=<app>`, created `created_offset_secs`
/// after a fixed epoch (larger offset = newer pod).
pub fn test_pod(
    name: &str,
    app: &str,
    phase: &str,
    node_selector: &[(&str, &str)],
    created_offset_secs: i64,
) -> corev1::Pod {
    let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

    corev1::Pod {
        metadata: metav1::ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("default".to_owned()),
            labels: Some([("app".to_owned(), app.to_owned())].into_iter().collect()),
            creation_timestamp: Some(metav1::Time(
                base + Duration::seconds(created_offset_secs),
            )),
            ..Default::default()
        },
        spec: Some(corev1::PodSpec {
            node_selector: if node_selector.is_empty() {
                None
            } else {
                Some(
                    node_selector
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                )
            },
            ..Default::default()
        }),
        status: Some(corev1::PodStatus {
            phase: Some(phase.to_owned()),
            ..Default::default()
        }),
    }
}

/// A deployment in `default` selecting `app=<name>`.
pub fn test_deployment(name: &str, annotations: &[(&str, &str)]) -> appsv1::Deployment {
    appsv1::Deployment {
        metadata: metav1::ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("default".to_owned()),
            uid: Some("test-uid-123".to_owned()),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(
                    annotations
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                )
            },
            ..Default::default()
        },
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(3),
            selector: metav1::LabelSelector {
                match_labels: Some(
                    [("app".to_owned(), name.to_owned())].into_iter().collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub fn test_workload_ref(name: &str) -> WorkloadRef {
    WorkloadRef {
        name: name.to_owned(),
        namespace: "default".to_owned(),
        selector: [("app".to_owned(), name.to_owned())].into_iter().collect(),
    }
}
