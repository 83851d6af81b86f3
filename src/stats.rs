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

//! Process-wide logical counters, rendered as plain text on the metrics
//! bind address.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// How an admission request was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Placement applied, pod patched.
    Modified,
    /// Pod admitted unmodified.
    Passthrough,
    /// Degraded or invalid-strategy path, fallback annotations only.
    Fallback,
}

#[derive(Default)]
pub struct Stats {
    admissions_modified: AtomicU64,
    admissions_passthrough: AtomicU64,
    admissions_fallback: AtomicU64,
    rebalance_deletions: AtomicU64,
    webhook_latency_micros_sum: AtomicU64,
    webhook_latency_count: AtomicU64,
    drift: Mutex<BTreeMap<String, f64>>,
}

impl Stats {
    pub fn count_admission(&self, outcome: AdmissionOutcome) {
        let counter = match outcome {
            AdmissionOutcome::Modified => &self.admissions_modified,
            AdmissionOutcome::Passthrough => &self.admissions_passthrough,
            AdmissionOutcome::Fallback => &self.admissions_fallback,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_deletion(&self) {
        self.rebalance_deletions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_webhook_latency(&self, elapsed: std::time::Duration) {
        self.webhook_latency_micros_sum
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.webhook_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the latest observed drift percentage for a workload.
    pub fn set_drift(&self, workload: &str, percentage: f64) {
        let mut drift = self.drift.lock().unwrap();
        drift.insert(workload.to_owned(), percentage);
    }

    pub fn clear_drift(&self, workload: &str) {
        let mut drift = self.drift.lock().unwrap();
        drift.remove(workload);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "smart_scheduler_admissions_total{{outcome=\"modified\"}} {}\n",
            self.admissions_modified.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "smart_scheduler_admissions_total{{outcome=\"passthrough\"}} {}\n",
            self.admissions_passthrough.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "smart_scheduler_admissions_total{{outcome=\"fallback\"}} {}\n",
            self.admissions_fallback.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "smart_scheduler_rebalance_deletions_total {}\n",
            self.rebalance_deletions.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "smart_scheduler_webhook_latency_micros_sum {}\n",
            self.webhook_latency_micros_sum.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "smart_scheduler_webhook_latency_count {}\n",
            self.webhook_latency_count.load(Ordering::Relaxed)
        ));

        let drift = self.drift.lock().unwrap();
        for (workload, percentage) in drift.iter() {
            out.push_str(&format!(
                "smart_scheduler_drift_percentage{{workload=\"{workload}\"}} {percentage:.1}\n"
            ));
        }

        out
    }
}
