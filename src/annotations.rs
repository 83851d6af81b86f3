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

//! Annotation keys shared between the admission webhook and the controllers.

/// Strategy annotation read from the workload.
pub const SCHEDULE_STRATEGY: &str = "smart-scheduler.io/schedule-strategy";

/// Idempotency marker written to mutated pods.
pub const PROCESSED: &str = "smart-scheduler.io/processed";

/// The strategy string that was applied to the pod.
pub const STRATEGY_APPLIED: &str = "smart-scheduler.io/strategy-applied";

/// Group key of the rule chosen for the pod.
pub const PLACEMENT_RULE: &str = "smart-scheduler.io/placement-rule";

/// Set when the degraded (live-list) admission path ran.
pub const FALLBACK_MODE: &str = "smart-scheduler.io/fallback-mode";

/// Provenance annotations written to workloads by the policy translator.
pub const POLICY_NAME: &str = "smart-scheduler.io/policy-name";
pub const POLICY_PRIORITY: &str = "smart-scheduler.io/policy-priority";
pub const POLICY_APPLIED: &str = "smart-scheduler.io/policy-applied";
