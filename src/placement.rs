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

//! The placement decision engine.
//!
//! Pure functions of (strategy, observed counts). The engine maximizes the
//! per-rule deficit (expected minus actual), which stays self-correcting when
//! concurrent admissions race on slightly stale counts: a wrong choice raises
//! that group's actual count and biases the next decision away from it.

use crate::strategy::{PlacementRule, PlacementStrategy};
use snafu::{Snafu, ensure};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SelectionError {
    #[snafu(display("strategy has no placement rules"))]
    NoRules,

    #[snafu(display("total weight is zero with pods beyond the base count"))]
    ZeroTotalWeight,
}

/// Pick the rule the next pod should land on.
///
/// Counts keyed by group key; groups no longer present in the strategy are
/// ignored, and two rules with the same selector share one group.
pub fn select_rule<'a>(
    strategy: &'a PlacementStrategy,
    counts: &BTreeMap<String, u32>,
) -> Result<&'a PlacementRule, SelectionError> {
    ensure!(!strategy.rules.is_empty(), NoRulesSnafu);

    let group_keys: BTreeSet<String> =
        strategy.rules.iter().map(PlacementRule::group_key).collect();
    let total: u64 = group_keys
        .iter()
        .map(|key| u64::from(counts.get(key).copied().unwrap_or(0)))
        .sum();

    // The base guarantee always belongs to the first rule.
    if total < u64::from(strategy.base) {
        return Ok(&strategy.rules[0]);
    }

    let total_weight: u64 = strategy.rules.iter().map(|rule| u64::from(rule.weight)).sum();
    ensure!(total_weight > 0, ZeroTotalWeightSnafu);

    // Deficits are measured against the declared distribution (base plus the
    // weighted share) so that the base guarantee never counts against the
    // first rule's weighted allocation. Past its guaranteed count the first
    // rule competes on the margin through its weight alone.
    let expected = expected_distribution(strategy, u32::try_from(total).unwrap_or(u32::MAX));

    let mut best = &strategy.rules[0];
    let mut best_deficit = i64::MIN;

    for rule in &strategy.rules {
        let key = rule.group_key();
        let deficit = i64::from(expected.get(&key).copied().unwrap_or(0))
            - i64::from(counts.get(&key).copied().unwrap_or(0));

        // Strict comparison: ties go to the earliest rule.
        if deficit > best_deficit {
            best_deficit = deficit;
            best = rule;
        }
    }

    Ok(best)
}

/// The distribution the strategy expects for `total_pods` placed pods.
///
/// Flooring residue is deliberately left unassigned; the decision engine's
/// deficit rule resolves it, and the drift threshold absorbs it as noise.
pub fn expected_distribution(
    strategy: &PlacementStrategy,
    total_pods: u32,
) -> BTreeMap<String, u32> {
    let mut expected: BTreeMap<String, u32> = strategy
        .rules
        .iter()
        .map(|rule| (rule.group_key(), 0))
        .collect();

    let Some(first) = strategy.rules.first() else {
        return expected;
    };

    if total_pods <= strategy.base {
        expected.insert(first.group_key(), total_pods);
        return expected;
    }

    expected.insert(first.group_key(), strategy.base);

    let pods_beyond_base = u64::from(total_pods - strategy.base);
    let total_weight: u64 = strategy.rules.iter().map(|rule| u64::from(rule.weight)).sum();
    if total_weight == 0 {
        return expected;
    }

    for rule in &strategy.rules {
        let share = (pods_beyond_base * u64::from(rule.weight) / total_weight) as u32;
        *expected.entry(rule.group_key()).or_insert(0) += share;
    }

    expected
}
