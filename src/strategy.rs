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

//! The placement strategy language.
//!
//! A strategy is declared on a workload as a compact annotation string, e.g.
//! `base=1,weight=1,nodeSelector=node-type:ondemand;weight=2,nodeSelector=node-type:spot`,
//! or as the structured form of a `PodPlacementPolicy`. Both parse into the
//! same [`PlacementStrategy`] value.

use crate::types::v1alpha1::policy::{AffinityRuleSpec, StrategySpec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};
use std::collections::BTreeMap;
use strum::Display;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ParseError {
    #[snafu(display("empty strategy annotation"))]
    EmptyAnnotation,

    #[snafu(display("no placement rules found"))]
    NoRules,

    #[snafu(display("invalid integer in '{}'", token))]
    InvalidNumber { token: String },

    #[snafu(display("unknown parameter '{}'", token))]
    UnknownParameter { token: String },

    #[snafu(display("'base=' is only valid in the first rule, found '{}'", token))]
    BaseOutsideFirstRule { token: String },

    #[snafu(display("invalid nodeSelector pair '{}', expected key:value", token))]
    InvalidSelectorPair { token: String },

    #[snafu(display("empty key or value in nodeSelector pair '{}'", token))]
    EmptySelectorPair { token: String },

    #[snafu(display("rule {} has no nodeSelector", rule))]
    MissingSelector { rule: usize },

    #[snafu(display(
        "invalid affinity rule '{}', expected labelKey:labelValue:topologyKey:scheduling",
        token
    ))]
    InvalidAffinity { token: String },

    #[snafu(display("scheduling preference must be 'required' or 'preferred', got '{}'", token))]
    InvalidSchedulingMode { token: String },
}

/// Whether an affinity term attracts or repels co-scheduled pods.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Display, PartialEq, Eq, JsonSchema, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum AffinityKind {
    #[default]
    #[strum(serialize = "affinity")]
    Affinity,

    #[serde(rename = "anti-affinity")]
    #[strum(serialize = "anti-affinity")]
    AntiAffinity,
}

/// A pod affinity or anti-affinity constraint attached to a rule.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AffinityRule {
    #[serde(rename = "type")]
    pub kind: AffinityKind,
    pub label_selector: BTreeMap<String, String>,
    pub topology_key: String,
    pub required: bool,
}

/// One placement option: a node-selector group with a weight.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRule {
    pub weight: u32,

    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affinity: Vec<AffinityRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PlacementRule {
    /// Canonical group key: selector entries sorted by key, `k=v` joined by `,`.
    pub fn group_key(&self) -> String {
        group_key_of(&self.node_selector)
    }
}

/// The validated distribution declared for one workload.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlacementStrategy {
    pub base: u32,
    pub rules: Vec<PlacementRule>,
}

/// Canonical group key for an arbitrary selector mapping.
pub fn group_key_of(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when every pair of `rule_selector` appears in `pod_selector`.
pub fn selector_is_subset(
    rule_selector: &BTreeMap<String, String>,
    pod_selector: &BTreeMap<String, String>,
) -> bool {
    if rule_selector.is_empty() {
        return true;
    }

    rule_selector
        .iter()
        .all(|(key, value)| pod_selector.get(key) == Some(value))
}

/// Parse the compact annotation form.
pub fn parse(annotation: &str) -> Result<PlacementStrategy, ParseError> {
    ensure!(!annotation.trim().is_empty(), EmptyAnnotationSnafu);

    let mut base = 0;
    let mut rules = Vec::new();

    for (index, segment) in annotation.split(';').enumerate() {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }

        rules.push(parse_rule(segment, index, &mut base)?);
    }

    ensure!(!rules.is_empty(), NoRulesSnafu);

    Ok(PlacementStrategy { base, rules })
}

fn parse_rule(segment: &str, index: usize, base: &mut u32) -> Result<PlacementRule, ParseError> {
    let mut rule = PlacementRule::default();
    // A nodeSelector list may itself contain commas, so pairs after the first
    // arrive as bare `key:value` tokens and continue the open list.
    let mut in_selector = false;

    for raw in segment.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }

        if let Some(value) = token.strip_prefix("base=") {
            ensure!(index == 0, BaseOutsideFirstRuleSnafu { token });
            *base = parse_int(value, token)?;
            in_selector = false;
        } else if let Some(value) = token.strip_prefix("weight=") {
            rule.weight = parse_int(value, token)?;
            in_selector = false;
        } else if let Some(value) = token.strip_prefix("nodeSelector=") {
            push_selector_pair(&mut rule.node_selector, value)?;
            in_selector = true;
        } else if token.starts_with("affinity=") || token.starts_with("anti-affinity=") {
            rule.affinity.push(parse_affinity(token)?);
            in_selector = false;
        } else if in_selector && !token.contains('=') {
            push_selector_pair(&mut rule.node_selector, token)?;
        } else {
            return UnknownParameterSnafu { token }.fail();
        }
    }

    ensure!(!rule.node_selector.is_empty(), MissingSelectorSnafu { rule: index });

    Ok(rule)
}

fn parse_int(value: &str, token: &str) -> Result<u32, ParseError> {
    value
        .parse::<u32>()
        .ok()
        .ok_or_else(|| InvalidNumberSnafu { token }.build())
}

fn push_selector_pair(
    selector: &mut BTreeMap<String, String>,
    pair: &str,
) -> Result<(), ParseError> {
    let parts: Vec<&str> = pair.split(':').collect();
    ensure!(parts.len() == 2, InvalidSelectorPairSnafu { token: pair });

    let (key, value) = (parts[0].trim(), parts[1].trim());
    ensure!(
        !key.is_empty() && !value.is_empty(),
        EmptySelectorPairSnafu { token: pair }
    );

    selector.insert(key.to_owned(), value.to_owned());
    Ok(())
}

fn parse_affinity(token: &str) -> Result<AffinityRule, ParseError> {
    let (kind, spec) = if let Some(spec) = token.strip_prefix("affinity=") {
        (AffinityKind::Affinity, spec)
    } else if let Some(spec) = token.strip_prefix("anti-affinity=") {
        (AffinityKind::AntiAffinity, spec)
    } else {
        return InvalidAffinitySnafu { token }.fail();
    };

    let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
    let &[label_key, label_value, topology_key, scheduling] = parts.as_slice() else {
        return InvalidAffinitySnafu { token }.fail();
    };

    ensure!(
        !label_key.is_empty() && !label_value.is_empty() && !topology_key.is_empty(),
        InvalidAffinitySnafu { token }
    );

    let required = match scheduling {
        "required" => true,
        "preferred" => false,
        other => return InvalidSchedulingModeSnafu { token: other }.fail(),
    };

    Ok(AffinityRule {
        kind,
        label_selector: [(label_key.to_owned(), label_value.to_owned())]
            .into_iter()
            .collect(),
        topology_key: topology_key.to_owned(),
        required,
    })
}

impl PlacementStrategy {
    /// Canonical compact serialization. Rules are joined strictly by `;`;
    /// `parse(emit(s))` round-trips modulo selector key ordering.
    pub fn emit(&self) -> String {
        let mut segments = Vec::with_capacity(self.rules.len());

        for (index, rule) in self.rules.iter().enumerate() {
            let mut fields = Vec::new();

            if index == 0 {
                fields.push(format!("base={}", self.base));
            }
            fields.push(format!("weight={}", rule.weight));

            if !rule.node_selector.is_empty() {
                let pairs = rule
                    .node_selector
                    .iter()
                    .map(|(key, value)| format!("{key}:{value}"))
                    .collect::<Vec<_>>()
                    .join(",");
                fields.push(format!("nodeSelector={pairs}"));
            }

            for affinity in &rule.affinity {
                // The compact grammar carries a single label pair.
                let Some((label_key, label_value)) = affinity.label_selector.iter().next() else {
                    continue;
                };
                let mode = if affinity.required { "required" } else { "preferred" };
                fields.push(format!(
                    "{}={label_key}:{label_value}:{}:{mode}",
                    affinity.kind, affinity.topology_key
                ));
            }

            segments.push(fields.join(","));
        }

        segments.join(";")
    }
}

impl TryFrom<&StrategySpec> for PlacementStrategy {
    type Error = ParseError;

    /// Convert the structured (policy CRD) form, enforcing the same
    /// constraints as the compact parser. The node selector may be empty in
    /// this form, and the scheduling mode defaults to preferred when absent.
    fn try_from(spec: &StrategySpec) -> Result<Self, ParseError> {
        ensure!(!spec.rules.is_empty(), NoRulesSnafu);

        let mut rules = Vec::with_capacity(spec.rules.len());
        for rule in &spec.rules {
            for (key, value) in &rule.node_selector {
                ensure!(
                    !key.is_empty() && !value.is_empty(),
                    EmptySelectorPairSnafu { token: format!("{key}:{value}") }
                );
            }

            let affinity = rule
                .affinity
                .iter()
                .map(convert_affinity)
                .collect::<Result<Vec<_>, _>>()?;

            rules.push(PlacementRule {
                weight: rule.weight,
                node_selector: rule.node_selector.clone(),
                affinity,
                name: rule.name.clone(),
            });
        }

        Ok(PlacementStrategy { base: spec.base, rules })
    }
}

fn convert_affinity(spec: &AffinityRuleSpec) -> Result<AffinityRule, ParseError> {
    let valid = !spec.topology_key.is_empty()
        && !spec.label_selector.is_empty()
        && spec
            .label_selector
            .iter()
            .all(|(key, value)| !key.is_empty() && !value.is_empty());
    ensure!(
        valid,
        InvalidAffinitySnafu { token: format!("{}={:?}", spec.kind, spec.label_selector) }
    );

    Ok(AffinityRule {
        kind: spec.kind,
        label_selector: spec.label_selector.clone(),
        topology_key: spec.topology_key.clone(),
        required: spec.required_during_scheduling.unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_rule_strategy() {
        let strategy = parse(
            "base=1,weight=1,nodeSelector=node-type:ondemand;weight=2,nodeSelector=node-type:spot",
        )
        .unwrap();

        assert_eq!(strategy.base, 1);
        assert_eq!(strategy.rules.len(), 2);
        assert_eq!(strategy.rules[0].weight, 1);
        assert_eq!(strategy.rules[0].group_key(), "node-type=ondemand");
        assert_eq!(strategy.rules[1].weight, 2);
        assert_eq!(strategy.rules[1].group_key(), "node-type=spot");
    }

    #[test]
    fn parses_single_rule_strategy() {
        let strategy = parse("base=2,weight=1,nodeSelector=zone:us-west-1").unwrap();

        assert_eq!(strategy.base, 2);
        assert_eq!(strategy.rules.len(), 1);
    }

    #[test]
    fn parses_multi_pair_node_selector() {
        let strategy = parse(
            "base=1,weight=1,nodeSelector=node-type:ondemand,zone:us-west-1;weight=2,nodeSelector=node-type:spot,zone:us-west-1",
        )
        .unwrap();

        assert_eq!(strategy.rules.len(), 2);
        assert_eq!(
            strategy.rules[0].group_key(),
            "node-type=ondemand,zone=us-west-1"
        );
        assert_eq!(strategy.rules[1].node_selector.len(), 2);
    }

    #[test]
    fn missing_base_defaults_to_zero() {
        let strategy = parse("weight=1,nodeSelector=node-type:ondemand").unwrap();
        assert_eq!(strategy.base, 0);
        assert_eq!(strategy.rules.len(), 1);
    }

    #[test]
    fn rejects_empty_annotation() {
        assert_eq!(parse(""), Err(ParseError::EmptyAnnotation));
        assert_eq!(parse("   "), Err(ParseError::EmptyAnnotation));
    }

    #[test]
    fn rejects_invalid_base() {
        assert!(matches!(
            parse("base=abc,weight=1,nodeSelector=node-type:ondemand"),
            Err(ParseError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn rejects_invalid_weight() {
        assert!(matches!(
            parse("base=1,weight=abc,nodeSelector=node-type:ondemand"),
            Err(ParseError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn rejects_unknown_parameter() {
        let err = parse("base=1,weight=1,nodeSelector=a:b,bogus=1").unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownParameter { token: "bogus=1".into() }
        );
    }

    #[test]
    fn rejects_rule_without_selector() {
        assert!(matches!(
            parse("base=1,weight=1"),
            Err(ParseError::MissingSelector { rule: 0 })
        ));
    }

    #[test]
    fn rejects_base_in_later_rule() {
        assert!(matches!(
            parse("base=1,weight=1,nodeSelector=a:b;base=2,weight=1,nodeSelector=c:d"),
            Err(ParseError::BaseOutsideFirstRule { .. })
        ));
    }

    #[test]
    fn parses_affinity_rules() {
        let strategy = parse(
            "base=1,weight=1,nodeSelector=node-type:ondemand,affinity=app:web:zone:preferred;weight=2,nodeSelector=node-type:spot,anti-affinity=app:web:zone:required",
        )
        .unwrap();

        let first = &strategy.rules[0].affinity[0];
        assert_eq!(first.kind, AffinityKind::Affinity);
        assert_eq!(first.label_selector.get("app").map(String::as_str), Some("web"));
        assert_eq!(first.topology_key, "zone");
        assert!(!first.required);

        let second = &strategy.rules[1].affinity[0];
        assert_eq!(second.kind, AffinityKind::AntiAffinity);
        assert!(second.required);
    }

    #[test]
    fn rejects_bad_scheduling_mode() {
        assert!(matches!(
            parse("base=1,weight=1,nodeSelector=a:b,affinity=app:web:zone:sometimes"),
            Err(ParseError::InvalidSchedulingMode { .. })
        ));
    }

    #[test]
    fn group_key_is_sorted() {
        let selector: BTreeMap<String, String> = [
            ("zone".to_owned(), "us-west-1".to_owned()),
            ("node-type".to_owned(), "spot".to_owned()),
        ]
        .into_iter()
        .collect();

        assert_eq!(group_key_of(&selector), "node-type=spot,zone=us-west-1");
        assert_eq!(group_key_of(&BTreeMap::new()), "");
    }

    #[test]
    fn subset_matching() {
        let rule: BTreeMap<String, String> =
            [("node-type".to_owned(), "spot".to_owned())].into_iter().collect();
        let pod: BTreeMap<String, String> = [
            ("node-type".to_owned(), "spot".to_owned()),
            ("zone".to_owned(), "us-west-1".to_owned()),
        ]
        .into_iter()
        .collect();

        assert!(selector_is_subset(&rule, &pod));
        assert!(!selector_is_subset(&pod, &rule));
        assert!(selector_is_subset(&BTreeMap::new(), &pod));
    }

    #[test]
    fn emit_round_trips() {
        let annotation = "base=1,weight=1,nodeSelector=node-type:ondemand,affinity=app:web:zone:preferred;weight=2,nodeSelector=node-type:spot,zone:us-west-1,anti-affinity=app:web:zone:required";
        let strategy = parse(annotation).unwrap();
        let emitted = strategy.emit();

        assert_eq!(parse(&emitted).unwrap(), strategy);
    }

    #[test]
    fn emit_joins_rules_with_semicolons() {
        let strategy = parse(
            "base=1,weight=1,nodeSelector=a:b;weight=2,nodeSelector=c:d;weight=3,nodeSelector=e:f",
        )
        .unwrap();

        assert_eq!(
            strategy.emit(),
            "base=1,weight=1,nodeSelector=a:b;weight=2,nodeSelector=c:d;weight=3,nodeSelector=e:f"
        );
    }
}
