// src/violations/rules.rs
//
// Per-type rule configuration. Read-only once the engine is built.

use super::types::ViolationType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRule {
    pub rule_id: String,
    pub violation_type: ViolationType,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Numeric thresholds, detector-specific
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
    /// Zone ids where the rule applies; empty = everywhere
    #[serde(default)]
    pub zones: Vec<String>,
    /// Overrides the type's default cooldown
    #[serde(default)]
    pub cooldown_secs: Option<f64>,
    /// Restrict to these vehicle classes; empty = all
    #[serde(default)]
    pub vehicle_types: Vec<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl ViolationRule {
    pub fn new(rule_id: &str, violation_type: ViolationType) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            violation_type,
            enabled: true,
            parameters: HashMap::new(),
            zones: Vec::new(),
            cooldown_secs: None,
            vehicle_types: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: f64) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn param(&self, key: &str, default: f64) -> f64 {
        self.parameters.get(key).copied().unwrap_or(default)
    }

    pub fn cooldown_ms(&self) -> f64 {
        self.cooldown_secs
            .unwrap_or_else(|| self.violation_type.default_cooldown_secs())
            * 1000.0
    }

    /// A rule scoped to zones never applies outside every zone.
    pub fn applies_to_zone(&self, zone_id: Option<&str>) -> bool {
        if self.zones.is_empty() {
            return true;
        }
        match zone_id {
            Some(z) => self.zones.iter().any(|r| r == z),
            None => false,
        }
    }

    pub fn applies_to_class(&self, class_name: &str) -> bool {
        self.vehicle_types.is_empty() || self.vehicle_types.iter().any(|c| c == class_name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<ViolationType, ViolationRule>,
}

impl RuleSet {
    /// Defaults for the detector-backed types.
    pub fn defaults() -> Self {
        let mut set = Self::default();
        set.insert(ViolationRule::new("speed_default", ViolationType::Speeding));
        set.insert(ViolationRule::new("lane_default", ViolationType::Lane));
        set.insert(
            ViolationRule::new("wrong_way_default", ViolationType::WrongWay)
                .with_param("min_points", 5.0)
                .with_param("angle_threshold_deg", 90.0)
                .with_param("expected_dx", 0.0)
                .with_param("expected_dy", -1.0)
                .with_param("min_displacement_px", 20.0),
        );
        set.insert(
            ViolationRule::new("following_default", ViolationType::FollowingDistance)
                .with_param("min_distance_m", 20.0)
                .with_param("same_lane_px", 100.0),
        );
        set
    }

    /// Defaults overlaid with configured rules (configured wins per type).
    pub fn from_rules(rules: &[ViolationRule]) -> Self {
        let mut set = Self::defaults();
        for rule in rules {
            let mut merged = rule.clone();
            if let Some(base) = set.rules.get(&rule.violation_type) {
                for (k, v) in &base.parameters {
                    merged.parameters.entry(k.clone()).or_insert(*v);
                }
            }
            set.insert(merged);
        }
        set
    }

    pub fn insert(&mut self, rule: ViolationRule) {
        self.rules.insert(rule.violation_type, rule);
    }

    pub fn get(&self, t: ViolationType) -> Option<&ViolationRule> {
        self.rules.get(&t)
    }

    pub fn is_enabled(&self, t: ViolationType) -> bool {
        self.rules.get(&t).map_or(false, |r| r.enabled)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViolationRule> {
        self.rules.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_scoping() {
        let mut rule = ViolationRule::new("r", ViolationType::Speeding);
        assert!(rule.applies_to_zone(None));
        rule.zones = vec!["school".into()];
        assert!(rule.applies_to_zone(Some("school")));
        assert!(!rule.applies_to_zone(Some("highway")));
        assert!(!rule.applies_to_zone(None));
    }

    #[test]
    fn test_configured_rule_keeps_default_params() {
        let custom = ViolationRule::new("wrong_way_site", ViolationType::WrongWay)
            .with_param("expected_dy", 1.0);
        let set = RuleSet::from_rules(&[custom]);
        let rule = set.get(ViolationType::WrongWay).unwrap();
        assert_eq!(rule.rule_id, "wrong_way_site");
        assert_eq!(rule.param("expected_dy", 0.0), 1.0);
        assert_eq!(rule.param("min_points", 0.0), 5.0);
    }

    #[test]
    fn test_cooldown_override() {
        let mut rule = ViolationRule::new("r", ViolationType::Speeding);
        assert_eq!(rule.cooldown_ms(), 30_000.0);
        rule.cooldown_secs = Some(5.0);
        assert_eq!(rule.cooldown_ms(), 5_000.0);
    }

    #[test]
    fn test_disabled_rule() {
        let mut rule = ViolationRule::new("r", ViolationType::Lane);
        rule.enabled = false;
        let set = RuleSet::from_rules(&[rule]);
        assert!(!set.is_enabled(ViolationType::Lane));
        assert!(set.is_enabled(ViolationType::Speeding));
        assert!(!set.is_enabled(ViolationType::Parking), "no rule, no detection");
    }
}
