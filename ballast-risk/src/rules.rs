//! Threshold rules over risk snapshots.
//!
//! A [`RiskRule`] compares one [`RiskMetric`] of a strategy's snapshot with a
//! fixed threshold. [`AlertRuleEngine::evaluate`] raises a [`RiskAlert`] for
//! every breached rule, at most once per rule and snapshot date.

use crate::analytics::{RiskMetric, RiskSnapshot};
use crate::error::RiskError;
use ballast_core::types::StrategyId;
use ballast_telemetry::metrics::EngineMetrics;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

/// Comparison operator of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    /// `value < threshold`
    #[serde(rename = "<")]
    LessThan,
    /// `value > threshold`
    #[serde(rename = ">")]
    GreaterThan,
    /// `value <= threshold`
    #[serde(rename = "<=")]
    LessOrEqual,
    /// `value >= threshold`
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

impl Comparison {
    /// Returns true if `value` breaches `threshold`. NaN never breaches.
    #[must_use]
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::LessThan => value < threshold,
            Self::GreaterThan => value > threshold,
            Self::LessOrEqual => value <= threshold,
            Self::GreaterOrEqual => value >= threshold,
        }
    }

    /// Operator symbol.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::LessThan => "<",
            Self::GreaterThan => ">",
            Self::LessOrEqual => "<=",
            Self::GreaterOrEqual => ">=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Comparison {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" => Ok(Self::LessThan),
            ">" => Ok(Self::GreaterThan),
            "<=" | "≤" => Ok(Self::LessOrEqual),
            ">=" | "≥" => Ok(Self::GreaterOrEqual),
            other => Err(RiskError::UnknownOperator {
                operator: other.to_string(),
            }),
        }
    }
}

/// Rule identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(Uuid);

impl RuleId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RuleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Alert identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AlertId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Operator-defined threshold on one metric of one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRule {
    /// Identifier.
    #[serde(default)]
    pub id: RuleId,
    /// Strategy the rule is scoped to.
    pub strategy: StrategyId,
    /// Metric compared.
    pub metric: RiskMetric,
    /// Operator.
    pub comparison: Comparison,
    /// Threshold value.
    pub threshold: f64,
}

impl RiskRule {
    /// Creates a rule with a fresh id.
    pub fn new(
        strategy: impl Into<StrategyId>,
        metric: RiskMetric,
        comparison: Comparison,
        threshold: f64,
    ) -> Result<Self, RiskError> {
        if !threshold.is_finite() {
            return Err(RiskError::InvalidThreshold { threshold });
        }
        Ok(Self {
            id: RuleId::new(),
            strategy: strategy.into(),
            metric,
            comparison,
            threshold,
        })
    }

    /// Returns the metric value if the snapshot breaches this rule.
    #[must_use]
    pub fn breach(&self, snapshot: &RiskSnapshot) -> Option<f64> {
        let value = snapshot.metric(self.metric);
        self.comparison.holds(value, self.threshold).then_some(value)
    }
}

/// A breached rule awaiting operator acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    /// Identifier.
    pub id: AlertId,
    /// Rule that fired.
    pub rule_id: RuleId,
    /// Strategy evaluated.
    pub strategy: StrategyId,
    /// Metric compared.
    pub metric: RiskMetric,
    /// Operator of the rule at trigger time.
    pub comparison: Comparison,
    /// Threshold of the rule at trigger time.
    pub threshold: f64,
    /// Metric value that breached.
    pub triggered_value: f64,
    /// Date of the snapshot evaluated.
    pub snapshot_date: NaiveDate,
    /// When the alert was raised.
    pub triggered_at: DateTime<Utc>,
    /// Set once by an operator.
    #[serde(default)]
    pub acknowledged: bool,
}

impl RiskAlert {
    /// Marks the alert acknowledged. Idempotent.
    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }
}

/// Holds the active rule set and evaluates snapshots against it.
#[derive(Debug, Default)]
pub struct AlertRuleEngine {
    rules: RwLock<BTreeMap<RuleId, RiskRule>>,
    /// Latest snapshot date each rule fired for.
    fired: DashMap<RuleId, NaiveDate>,
}

impl AlertRuleEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine preloaded with `rules`.
    pub fn with_rules(rules: impl IntoIterator<Item = RiskRule>) -> Result<Self, RiskError> {
        let engine = Self::new();
        for rule in rules {
            engine.add_rule(rule)?;
        }
        Ok(engine)
    }

    /// Registers a rule.
    pub fn add_rule(&self, rule: RiskRule) -> Result<RuleId, RiskError> {
        if !rule.threshold.is_finite() {
            return Err(RiskError::InvalidThreshold {
                threshold: rule.threshold,
            });
        }
        let mut rules = self.rules.write();
        if rules.contains_key(&rule.id) {
            return Err(RiskError::DuplicateRule {
                id: rule.id.to_string(),
            });
        }
        let id = rule.id;
        info!(
            rule = %id,
            strategy = %rule.strategy,
            metric = %rule.metric,
            comparison = %rule.comparison,
            threshold = rule.threshold,
            "risk rule added"
        );
        rules.insert(id, rule);
        Ok(id)
    }

    /// Replaces the rule stored under `id`, keeping the id.
    ///
    /// The replaced rule may fire again for a date it already fired on.
    pub fn replace_rule(&self, id: RuleId, mut rule: RiskRule) -> Result<(), RiskError> {
        if !rule.threshold.is_finite() {
            return Err(RiskError::InvalidThreshold {
                threshold: rule.threshold,
            });
        }
        let mut rules = self.rules.write();
        let slot = rules
            .get_mut(&id)
            .ok_or_else(|| RiskError::UnknownRule { id: id.to_string() })?;
        rule.id = id;
        *slot = rule;
        self.fired.remove(&id);
        info!(rule = %id, "risk rule replaced");
        Ok(())
    }

    /// Removes a rule, returning it.
    pub fn remove_rule(&self, id: RuleId) -> Result<RiskRule, RiskError> {
        let removed = self
            .rules
            .write()
            .remove(&id)
            .ok_or_else(|| RiskError::UnknownRule { id: id.to_string() })?;
        self.fired.remove(&id);
        info!(rule = %id, "risk rule removed");
        Ok(removed)
    }

    /// Rules scoped to `strategy`.
    #[must_use]
    pub fn rules_for(&self, strategy: &StrategyId) -> Vec<RiskRule> {
        self.rules
            .read()
            .values()
            .filter(|r| &r.strategy == strategy)
            .cloned()
            .collect()
    }

    /// Total number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// True if no rules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Evaluates every rule scoped to the snapshot's strategy and marks the
    /// alerts raised as fired.
    ///
    /// Rules that already fired for this snapshot date are skipped, so
    /// re-evaluating the same snapshot raises nothing new.
    pub fn evaluate(&self, snapshot: &RiskSnapshot, now: DateTime<Utc>) -> Vec<RiskAlert> {
        let alerts = self.pending(snapshot, now);
        self.mark_fired(&alerts);
        alerts
    }

    /// Alerts `snapshot` would raise, without marking them fired.
    ///
    /// Callers that persist alerts call [`mark_fired`](Self::mark_fired) once
    /// the write succeeds; until then the same alerts are raised again.
    pub fn pending(&self, snapshot: &RiskSnapshot, now: DateTime<Utc>) -> Vec<RiskAlert> {
        let rules = self.rules.read();
        let mut alerts = Vec::new();
        for rule in rules.values().filter(|r| r.strategy == snapshot.strategy) {
            let Some(value) = rule.breach(snapshot) else {
                continue;
            };
            if self
                .fired
                .get(&rule.id)
                .is_some_and(|date| *date >= snapshot.date)
            {
                continue;
            }

            warn!(
                rule = %rule.id,
                strategy = %rule.strategy,
                metric = %rule.metric,
                value,
                comparison = %rule.comparison,
                threshold = rule.threshold,
                date = %snapshot.date,
                "risk rule breached"
            );

            alerts.push(RiskAlert {
                id: AlertId::new(),
                rule_id: rule.id,
                strategy: rule.strategy.clone(),
                metric: rule.metric,
                comparison: rule.comparison,
                threshold: rule.threshold,
                triggered_value: value,
                snapshot_date: snapshot.date,
                triggered_at: now,
                acknowledged: false,
            });
        }
        alerts
    }

    /// Records `alerts` as raised for their snapshot dates. Alerts of rules
    /// removed in the meantime are ignored.
    pub fn mark_fired(&self, alerts: &[RiskAlert]) {
        let rules = self.rules.read();
        for alert in alerts.iter().filter(|a| rules.contains_key(&a.rule_id)) {
            let mut date = self.fired.entry(alert.rule_id).or_insert(alert.snapshot_date);
            if *date < alert.snapshot_date {
                *date = alert.snapshot_date;
            }
            EngineMetrics::alert(alert.strategy.as_str(), alert.metric.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(strategy: &str, date: NaiveDate, var95: f64, sharpe: f64) -> RiskSnapshot {
        RiskSnapshot {
            strategy: StrategyId::new(strategy),
            date,
            observations: 60,
            var95,
            var99: var95 * 1.4,
            cvar95: var95 * 1.2,
            cvar99: var95 * 1.6,
            max_drawdown: -0.1,
            volatility: 0.15,
            sharpe,
            sortino: sharpe * 1.3,
            beta: 0.0,
            alpha: 0.0,
            latest_return: 0.001,
            stale: false,
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[test]
    fn test_comparison_semantics() {
        assert!(Comparison::LessThan.holds(1.0, 2.0));
        assert!(!Comparison::LessThan.holds(2.0, 2.0));
        assert!(Comparison::LessOrEqual.holds(2.0, 2.0));
        assert!(Comparison::GreaterOrEqual.holds(2.0, 2.0));
        assert!(!Comparison::GreaterThan.holds(2.0, 2.0));
        for op in [
            Comparison::LessThan,
            Comparison::GreaterThan,
            Comparison::LessOrEqual,
            Comparison::GreaterOrEqual,
        ] {
            assert!(!op.holds(f64::NAN, 0.0));
        }
    }

    #[test]
    fn test_comparison_parse() {
        assert_eq!("<=".parse::<Comparison>().unwrap(), Comparison::LessOrEqual);
        assert_eq!("≥".parse::<Comparison>().unwrap(), Comparison::GreaterOrEqual);
        assert!(matches!(
            "==".parse::<Comparison>(),
            Err(RiskError::UnknownOperator { .. })
        ));
        let json = serde_json::to_string(&Comparison::GreaterThan).unwrap();
        assert_eq!(json, "\">\"");
    }

    #[test]
    fn test_breach_raises_unacknowledged_alert() {
        let engine = AlertRuleEngine::new();
        let rule = RiskRule::new("carry", RiskMetric::Var95, Comparison::GreaterThan, 0.03).unwrap();
        let rule_id = engine.add_rule(rule).unwrap();

        let now = Utc::now();
        let alerts = engine.evaluate(&snapshot("carry", date(3), 0.044, 1.0), now);
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.rule_id, rule_id);
        assert!((alert.triggered_value - 0.044).abs() < 1e-12);
        assert_eq!(alert.triggered_at, now);
        assert!(!alert.acknowledged);
    }

    #[test]
    fn test_rules_scoped_to_strategy() {
        let engine = AlertRuleEngine::with_rules([
            RiskRule::new("carry", RiskMetric::Sharpe, Comparison::LessThan, 0.5).unwrap(),
            RiskRule::new("trend", RiskMetric::Sharpe, Comparison::LessThan, 0.5).unwrap(),
        ])
        .unwrap();
        let alerts = engine.evaluate(&snapshot("trend", date(3), 0.01, 0.2), Utc::now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].strategy.as_str(), "trend");
        assert_eq!(engine.rules_for(&StrategyId::new("carry")).len(), 1);
    }

    #[test]
    fn test_fires_once_per_snapshot_date() {
        let engine = AlertRuleEngine::new();
        engine
            .add_rule(RiskRule::new("carry", RiskMetric::Var95, Comparison::GreaterOrEqual, 0.02).unwrap())
            .unwrap();

        let snap = snapshot("carry", date(3), 0.05, 1.0);
        assert_eq!(engine.evaluate(&snap, Utc::now()).len(), 1);
        assert!(engine.evaluate(&snap, Utc::now()).is_empty());

        let next = snapshot("carry", date(4), 0.05, 1.0);
        assert_eq!(engine.evaluate(&next, Utc::now()).len(), 1);
    }

    #[test]
    fn test_pending_rearms_until_marked() {
        let engine = AlertRuleEngine::new();
        engine
            .add_rule(RiskRule::new("carry", RiskMetric::Var95, Comparison::GreaterThan, 0.02).unwrap())
            .unwrap();
        let snap = snapshot("carry", date(3), 0.05, 1.0);

        let first = engine.pending(&snap, Utc::now());
        assert_eq!(first.len(), 1);
        assert_eq!(engine.pending(&snap, Utc::now()).len(), 1);

        engine.mark_fired(&first);
        assert!(engine.pending(&snap, Utc::now()).is_empty());
        assert!(engine.evaluate(&snap, Utc::now()).is_empty());

        // An older alert never rewinds the fired date.
        let stale = engine.pending(&snapshot("carry", date(4), 0.05, 1.0), Utc::now());
        engine.mark_fired(&stale);
        engine.mark_fired(&first);
        assert!(engine.pending(&snapshot("carry", date(4), 0.05, 1.0), Utc::now()).is_empty());
    }

    #[test]
    fn test_replace_keeps_id_and_rearms() {
        let engine = AlertRuleEngine::new();
        let rule = RiskRule::new("carry", RiskMetric::Var95, Comparison::GreaterThan, 0.02).unwrap();
        let id = engine.add_rule(rule).unwrap();
        let snap = snapshot("carry", date(3), 0.05, 1.0);
        assert_eq!(engine.evaluate(&snap, Utc::now()).len(), 1);

        let stricter = RiskRule::new("carry", RiskMetric::Var95, Comparison::GreaterThan, 0.04).unwrap();
        engine.replace_rule(id, stricter).unwrap();
        let alerts = engine.evaluate(&snap, Utc::now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, id);
        assert!((alerts[0].threshold - 0.04).abs() < f64::EPSILON);

        assert!(matches!(
            engine.replace_rule(RuleId::new(), snapshot_rule()),
            Err(RiskError::UnknownRule { .. })
        ));
    }

    fn snapshot_rule() -> RiskRule {
        RiskRule::new("carry", RiskMetric::Beta, Comparison::GreaterThan, 1.0).unwrap()
    }

    #[test]
    fn test_duplicate_and_remove() {
        let engine = AlertRuleEngine::new();
        let rule = snapshot_rule();
        engine.add_rule(rule.clone()).unwrap();
        assert!(matches!(
            engine.add_rule(rule.clone()),
            Err(RiskError::DuplicateRule { .. })
        ));
        let removed = engine.remove_rule(rule.id).unwrap();
        assert_eq!(removed, rule);
        assert!(engine.is_empty());
        assert!(engine.remove_rule(rule.id).is_err());
    }

    #[test]
    fn test_non_finite_threshold_rejected() {
        assert!(matches!(
            RiskRule::new("carry", RiskMetric::Var95, Comparison::GreaterThan, f64::NAN),
            Err(RiskError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_acknowledge() {
        let engine = AlertRuleEngine::new();
        engine
            .add_rule(RiskRule::new("carry", RiskMetric::MaxDrawdown, Comparison::LessThan, -0.05).unwrap())
            .unwrap();
        let mut alert = engine
            .evaluate(&snapshot("carry", date(3), 0.01, 1.0), Utc::now())
            .remove(0);
        alert.acknowledge();
        alert.acknowledge();
        assert!(alert.acknowledged);
    }

    #[test]
    fn test_rule_deserializes_symbolic_operator() {
        let rule: RiskRule = serde_json::from_str(
            r#"{"strategy": "carry", "metric": "cvar99", "comparison": ">=", "threshold": 0.08}"#,
        )
        .unwrap();
        assert_eq!(rule.metric, RiskMetric::Cvar99);
        assert_eq!(rule.comparison, Comparison::GreaterOrEqual);
    }
}
