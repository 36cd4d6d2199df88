//! # Condition Evaluation
//!
//! [`ConditionEvaluator`] decides a single condition against an
//! [`EvaluationContext`]; [`ConditionTreeResolver`] folds an ordered list of
//! conditions joined by AND/OR.
//!
//! Evaluation is pure and fail-closed: an absent context field, a value
//! that does not parse, or an operator that makes no sense for the
//! condition type all yield `false`. The reason is logged, never returned.
//!
//! ## Fold Semantics
//!
//! Conditions are taken in `order`. Each condition's `logical_operator`
//! joins it to the **next** one, and the fold is strictly left to right:
//! `[a AND, b OR, c]` is `(a AND b) OR c`. The last condition's join is
//! never read.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::event::{EvaluationContext, EventKind, Severity};

// ---------------------------------------------------------------------------
// Condition model
// ---------------------------------------------------------------------------

/// What a condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// The subject's risk score.
    RiskScore,
    /// Severity rank of the violation.
    ViolationSeverity,
    /// Data volume accessed, in GB.
    DataAccess,
    /// Time of day or the after-hours flag.
    TimeBased,
    /// Recent event count.
    Frequency,
    /// True for any `violation_created` event.
    AnyViolation,
}

impl ConditionType {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RiskScore => "risk_score",
            Self::ViolationSeverity => "violation_severity",
            Self::DataAccess => "data_access",
            Self::TimeBased => "time_based",
            Self::Frequency => "frequency",
            Self::AnyViolation => "any_violation",
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// Numeric equality when both sides are numeric, else case-insensitive text.
    Equals,
    /// Numeric `>`.
    GreaterThan,
    /// Numeric `<`.
    LessThan,
    /// Case-insensitive substring.
    Contains,
    /// Membership in a comma-separated set.
    In,
}

impl ConditionOperator {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::Contains => "contains",
            Self::In => "in",
        }
    }
}

/// Join between a condition and the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    /// Both must hold.
    #[default]
    #[serde(alias = "and")]
    And,
    /// Either may hold.
    #[serde(alias = "or")]
    Or,
}

impl LogicalOperator {
    fn apply(self, lhs: bool, rhs: bool) -> bool {
        match self {
            Self::And => lhs && rhs,
            Self::Or => lhs || rhs,
        }
    }
}

/// A boolean predicate over the evaluation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// What the condition inspects.
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    /// How the context value is compared with `value`.
    pub operator: ConditionOperator,
    /// Comparison operand, interpreted per condition type.
    #[serde(default, deserialize_with = "string_or_scalar")]
    pub value: String,
    /// Join with the next condition.
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    /// 1-based position, assigned at save time.
    #[serde(default)]
    pub order: u32,
}

impl Condition {
    /// Create a condition joined to its successor with AND.
    pub fn new(
        condition_type: ConditionType,
        operator: ConditionOperator,
        value: impl Into<String>,
    ) -> Self {
        Self {
            condition_type,
            operator,
            value: value.into(),
            logical_operator: LogicalOperator::And,
            order: 0,
        }
    }

    /// Builder: join with the next condition using OR.
    pub fn or(mut self) -> Self {
        self.logical_operator = LogicalOperator::Or;
        self
    }

    /// Check that the value is well-formed for the condition type and
    /// operator. Used at save time; evaluation re-derives the same errors.
    pub fn check(&self) -> Result<(), EvaluationError> {
        if self.condition_type == ConditionType::AnyViolation {
            return Ok(());
        }
        let items = operands(self)?;
        for item in items {
            match self.condition_type {
                ConditionType::TimeBased => match parse_clock(item) {
                    Some(_) => {}
                    None => {
                        parse_hours_flag(item)?;
                        if !matches!(
                            self.operator,
                            ConditionOperator::Equals | ConditionOperator::In
                        ) {
                            return Err(EvaluationError::UnsupportedOperator {
                                operator: self.operator.as_str(),
                                condition_type: self.condition_type.as_str(),
                            });
                        }
                    }
                },
                _ => {
                    let numeric = operand_number(self.condition_type, item)?;
                    if numeric.is_none() && is_ordering(self.operator) {
                        return Err(EvaluationError::NonNumeric(item.to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Accept `value: 70` as well as `value: "70"` in policy files.
fn string_or_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Int(n) => n.to_string(),
        Scalar::Float(f) => render_number(f),
        Scalar::Bool(b) => b.to_string(),
    })
}

// ---------------------------------------------------------------------------
// EvaluationError
// ---------------------------------------------------------------------------

/// Why a condition could not be decided. Never escapes the evaluator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// The context lacks the field the condition reads.
    #[error("context field {0} is absent")]
    MissingContext(&'static str),

    /// An ordering comparison got a non-numeric operand.
    #[error("operand \"{0}\" is not numeric")]
    NonNumeric(String),

    /// A severity operand names no known severity.
    #[error("unknown severity \"{0}\"")]
    UnknownSeverity(String),

    /// An `in` operand has no items after trimming.
    #[error("empty set operand")]
    EmptySet,

    /// The operator is meaningless for this condition type.
    #[error("operator {operator} is not supported for {condition_type}")]
    UnsupportedOperator {
        /// Operator name.
        operator: &'static str,
        /// Condition type name.
        condition_type: &'static str,
    },
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates single conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate `condition` against `context`, treating every error as `false`.
    pub fn evaluate(condition: &Condition, context: &EvaluationContext) -> bool {
        match Self::try_evaluate(condition, context) {
            Ok(result) => result,
            Err(err @ EvaluationError::MissingContext(_)) => {
                tracing::debug!(
                    condition_type = condition.condition_type.as_str(),
                    error = %err,
                    "condition not evaluable, treating as false"
                );
                false
            }
            Err(err) => {
                tracing::warn!(
                    condition_type = condition.condition_type.as_str(),
                    operator = condition.operator.as_str(),
                    value = %condition.value,
                    error = %err,
                    "malformed condition, treating as false"
                );
                false
            }
        }
    }

    /// Evaluate `condition`, reporting why it could not be decided.
    pub fn try_evaluate(
        condition: &Condition,
        context: &EvaluationContext,
    ) -> Result<bool, EvaluationError> {
        let observed = match condition.condition_type {
            ConditionType::AnyViolation => {
                return Ok(context.event_kind == EventKind::ViolationCreated);
            }
            ConditionType::RiskScore => context
                .risk_score
                .ok_or(EvaluationError::MissingContext("risk_score"))?,
            ConditionType::ViolationSeverity => context
                .severity_rank
                .map(f64::from)
                .ok_or(EvaluationError::MissingContext("severity_rank"))?,
            ConditionType::DataAccess => context
                .data_volume_gb
                .ok_or(EvaluationError::MissingContext("data_volume_gb"))?,
            ConditionType::Frequency => context
                .recent_event_count
                .map(f64::from)
                .ok_or(EvaluationError::MissingContext("recent_event_count"))?,
            ConditionType::TimeBased => return evaluate_time(condition, context),
        };
        compare_number(condition, observed)
    }
}

// ---------------------------------------------------------------------------
// ConditionTreeResolver
// ---------------------------------------------------------------------------

/// Folds an ordered condition list into one decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionTreeResolver;

impl ConditionTreeResolver {
    /// Resolve `conditions` left to right. An empty list is `true`.
    pub fn resolve(conditions: &[Condition], context: &EvaluationContext) -> bool {
        let mut ordered: Vec<&Condition> = conditions.iter().collect();
        ordered.sort_by_key(|c| c.order);

        let mut iter = ordered.into_iter();
        let Some(first) = iter.next() else {
            return true;
        };
        let mut acc = ConditionEvaluator::evaluate(first, context);
        let mut join = first.logical_operator;
        for condition in iter {
            // Every condition is evaluated so malformed ones are always logged.
            let value = ConditionEvaluator::evaluate(condition, context);
            acc = join.apply(acc, value);
            join = condition.logical_operator;
        }
        acc
    }
}

// ---------------------------------------------------------------------------
// Operand handling
// ---------------------------------------------------------------------------

fn is_ordering(operator: ConditionOperator) -> bool {
    matches!(
        operator,
        ConditionOperator::GreaterThan | ConditionOperator::LessThan
    )
}

/// Split the condition value into operands: one for scalar operators, the
/// trimmed non-empty items for `in`.
fn operands(condition: &Condition) -> Result<Vec<&str>, EvaluationError> {
    if condition.operator == ConditionOperator::In {
        let items: Vec<&str> = condition
            .value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if items.is_empty() {
            return Err(EvaluationError::EmptySet);
        }
        Ok(items)
    } else {
        Ok(vec![condition.value.trim()])
    }
}

/// Numeric reading of an operand. Severity names convert to their rank;
/// an unknown severity name is an error rather than a string operand.
fn operand_number(
    condition_type: ConditionType,
    operand: &str,
) -> Result<Option<f64>, EvaluationError> {
    if let Some(n) = parse_number(operand) {
        return Ok(Some(n));
    }
    if condition_type == ConditionType::ViolationSeverity {
        return Severity::from_name(operand)
            .map(|s| Some(f64::from(s.rank())))
            .ok_or_else(|| EvaluationError::UnknownSeverity(operand.to_string()));
    }
    Ok(None)
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Render a number the way it is compared as text: integral values drop
/// the fraction (`4.0` → `"4"`).
pub(crate) fn render_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn numbers_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9
}

fn equals_operand(
    condition_type: ConditionType,
    observed: f64,
    operand: &str,
) -> Result<bool, EvaluationError> {
    Ok(match operand_number(condition_type, operand)? {
        Some(n) => numbers_equal(observed, n),
        None => render_number(observed).eq_ignore_ascii_case(operand),
    })
}

fn compare_number(condition: &Condition, observed: f64) -> Result<bool, EvaluationError> {
    if !observed.is_finite() {
        return Err(EvaluationError::NonNumeric(observed.to_string()));
    }
    let ct = condition.condition_type;
    match condition.operator {
        ConditionOperator::Equals => equals_operand(ct, observed, condition.value.trim()),
        ConditionOperator::Contains => Ok(render_number(observed)
            .to_lowercase()
            .contains(&condition.value.trim().to_lowercase())),
        ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
            let operand = condition.value.trim();
            let rhs = operand_number(ct, operand)?
                .ok_or_else(|| EvaluationError::NonNumeric(operand.to_string()))?;
            Ok(if condition.operator == ConditionOperator::GreaterThan {
                observed > rhs
            } else {
                observed < rhs
            })
        }
        ConditionOperator::In => {
            for item in operands(condition)? {
                if equals_operand(ct, observed, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// time_based
// ---------------------------------------------------------------------------

/// Parse `"18"` or `"18:30"` to fractional hours.
fn parse_clock(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Some((h, m)) = s.split_once(':') {
        let h: u32 = h.trim().parse().ok()?;
        let m: u32 = m.trim().parse().ok()?;
        if h > 24 || m >= 60 || (h == 24 && m > 0) {
            return None;
        }
        return Some(h as f64 + m as f64 / 60.0);
    }
    parse_number(s)
}

/// Parse an after-hours flag: `true` means "after hours".
fn parse_hours_flag(s: &str) -> Result<bool, EvaluationError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "after_hours" | "true" | "yes" => Ok(true),
        "business_hours" | "false" | "no" => Ok(false),
        other => Err(EvaluationError::NonNumeric(other.to_string())),
    }
}

fn evaluate_time(
    condition: &Condition,
    context: &EvaluationContext,
) -> Result<bool, EvaluationError> {
    let items = operands(condition)?;
    let clock = items.iter().all(|item| parse_clock(item).is_some());
    if clock {
        let hour = context.hour_of_day;
        return match condition.operator {
            ConditionOperator::Equals | ConditionOperator::In => Ok(items
                .iter()
                .filter_map(|item| parse_clock(item))
                .any(|h| numbers_equal(hour, h))),
            ConditionOperator::GreaterThan => Ok(parse_clock(items[0]).is_some_and(|h| hour > h)),
            ConditionOperator::LessThan => Ok(parse_clock(items[0]).is_some_and(|h| hour < h)),
            ConditionOperator::Contains => Ok(render_number(hour)
                .to_lowercase()
                .contains(&condition.value.trim().to_lowercase())),
        };
    }
    match condition.operator {
        ConditionOperator::Equals | ConditionOperator::In => {
            for item in items {
                if parse_hours_flag(item)? == context.is_after_hours {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(EvaluationError::UnsupportedOperator {
            operator: other.as_str(),
            condition_type: condition.condition_type.as_str(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConditionOperator::*;
    use ConditionType::*;

    fn ctx() -> EvaluationContext {
        EvaluationContext {
            risk_score: Some(85.0),
            severity_rank: Some(4),
            data_volume_gb: Some(2.5),
            recent_event_count: Some(7),
            hour_of_day: 19.5,
            is_after_hours: true,
            event_kind: EventKind::RiskUpdated,
        }
    }

    fn eval(t: ConditionType, op: ConditionOperator, v: &str) -> bool {
        ConditionEvaluator::evaluate(&Condition::new(t, op, v), &ctx())
    }

    #[test]
    fn numeric_comparisons() {
        assert!(eval(RiskScore, GreaterThan, "70"));
        assert!(!eval(RiskScore, LessThan, "70"));
        assert!(eval(RiskScore, Equals, "85"));
        assert!(eval(RiskScore, Equals, "85.0"));
        assert!(eval(DataAccess, GreaterThan, "2"));
        assert!(eval(Frequency, In, "3, 7 ,9"));
    }

    #[test]
    fn severity_names_convert_to_rank() {
        assert!(eval(ViolationSeverity, Equals, "Critical"));
        assert!(eval(ViolationSeverity, Equals, "critical"));
        assert!(eval(ViolationSeverity, GreaterThan, "High"));
        assert!(!eval(ViolationSeverity, LessThan, "Medium"));
        assert!(eval(ViolationSeverity, In, "High,Critical"));
        assert!(eval(ViolationSeverity, Equals, "4"));
    }

    #[test]
    fn unknown_severity_is_an_error() {
        let c = Condition::new(ViolationSeverity, Equals, "Catastrophic");
        assert_eq!(
            ConditionEvaluator::try_evaluate(&c, &ctx()),
            Err(EvaluationError::UnknownSeverity("Catastrophic".into()))
        );
        assert!(!ConditionEvaluator::evaluate(&c, &ctx()));
    }

    #[test]
    fn non_numeric_ordering_fails_closed() {
        let c = Condition::new(RiskScore, GreaterThan, "high");
        assert!(matches!(
            ConditionEvaluator::try_evaluate(&c, &ctx()),
            Err(EvaluationError::NonNumeric(_))
        ));
        assert!(!eval(RiskScore, GreaterThan, "NaN"));
    }

    #[test]
    fn missing_context_fails_closed() {
        let mut context = ctx();
        context.risk_score = None;
        let c = Condition::new(RiskScore, GreaterThan, "10");
        assert_eq!(
            ConditionEvaluator::try_evaluate(&c, &context),
            Err(EvaluationError::MissingContext("risk_score"))
        );
        assert!(!ConditionEvaluator::evaluate(&c, &context));
    }

    #[test]
    fn contains_uses_rendered_number() {
        assert!(eval(RiskScore, Contains, "8"));
        assert!(!eval(RiskScore, Contains, "9"));
    }

    #[test]
    fn empty_set_is_an_error() {
        let c = Condition::new(Frequency, In, " , ,");
        assert_eq!(
            ConditionEvaluator::try_evaluate(&c, &ctx()),
            Err(EvaluationError::EmptySet)
        );
    }

    #[test]
    fn time_based_clock_values() {
        assert!(eval(TimeBased, GreaterThan, "18"));
        assert!(eval(TimeBased, GreaterThan, "19:00"));
        assert!(!eval(TimeBased, GreaterThan, "20:15"));
        assert!(eval(TimeBased, Equals, "19:30"));
        assert!(eval(TimeBased, LessThan, "22"));
    }

    #[test]
    fn clock_past_midnight_is_rejected() {
        assert!(Condition::new(TimeBased, LessThan, "24:00").check().is_ok());
        for value in ["24:01", "24:59", "25:00", "23:60"] {
            let c = Condition::new(TimeBased, LessThan, value);
            assert!(c.check().is_err(), "{value}");
            assert!(ConditionEvaluator::try_evaluate(&c, &ctx()).is_err(), "{value}");
        }
    }

    #[test]
    fn time_based_flags() {
        assert!(eval(TimeBased, Equals, "after_hours"));
        assert!(eval(TimeBased, Equals, "TRUE"));
        assert!(!eval(TimeBased, Equals, "business_hours"));
        assert!(eval(TimeBased, In, "business_hours,after_hours"));
        let c = Condition::new(TimeBased, GreaterThan, "after_hours");
        assert!(matches!(
            ConditionEvaluator::try_evaluate(&c, &ctx()),
            Err(EvaluationError::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn any_violation_ignores_operator_and_value() {
        let mut context = ctx();
        let c = Condition::new(AnyViolation, GreaterThan, "whatever");
        assert!(!ConditionEvaluator::evaluate(&c, &context));
        context.event_kind = EventKind::ViolationCreated;
        assert!(ConditionEvaluator::evaluate(&c, &context));
    }

    #[test]
    fn fold_is_left_to_right() {
        let t = Condition::new(RiskScore, GreaterThan, "0");
        let f = Condition::new(RiskScore, LessThan, "0");
        let numbered = |mut cs: Vec<Condition>| {
            for (i, c) in cs.iter_mut().enumerate() {
                c.order = i as u32 + 1;
            }
            cs
        };
        // (f AND t) OR t == true
        let list = numbered(vec![f.clone(), t.clone().or(), t.clone()]);
        assert!(ConditionTreeResolver::resolve(&list, &ctx()));
        // (t OR f) AND f == false
        let list = numbered(vec![t.clone().or(), f.clone(), f.clone()]);
        assert!(!ConditionTreeResolver::resolve(&list, &ctx()));
        assert!(ConditionTreeResolver::resolve(&[], &ctx()));
    }

    #[test]
    fn fold_respects_order_field() {
        let mut first = Condition::new(RiskScore, LessThan, "0").or();
        first.order = 1;
        let mut second = Condition::new(RiskScore, GreaterThan, "0");
        second.order = 2;
        // Stored out of position: order field wins.
        assert!(ConditionTreeResolver::resolve(&[second, first], &ctx()));
    }

    #[test]
    fn check_flags_malformed_values() {
        assert!(Condition::new(RiskScore, GreaterThan, "70").check().is_ok());
        assert!(Condition::new(RiskScore, GreaterThan, "lots").check().is_err());
        assert!(Condition::new(ViolationSeverity, Equals, "Severe").check().is_err());
        assert!(Condition::new(TimeBased, Equals, "after_hours").check().is_ok());
        assert!(Condition::new(TimeBased, Equals, "lunchtime").check().is_err());
        assert!(Condition::new(Frequency, In, ",").check().is_err());
        assert!(Condition::new(AnyViolation, Equals, "").check().is_ok());
    }

    #[test]
    fn value_accepts_numbers_in_documents() {
        let c: Condition = serde_json::from_str(
            r#"{"type":"risk_score","operator":"greater_than","value":70}"#,
        )
        .unwrap();
        assert_eq!(c.value, "70");
        assert_eq!(c.logical_operator, LogicalOperator::And);
        let c: Condition = serde_json::from_str(
            r#"{"type":"data_access","operator":"equals","value":2.5,"logical_operator":"OR"}"#,
        )
        .unwrap();
        assert_eq!(c.value, "2.5");
        assert_eq!(c.logical_operator, LogicalOperator::Or);
    }
}
