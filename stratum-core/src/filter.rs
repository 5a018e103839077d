//! Filter and sort expressions for the find pipeline.
//!
//! [`FilterExpr`] is the serializable single-field comparison; [`Condition`]
//! composes expressions with boolean logic or wraps an arbitrary predicate.
//! [`SortSpec`] defines a multi-key ordering over documents.

use crate::{Document, EntityId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Contains substring (strings) or element (arrays)
    Contains,
    /// In list of values
    In,
    /// Matches regular expression
    Regex,
    /// Field presence equals the boolean operand
    Exists,
}

/// Single-field filter expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Dotted path of the field to filter on
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against
    pub value: Value,
    /// Pattern and compiled form of a `Regex` operand, filled on first evaluation.
    #[serde(skip)]
    compiled: OnceLock<(String, Option<Regex>)>,
}

impl PartialEq for FilterExpr {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.operator == other.operator && self.value == other.value
    }
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            compiled: OnceLock::new(),
        }
    }

    /// Regex for `pattern`, compiled at most once per expression.
    ///
    /// Falls back to a fresh compile if `value` was replaced after the cache
    /// was filled. An invalid pattern matches nothing.
    fn regex_for(&self, pattern: &str) -> Option<Cow<'_, Regex>> {
        let (cached_pattern, cached) = self
            .compiled
            .get_or_init(|| (pattern.to_string(), Regex::new(pattern).ok()));
        if cached_pattern == pattern {
            cached.as_ref().map(Cow::Borrowed)
        } else {
            Regex::new(pattern).ok().map(Cow::Owned)
        }
    }

    /// Evaluate against a document.
    pub fn matches(&self, document: &Document) -> bool {
        let actual = document.get(&self.field);
        match self.operator {
            FilterOperator::Exists => {
                let wanted = self.value.as_bool().unwrap_or(true);
                actual.is_some() == wanted
            }
            FilterOperator::Eq => actual.is_some_and(|v| values_equal(v, &self.value)),
            FilterOperator::Ne => !actual.is_some_and(|v| values_equal(v, &self.value)),
            FilterOperator::Gt => compare_to(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => compare_to(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                compare_to(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                compare_to(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::Contains => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => {
                    items.iter().any(|item| values_equal(item, needle))
                }
                _ => false,
            },
            FilterOperator::In => match (actual, &self.value) {
                (Some(v), Value::Array(candidates)) => {
                    candidates.iter().any(|c| values_equal(v, c))
                }
                _ => false,
            },
            FilterOperator::Regex => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(pattern)) => {
                    self.regex_for(pattern).is_some_and(|re| re.is_match(s))
                }
                _ => false,
            },
        }
    }
}

/// Arbitrary predicate over an `(id, document)` pair.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&EntityId, &Document) -> bool + Send + Sync>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&EntityId, &Document) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn test(&self, id: &EntityId, document: &Document) -> bool {
        (self.0)(id, document)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// Composable filter condition.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Single-field comparison
    Expr(FilterExpr),
    /// Precompiled regular expression match on a string field
    Matches { field: String, regex: Regex },
    /// All sub-conditions hold
    And(Vec<Condition>),
    /// At least one sub-condition holds
    Or(Vec<Condition>),
    /// Negation
    Not(Box<Condition>),
    /// Caller-supplied predicate
    Predicate(Predicate),
}

impl Condition {
    fn expr(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Condition::Expr(FilterExpr::new(field, operator, value))
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::expr(field, FilterOperator::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::expr(field, FilterOperator::Ne, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::expr(field, FilterOperator::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::expr(field, FilterOperator::Gte, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::expr(field, FilterOperator::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::expr(field, FilterOperator::Lte, value)
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::expr(field, FilterOperator::Contains, value)
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::expr(field, FilterOperator::In, Value::Array(values))
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::expr(field, FilterOperator::Exists, true)
    }

    /// Regex match, compiled once up front.
    pub fn regex(field: impl Into<String>, pattern: &str) -> crate::StratumResult<Self> {
        let regex = Regex::new(pattern).map_err(|e| crate::ValidationError::InvalidValue {
            field: "pattern".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Condition::Matches {
            field: field.into(),
            regex,
        })
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&EntityId, &Document) -> bool + Send + Sync + 'static,
    {
        Condition::Predicate(Predicate::new(f))
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::And(mut all) => {
                all.push(other);
                Condition::And(all)
            }
            first => Condition::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Or(mut any) => {
                any.push(other);
                Condition::Or(any)
            }
            first => Condition::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Condition::Not(Box::new(self))
    }

    /// Evaluate against an `(id, document)` pair.
    pub fn matches(&self, id: &EntityId, document: &Document) -> bool {
        match self {
            Condition::Expr(expr) => expr.matches(document),
            Condition::Matches { field, regex } => match document.get(field) {
                Some(Value::String(s)) => regex.is_match(s),
                _ => false,
            },
            Condition::And(all) => all.iter().all(|c| c.matches(id, document)),
            Condition::Or(any) => any.iter().any(|c| c.matches(id, document)),
            Condition::Not(inner) => !inner.matches(id, document),
            Condition::Predicate(p) => p.test(id, document),
        }
    }
}

impl From<FilterExpr> for Condition {
    fn from(expr: FilterExpr) -> Self {
        Condition::Expr(expr)
    }
}

// ============================================================================
// SORTING
// ============================================================================

/// Sort direction for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Multi-key sort, applied left to right.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    keys: Vec<(String, SortOrder)>,
}

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sort key.
    pub fn then(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.keys.push((field.into(), order));
        self
    }

    pub fn push(&mut self, field: impl Into<String>, order: SortOrder) {
        self.keys.push((field.into(), order));
    }

    pub fn keys(&self) -> &[(String, SortOrder)] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Compare two documents by every key in turn.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, order) in &self.keys {
            let ordering = total_order(a.get(field), b.get(field));
            let ordering = match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

// ============================================================================
// VALUE COMPARISON
// ============================================================================

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn compare_to(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    compare_values(actual?, operand)
}

/// Compare two values of the same kind; `None` for mismatched kinds.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                Some(x.cmp(&y))
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                Some(x.cmp(&y))
            } else {
                x.as_f64()?.partial_cmp(&y.as_f64()?)
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn kind_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Total order used for sorting: missing < null < bool < number < string <
/// array < object.
fn total_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let by_kind = kind_rank(a).cmp(&kind_rank(b));
    if by_kind != Ordering::Equal {
        return by_kind;
    }
    match (a, b) {
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ordering = total_order(Some(l), Some(r));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_comparison_operators() {
        let d = doc(json!({"n": 3, "name": "ada"}));
        let id = Uuid::nil();
        assert!(Condition::gt("n", 1).matches(&id, &d));
        assert!(!Condition::gt("n", 3).matches(&id, &d));
        assert!(Condition::gte("n", 3).matches(&id, &d));
        assert!(Condition::lt("n", 3.5).matches(&id, &d));
        assert!(Condition::lte("n", 3).matches(&id, &d));
        assert!(Condition::eq("n", 3.0).matches(&id, &d));
        assert!(Condition::ne("name", "bob").matches(&id, &d));
        assert!(!Condition::gt("name", 1).matches(&id, &d));
    }

    #[test]
    fn test_missing_field_semantics() {
        let d = doc(json!({"n": 1}));
        let id = Uuid::nil();
        assert!(!Condition::eq("missing", 1).matches(&id, &d));
        assert!(Condition::ne("missing", 1).matches(&id, &d));
        assert!(!Condition::lt("missing", 1).matches(&id, &d));
        assert!(Condition::exists("n").matches(&id, &d));
        assert!(!Condition::exists("missing").matches(&id, &d));
    }

    #[test]
    fn test_contains_in_and_regex() {
        let d = doc(json!({"name": "adalovelace", "tags": ["x", 2]}));
        let id = Uuid::nil();
        assert!(Condition::contains("name", "love").matches(&id, &d));
        assert!(Condition::contains("tags", 2).matches(&id, &d));
        assert!(!Condition::contains("tags", "y").matches(&id, &d));
        assert!(Condition::is_in("name", vec![json!("bob"), json!("adalovelace")]).matches(&id, &d));
        assert!(Condition::regex("name", "^ada").unwrap().matches(&id, &d));
        assert!(Condition::regex("name", "(").is_err());
        let expr = FilterExpr::new("name", FilterOperator::Regex, "lace$");
        assert!(Condition::from(expr).matches(&id, &d));
    }

    #[test]
    fn test_regex_operand_compiled_once() {
        let expr = FilterExpr::new("name", FilterOperator::Regex, "^a.*e$");
        let matching = doc(json!({"name": "alice"}));
        let other = doc(json!({"name": "bob"}));
        assert!(expr.compiled.get().is_none());

        assert!(expr.matches(&matching));
        let first = expr.compiled.get().and_then(|(_, re)| re.as_ref()).map(|re| re as *const Regex);
        assert!(!expr.matches(&other));
        let second = expr.compiled.get().and_then(|(_, re)| re.as_ref()).map(|re| re as *const Regex);
        assert!(first.is_some());
        assert_eq!(first, second);

        let mut changed = expr.clone();
        changed.value = json!("^b");
        assert!(changed.matches(&other));
        assert!(!changed.matches(&matching));

        let invalid = FilterExpr::new("name", FilterOperator::Regex, "(");
        assert!(!invalid.matches(&matching));
        assert_eq!(invalid, FilterExpr::new("name", FilterOperator::Regex, "("));
    }

    #[test]
    fn test_boolean_composition() {
        let d = doc(json!({"n": 2}));
        let id = Uuid::nil();
        let c = Condition::gt("n", 1).and(Condition::lt("n", 3));
        assert!(c.matches(&id, &d));
        let c = Condition::gt("n", 5).or(Condition::eq("n", 2));
        assert!(c.matches(&id, &d));
        assert!(!Condition::eq("n", 2).not().matches(&id, &d));
    }

    #[test]
    fn test_predicate_sees_id() {
        let target = Uuid::now_v7();
        let c = Condition::predicate(move |id, _| *id == target);
        assert!(c.matches(&target, &Document::new()));
        assert!(!c.matches(&Uuid::nil(), &Document::new()));
    }

    #[test]
    fn test_sort_spec_multi_key() {
        let a = doc(json!({"team": "red", "score": 1}));
        let b = doc(json!({"team": "red", "score": 5}));
        let c = doc(json!({"team": "blue", "score": 3}));
        let spec = SortSpec::new()
            .then("team", SortOrder::Ascending)
            .then("score", SortOrder::Descending);
        let mut docs = [a.clone(), b.clone(), c.clone()];
        docs.sort_by(|x, y| spec.compare(x, y));
        assert_eq!(docs, [c, b, a]);
    }

    #[test]
    fn test_sort_missing_first() {
        let with = doc(json!({"n": 0}));
        let without = doc(json!({}));
        let spec = SortSpec::new().then("n", SortOrder::Ascending);
        assert_eq!(spec.compare(&without, &with), Ordering::Less);
    }

    #[test]
    fn test_filter_expr_serde() {
        let expr = FilterExpr::new("n", FilterOperator::Gte, 3);
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(json["operator"], json!("gte"));
        let back: FilterExpr = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }
}
