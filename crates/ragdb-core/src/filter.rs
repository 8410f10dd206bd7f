//! Payload predicates for filtered search.
//!
//! Filters are evaluated against the JSON payload stored next to every index
//! entry. Field names may be dotted paths (`source.lang`) that reach into
//! nested objects; an exact top-level key wins over path traversal. When the
//! addressed value is an array, `Eq` and `In` match if any element matches.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result, ValidationError};
use crate::types::Payload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Eq {
        field: String,
        value: Value,
    },
    Range {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gt: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lt: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lte: Option<f64>,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    And {
        filters: Vec<Filter>,
    },
    Or {
        filters: Vec<Filter>,
    },
    Not {
        filter: Box<Filter>,
    },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq { field: field.into(), value: value.into() }
    }

    pub fn one_of<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In { field: field.into(), values: values.into_iter().map(Into::into).collect() }
    }

    /// Inclusive range; either bound may be open.
    pub fn between(field: impl Into<String>, gte: Option<f64>, lte: Option<f64>) -> Self {
        Filter::Range { field: field.into(), gt: None, gte, lt: None, lte }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not { filter: Box::new(filter) }
    }

    /// Parses and validates a JSON filter such as
    /// `{"op":"eq","field":"lang","value":"en"}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let filter: Filter = serde_json::from_str(raw)
            .map_err(|e| Error::Validation(ValidationError::MalformedFilter(e.to_string())))?;
        filter.validate()?;
        Ok(filter)
    }

    pub fn validate(&self) -> Result<()> {
        let malformed = |msg: String| Err(Error::Validation(ValidationError::MalformedFilter(msg)));
        match self {
            Filter::Eq { field, .. } | Filter::In { field, .. } if field.trim().is_empty() => {
                malformed("empty field name".into())
            }
            Filter::In { field, values } if values.is_empty() => malformed(format!("'in' on '{field}' has no values")),
            Filter::Eq { .. } | Filter::In { .. } => Ok(()),
            Filter::Range { field, gt, gte, lt, lte } => {
                if field.trim().is_empty() {
                    return malformed("empty field name".into());
                }
                let bounds = [gt, gte, lt, lte];
                if bounds.iter().all(|b| b.is_none()) {
                    return malformed(format!("range on '{field}' has no bounds"));
                }
                if bounds.iter().any(|b| b.is_some_and(f64::is_nan)) {
                    return malformed(format!("range on '{field}' has a NaN bound"));
                }
                let lower = gt.or(*gte);
                let upper = lt.or(*lte);
                if let (Some(lo), Some(hi)) = (lower, upper) {
                    if lo > hi {
                        return malformed(format!("range on '{field}' is empty ({lo} > {hi})"));
                    }
                }
                Ok(())
            }
            Filter::And { filters } | Filter::Or { filters } => {
                if filters.is_empty() {
                    return malformed("boolean filter with no clauses".into());
                }
                filters.iter().try_for_each(Filter::validate)
            }
            Filter::Not { filter } => filter.validate(),
        }
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            Filter::Eq { field, value } => lookup(payload, field).is_some_and(|v| any_element(v, |x| values_equal(x, value))),
            Filter::In { field, values } => lookup(payload, field)
                .is_some_and(|v| any_element(v, |x| values.iter().any(|candidate| values_equal(x, candidate)))),
            Filter::Range { field, gt, gte, lt, lte } => {
                let Some(x) = lookup(payload, field).and_then(Value::as_f64) else {
                    return false;
                };
                gt.map_or(true, |b| x > b)
                    && gte.map_or(true, |b| x >= b)
                    && lt.map_or(true, |b| x < b)
                    && lte.map_or(true, |b| x <= b)
            }
            Filter::And { filters } => filters.iter().all(|f| f.matches(payload)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(payload)),
            Filter::Not { filter } => !filter.matches(payload),
        }
    }
}

fn lookup<'a>(payload: &'a Payload, field: &str) -> Option<&'a Value> {
    if let Some(v) = payload.get(field) {
        return Some(v);
    }
    let mut parts = field.split('.');
    let mut current = payload.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn any_element(v: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    match v {
        Value::Array(items) => items.iter().any(pred),
        other => pred(other),
    }
}

// 1 and 1.0 compare equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
