//! Deterministic filter/sort/limit queries over a repository's state.
//!
//! A query is compiled by a storage adapter into a candidate set (latest
//! event per live record, plus latest Delete per erased record when
//! `with_deleted` is set) and then finished here: filter, stable sort with
//! an `event_id` tie-break, offset, limit. Two runs against an unchanged
//! store return identical sequences.

use std::cmp::Ordering;

use itertools::Itertools as _;
use keel_core::{Event, Payload};
use serde_json::Value;

#[cfg(test)]
mod tests;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Membership in a JSON array argument. An empty array matches nothing.
    In,
    /// Field is absent or `null`. Pass `false` as the argument to ask for
    /// the opposite ("is set").
    IsNull,
}

#[derive(Clone, Debug)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Clone, Debug)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

#[derive(Clone, Debug)]
pub struct Query {
    repository: String,
    filters: Vec<Filter>,
    sort: Vec<SortSpec>,
    limit: Option<usize>,
    offset: usize,
    include_deleted: bool,
}

impl Query {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            filters: Vec::new(),
            sort: Vec::new(),
            limit: None,
            offset: 0,
            include_deleted: false,
        }
    }

    pub fn where_field(
        mut self,
        field: impl Into<String>,
        op: FilterOp,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.sort.push(SortSpec {
            field: field.into(),
            descending,
        });
        self
    }

    pub fn limit_to(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Also surface erased records through their latest Delete event.
    ///
    /// Delete events carry no payload: they satisfy `IsNull` filters and
    /// fail every value filter.
    pub fn with_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn include_deleted(&self) -> bool {
        self.include_deleted
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.filters
            .iter()
            .all(|filter| filter.matches(event.payload()))
    }

    /// Filter, sort, offset and limit a candidate set.
    pub fn apply(&self, candidates: Vec<Event>) -> Vec<Event> {
        candidates
            .into_iter()
            .filter(|event| self.matches(event))
            .sorted_by(|a, b| self.compare(a, b))
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }

    fn compare(&self, a: &Event, b: &Event) -> Ordering {
        for key in &self.sort {
            let ord = compare_sort_values(field_of(a, &key.field), field_of(b, &key.field));
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.event_id.cmp(&b.event_id)
    }
}

impl Filter {
    fn matches(&self, payload: Option<&Payload>) -> bool {
        let field_value = payload.and_then(|p| p.get(&self.field));
        match self.op {
            FilterOp::IsNull => {
                let is_null = field_value.is_none_or(Value::is_null);
                match self.value {
                    Value::Bool(false) => !is_null,
                    _ => is_null,
                }
            }
            FilterOp::Eq => field_value.is_some_and(|v| values_equal(v, &self.value)),
            FilterOp::In => match (&self.value, field_value) {
                (Value::Array(options), Some(v)) => {
                    options.iter().any(|option| values_equal(v, option))
                }
                _ => false,
            },
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => field_value
                .and_then(|v| compare_values(v, &self.value))
                .is_some_and(|ord| match self.op {
                    FilterOp::Gt => ord == Ordering::Greater,
                    FilterOp::Gte => ord != Ordering::Less,
                    FilterOp::Lt => ord == Ordering::Less,
                    FilterOp::Lte => ord != Ordering::Greater,
                    _ => unreachable!("Ordering arm matches ordering ops only"),
                }),
        }
    }
}

fn field_of<'e>(event: &'e Event, field: &str) -> Option<&'e Value> {
    event.payload().and_then(|payload| payload.get(field))
}

/// Equality with numeric widening (`1 == 1.0`); everything else is strict
/// JSON equality.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering across same-kind scalars; `None` for mixed or non-scalar
/// operands (ordering filters then reject the row).
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order for sort keys: missing and `null` sort first, then by kind,
/// then within kind. Composite values tie and fall through to the
/// `event_id` tie-break.
fn compare_sort_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => Ordering::Equal,
    })
}
