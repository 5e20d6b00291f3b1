use alloy_primitives::U256;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

/// Predicate over one field of a JSON row. Field names are the serialized
/// (snake_case) names of the row type.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    In(String, Vec<Value>),
    Between(String, Value, Value),
    Lte(String, Value),
    Gte(String, Value),
    IsNull(String),
    NotNull(String),
    ArrayContains(String, Value),
}

/// Conjunction of [`Condition`]s; an empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn eq(self, field: &str, value: impl Serialize) -> Self {
        self.with(Condition::Eq(field.to_owned(), json(value)))
    }

    pub fn is_in<V: Serialize>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(json).collect();
        self.with(Condition::In(field.to_owned(), values))
    }

    pub fn between(self, field: &str, low: impl Serialize, high: impl Serialize) -> Self {
        self.with(Condition::Between(field.to_owned(), json(low), json(high)))
    }

    pub fn lte(self, field: &str, value: impl Serialize) -> Self {
        self.with(Condition::Lte(field.to_owned(), json(value)))
    }

    pub fn gte(self, field: &str, value: impl Serialize) -> Self {
        self.with(Condition::Gte(field.to_owned(), json(value)))
    }

    pub fn is_null(self, field: &str) -> Self {
        self.with(Condition::IsNull(field.to_owned()))
    }

    pub fn not_null(self, field: &str) -> Self {
        self.with(Condition::NotNull(field.to_owned()))
    }

    pub fn array_contains(self, field: &str, value: impl Serialize) -> Self {
        self.with(Condition::ArrayContains(field.to_owned(), json(value)))
    }

    /// Appends every condition of `other`.
    pub fn and(mut self, other: Filter) -> Self {
        self.conditions.extend(other.conditions);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|condition| condition.matches(row))
    }
}

impl Condition {
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Condition::Eq(field, expected) => field_of(row, field)
                .map(|value| compare(value, expected) == Some(Ordering::Equal))
                .unwrap_or(false),
            Condition::In(field, candidates) => field_of(row, field)
                .map(|value| {
                    candidates
                        .iter()
                        .any(|candidate| compare(value, candidate) == Some(Ordering::Equal))
                })
                .unwrap_or(false),
            Condition::Between(field, low, high) => field_of(row, field)
                .map(|value| {
                    matches!(compare(value, low), Some(Ordering::Greater | Ordering::Equal))
                        && matches!(compare(value, high), Some(Ordering::Less | Ordering::Equal))
                })
                .unwrap_or(false),
            Condition::Lte(field, bound) => field_of(row, field)
                .map(|value| matches!(compare(value, bound), Some(Ordering::Less | Ordering::Equal)))
                .unwrap_or(false),
            Condition::Gte(field, bound) => field_of(row, field)
                .map(|value| {
                    matches!(compare(value, bound), Some(Ordering::Greater | Ordering::Equal))
                })
                .unwrap_or(false),
            Condition::IsNull(field) => field_of(row, field).is_none(),
            Condition::NotNull(field) => field_of(row, field).is_some(),
            Condition::ArrayContains(field, needle) => match field_of(row, field) {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| compare(item, needle) == Some(Ordering::Equal)),
                _ => false,
            },
        }
    }
}

/// Sort direction for [`Page::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Offset/limit window plus an optional sort field. Rows without an explicit
/// sort come back in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub offset: usize,
    pub limit: Option<usize>,
    pub order_by: Option<(String, SortOrder)>,
}

impl Page {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn sorted_by(mut self, field: &str, order: SortOrder) -> Self {
        self.order_by = Some((field.to_owned(), order));
        self
    }
}

fn json(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Looks up a field, treating JSON `null` as absent.
pub(crate) fn field_of<'v>(row: &'v Value, field: &str) -> Option<&'v Value> {
    row.get(field).filter(|value| !value.is_null())
}

/// Orders two JSON scalars. Numbers compare numerically; `0x` strings are
/// compared as 256-bit integers so hex-encoded amounts sort correctly;
/// other strings compare case-insensitively.
pub(crate) fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_u64(), b.as_u64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => match (parse_hex(a), parse_hex(b)) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => Some(a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())),
        },
        (Value::Number(a), Value::String(b)) => {
            Some(U256::from(a.as_u64()?).cmp(&parse_hex(b)?))
        }
        (Value::String(a), Value::Number(b)) => {
            Some(parse_hex(a)?.cmp(&U256::from(b.as_u64()?)))
        }
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => (left == right).then_some(Ordering::Equal),
    }
}

fn parse_hex(value: &str) -> Option<U256> {
    let digits = value.strip_prefix("0x")?;
    if digits.is_empty() || digits.len() > 64 {
        return None;
    }
    U256::from_str_radix(digits, 16).ok()
}
