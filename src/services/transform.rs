use crate::errors::{ToolError, ToolErrorKind};
use crate::utils::data_path::{lookup_path, set_path_value};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl FilterOp {
    fn parse(raw: &str) -> Result<Self, ToolError> {
        Ok(match raw {
            "eq" => FilterOp::Eq,
            "neq" | "ne" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "contains" => FilterOp::Contains,
            other => {
                return Err(invalid_transform(format!(
                    "Unknown filter operator: {}",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub enum TransformOp {
    Filter {
        field: String,
        op: FilterOp,
        value: Value,
    },
    Sort {
        field: String,
        direction: SortDirection,
    },
    Select {
        fields: Vec<String>,
    },
    Limit {
        count: i64,
    },
}

/// Ordered, declarative reshaping of a response body. Parsing rejects unknown
/// shapes eagerly; applying is total over heterogeneous records.
#[derive(Debug, Clone, Default)]
pub struct TransformSpec {
    ops: Vec<TransformOp>,
}

fn invalid_transform(message: impl Into<String>) -> ToolError {
    ToolError::new(ToolErrorKind::InvalidParams, "INVALID_TRANSFORM", message)
}

impl TransformSpec {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Accepts either the canonical array form (`[{"op": "filter", ...},
    /// ...]`, applied in declared order) or the shorthand object form
    /// (`{"filter": ..., "sort": ..., "select": ..., "limit": ...}`, applied
    /// in that fixed order).
    pub fn parse(raw: &Value) -> Result<Self, ToolError> {
        match raw {
            Value::Null => Ok(Self::default()),
            Value::Array(items) => {
                let mut ops = Vec::with_capacity(items.len());
                for item in items {
                    ops.push(parse_op_object(item)?);
                }
                Ok(Self { ops })
            }
            Value::Object(map) => {
                let mut ops = Vec::new();
                for key in map.keys() {
                    if !matches!(key.as_str(), "filter" | "sort" | "select" | "limit") {
                        return Err(invalid_transform(format!(
                            "Unknown transform key: {}",
                            key
                        )));
                    }
                }
                if let Some(filters) = map.get("filter") {
                    match filters {
                        Value::Array(items) => {
                            for item in items {
                                ops.push(parse_filter(item)?);
                            }
                        }
                        Value::Object(_) => ops.push(parse_filter(filters)?),
                        _ => {
                            return Err(invalid_transform(
                                "filter must be an object or an array of objects",
                            ))
                        }
                    }
                }
                if let Some(sort) = map.get("sort") {
                    ops.push(parse_sort(sort)?);
                }
                if let Some(select) = map.get("select") {
                    ops.push(parse_select(select)?);
                }
                if let Some(limit) = map.get("limit") {
                    ops.push(parse_limit(limit)?);
                }
                Ok(Self { ops })
            }
            _ => Err(invalid_transform(
                "Transform spec must be an object or an array of operations",
            )),
        }
    }

    /// Pure pipeline over the response body. A single-object body is treated
    /// as a one-element sequence and unwrapped again when exactly one record
    /// remains.
    pub fn apply(&self, body: &Value) -> Value {
        let was_sequence = body.is_array();
        let mut records: Vec<Value> = match body {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };

        for op in self.ops.iter() {
            records = apply_op(op, records);
        }

        if !was_sequence && records.len() == 1 {
            if let Some(single) = records.pop() {
                return single;
            }
        }
        Value::Array(records)
    }
}

fn parse_op_object(item: &Value) -> Result<TransformOp, ToolError> {
    let map = item
        .as_object()
        .ok_or_else(|| invalid_transform("Each transform operation must be an object"))?;
    let op = map
        .get("op")
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid_transform("Transform operation is missing 'op'"))?;
    match op {
        "filter" => parse_filter(item),
        "sort" => parse_sort(item),
        "select" => parse_select(
            map.get("fields")
                .ok_or_else(|| invalid_transform("select requires 'fields'"))?,
        ),
        "limit" => parse_limit(
            map.get("count")
                .ok_or_else(|| invalid_transform("limit requires 'count'"))?,
        ),
        other => Err(invalid_transform(format!(
            "Unknown transform operation: {}",
            other
        ))),
    }
}

fn parse_filter(raw: &Value) -> Result<TransformOp, ToolError> {
    let map = raw
        .as_object()
        .ok_or_else(|| invalid_transform("filter must be an object"))?;
    let field = map
        .get("field")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid_transform("filter requires a non-empty 'field'"))?;
    let operator = map
        .get("operator")
        .and_then(|v| v.as_str())
        .unwrap_or("eq");
    let value = map
        .get("value")
        .cloned()
        .ok_or_else(|| invalid_transform("filter requires 'value'"))?;
    Ok(TransformOp::Filter {
        field: field.to_string(),
        op: FilterOp::parse(operator)?,
        value,
    })
}

fn parse_sort(raw: &Value) -> Result<TransformOp, ToolError> {
    let (field, direction) = match raw {
        Value::String(field) => (field.clone(), "asc".to_string()),
        Value::Object(map) => {
            let field = map
                .get("field")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| invalid_transform("sort requires a non-empty 'field'"))?;
            let direction = map
                .get("direction")
                .and_then(|v| v.as_str())
                .unwrap_or("asc");
            (field.to_string(), direction.to_string())
        }
        _ => return Err(invalid_transform("sort must be an object or a field name")),
    };
    let direction = match direction.to_lowercase().as_str() {
        "asc" => SortDirection::Asc,
        "desc" => SortDirection::Desc,
        other => {
            return Err(invalid_transform(format!(
                "Unknown sort direction: {}",
                other
            )))
        }
    };
    Ok(TransformOp::Sort { field, direction })
}

fn parse_select(raw: &Value) -> Result<TransformOp, ToolError> {
    let items = raw
        .as_array()
        .ok_or_else(|| invalid_transform("select must be an array of field paths"))?;
    let mut fields = Vec::with_capacity(items.len());
    for item in items {
        let field = item
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid_transform("select fields must be non-empty strings"))?;
        fields.push(field.to_string());
    }
    Ok(TransformOp::Select { fields })
}

fn parse_limit(raw: &Value) -> Result<TransformOp, ToolError> {
    let count = raw
        .as_i64()
        .ok_or_else(|| invalid_transform("limit must be an integer"))?;
    Ok(TransformOp::Limit { count })
}

fn apply_op(op: &TransformOp, records: Vec<Value>) -> Vec<Value> {
    match op {
        TransformOp::Filter { field, op, value } => records
            .into_iter()
            .filter(|record| filter_matches(record, field, *op, value))
            .collect(),
        TransformOp::Sort { field, direction } => {
            let mut out = records;
            // Vec::sort_by is stable; equal keys keep their input order, and
            // records missing the field always land after present ones.
            out.sort_by(|a, b| {
                let ka = lookup_sort_key(a, field);
                let kb = lookup_sort_key(b, field);
                match (ka, kb) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Greater,
                    (Some(_), None) => Ordering::Less,
                    (Some(left), Some(right)) => {
                        let ord = compare_present(&left, &right);
                        match direction {
                            SortDirection::Asc => ord,
                            SortDirection::Desc => ord.reverse(),
                        }
                    }
                }
            });
            out
        }
        TransformOp::Select { fields } => records
            .into_iter()
            .map(|record| project_record(&record, fields))
            .collect(),
        TransformOp::Limit { count } => {
            if *count <= 0 {
                return Vec::new();
            }
            let mut out = records;
            out.truncate(*count as usize);
            out
        }
    }
}

fn lookup_field<'a>(record: &'a Value, field: &str) -> Option<&'a Value> {
    match lookup_path(record, field) {
        Some(Value::Null) | None => None,
        Some(value) => Some(value),
    }
}

fn lookup_sort_key(record: &Value, field: &str) -> Option<Value> {
    lookup_field(record, field).cloned()
}

/// Records missing the field, or with a value the operator cannot compare,
/// are excluded rather than failing the pipeline.
fn filter_matches(record: &Value, field: &str, op: FilterOp, expected: &Value) -> bool {
    let Some(actual) = lookup_field(record, field) else {
        return false;
    };
    match op {
        FilterOp::Eq => values_equal(actual, expected),
        FilterOp::Neq => !values_equal(actual, expected),
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            let Some(ord) = compare_comparable(actual, expected) else {
                return false;
            };
            match op {
                FilterOp::Gt => ord == Ordering::Greater,
                FilterOp::Gte => ord != Ordering::Less,
                FilterOp::Lt => ord == Ordering::Less,
                FilterOp::Lte => ord != Ordering::Greater,
                _ => unreachable!(),
            }
        }
        FilterOp::Contains => value_contains(actual, expected).unwrap_or(false),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

/// Ordering across same-kind values only; anything else is incomparable.
fn compare_comparable(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

/// Total order for sorting mixed-type present values: numbers, then strings,
/// then booleans, then everything else by its serialized form.
fn compare_present(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Number(_) => 0,
            Value::String(_) => 1,
            Value::Bool(_) => 2,
            _ => 3,
        }
    }
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn value_contains(haystack: &Value, needle: &Value) -> Option<bool> {
    match haystack {
        Value::String(text) => {
            let fragment = match needle {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some(text.contains(&fragment))
        }
        Value::Array(items) => Some(items.iter().any(|item| values_equal(item, needle))),
        _ => None,
    }
}

/// Projects a record down to the selected dotted paths. Fields absent from a
/// record are dropped silently since records may be heterogeneous.
fn project_record(record: &Value, fields: &[String]) -> Value {
    let mut out = Value::Object(Default::default());
    for field in fields {
        if let Some(value) = lookup_path(record, field) {
            set_path_value(&mut out, field, value.clone());
        }
    }
    out
}
