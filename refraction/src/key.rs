//! Composite identifiers and the conditions built from them.

use std::hash::{Hash, Hasher};

use sea_orm::sea_query::{Alias, Condition, Expr, Keyword, SimpleExpr};
use serde_json::Value;

use crate::error::{RelationError, Result};
use crate::Record;

/// Ordered tuple of scalar values identifying a row through one or more columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeKey(Vec<Value>);

impl Eq for CompositeKey {}

impl Hash for CompositeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for value in &self.0 {
            value.to_string().hash(state);
        }
    }
}

impl CompositeKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Reads `props` from `record`; absent properties become null.
    pub fn from_record(record: &Record, props: &[String]) -> Self {
        Self(
            props
                .iter()
                .map(|prop| record.get(prop).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }

    /// Writes the key into `record` under `props`.
    pub fn assign(&self, record: &mut Record, props: &[String]) {
        for (prop, value) in props.iter().zip(&self.0) {
            record.insert(prop.clone(), value.clone());
        }
    }

    pub fn to_record(&self, props: &[String]) -> Record {
        let mut record = Record::new();
        self.assign(&mut record, props);
        record
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.0.clone())
    }
}

/// Normalises the many accepted identifier shapes into a list of keys of
/// arity `props.len()`.
pub fn normalize_ids(input: &Value, props: &[String]) -> Result<Vec<CompositeKey>> {
    let arity = props.len();
    if arity == 0 {
        return Err(RelationError::invalid_ids("no key columns to normalize against"));
    }

    match input {
        Value::Null => Ok(Vec::new()),
        Value::Object(record) => Ok(vec![key_from_object(record, props)?]),
        Value::Array(items) if items.is_empty() => Ok(Vec::new()),
        Value::Array(items) if items.iter().all(Value::is_object) => items
            .iter()
            .filter_map(Value::as_object)
            .map(|record| key_from_object(record, props))
            .collect(),
        Value::Array(items) if items.iter().all(Value::is_array) => items
            .iter()
            .filter_map(Value::as_array)
            .map(|tuple| {
                if tuple.len() != arity {
                    return Err(RelationError::invalid_ids(format!(
                        "expected tuples of {} values, got {}",
                        arity,
                        tuple.len()
                    )));
                }
                check_scalars(tuple)?;
                Ok(CompositeKey::new(tuple.clone()))
            })
            .collect(),
        Value::Array(items) => {
            check_scalars(items)?;
            if items.len() % arity != 0 {
                return Err(RelationError::invalid_ids(format!(
                    "{} values cannot be split into keys of {} columns",
                    items.len(),
                    arity
                )));
            }
            Ok(items
                .chunks(arity)
                .map(|chunk| CompositeKey::new(chunk.to_vec()))
                .collect())
        }
        scalar => {
            if arity != 1 {
                return Err(RelationError::invalid_ids(format!(
                    "a single value cannot identify a key of {} columns",
                    arity
                )));
            }
            Ok(vec![CompositeKey::new(vec![scalar.clone()])])
        }
    }
}

fn key_from_object(record: &Record, props: &[String]) -> Result<CompositeKey> {
    let mut values = Vec::with_capacity(props.len());
    for prop in props {
        match record.get(prop) {
            Some(value) if !value.is_object() && !value.is_array() => values.push(value.clone()),
            Some(_) => {
                return Err(RelationError::invalid_ids(format!(
                    "property \"{}\" is not a scalar",
                    prop
                )))
            }
            None => {
                return Err(RelationError::invalid_ids(format!(
                    "object is missing key property \"{}\"",
                    prop
                )))
            }
        }
    }
    Ok(CompositeKey::new(values))
}

fn check_scalars(values: &[Value]) -> Result<()> {
    if values.iter().any(|v| v.is_object() || v.is_array()) {
        return Err(RelationError::invalid_ids("mixed identifier shapes"));
    }
    Ok(())
}

/// Removes duplicate keys keeping first occurrence order.
pub fn unique_keys(keys: impl IntoIterator<Item = CompositeKey>) -> Vec<CompositeKey> {
    let mut seen = std::collections::HashSet::new();
    keys.into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

pub fn json_to_db_value(value: &Value) -> sea_orm::Value {
    match value {
        Value::Null => sea_orm::Value::String(None),
        Value::Bool(b) => sea_orm::Value::Bool(Some(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                sea_orm::Value::BigInt(Some(i))
            } else if let Some(u) = n.as_u64() {
                sea_orm::Value::BigUnsigned(Some(u))
            } else {
                sea_orm::Value::Double(n.as_f64())
            }
        }
        Value::String(s) => sea_orm::Value::String(Some(Box::new(s.clone()))),
        other => sea_orm::Value::Json(Some(Box::new(other.clone()))),
    }
}

/// Value expression for an INSERT or UPDATE; null becomes the `NULL` keyword.
pub fn json_to_expr(value: &Value) -> SimpleExpr {
    match value {
        Value::Null => SimpleExpr::Keyword(Keyword::Null),
        other => SimpleExpr::Value(json_to_db_value(other)),
    }
}

pub(crate) fn column(table: &str, column: &str) -> Expr {
    Expr::col((Alias::new(table), Alias::new(column)))
}

fn false_condition() -> Condition {
    Condition::all().add(Expr::cust("1 = 0"))
}

/// `table.c1 = v1 AND table.c2 = v2 ...`, matching nulls with `IS NULL`.
pub fn where_composite(table: &str, columns: &[String], key: &CompositeKey) -> Condition {
    columns
        .iter()
        .zip(key.values())
        .fold(Condition::all(), |cond, (col, value)| {
            if value.is_null() {
                cond.add(column(table, col).is_null())
            } else {
                cond.add(column(table, col).eq(json_to_db_value(value)))
            }
        })
}

/// Membership of the column tuple in `keys`. An empty key list never matches.
pub fn where_in_composite(table: &str, columns: &[String], keys: &[CompositeKey]) -> Condition {
    if keys.is_empty() {
        return false_condition();
    }
    if let [single] = columns {
        let values: Vec<sea_orm::Value> = keys
            .iter()
            .filter_map(|key| key.values().first())
            .filter(|v| !v.is_null())
            .map(json_to_db_value)
            .collect();
        if values.is_empty() {
            return false_condition();
        }
        return Condition::all().add(column(table, single).is_in(values));
    }
    keys.iter().fold(Condition::any(), |cond, key| {
        cond.add(where_composite(table, columns, key))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn props(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn scalar_and_object_inputs() {
        let id = props(&["id"]);
        assert_eq!(
            normalize_ids(&json!(5), &id).unwrap(),
            vec![CompositeKey::new(vec![json!(5)])]
        );
        assert_eq!(
            normalize_ids(&json!({"id": 7, "name": "x"}), &id).unwrap(),
            vec![CompositeKey::new(vec![json!(7)])]
        );
        assert_eq!(normalize_ids(&json!([1, 2, 3]), &id).unwrap().len(), 3);
    }

    #[test]
    fn composite_inputs() {
        let pk = props(&["a", "b"]);
        let keys = normalize_ids(&json!([[1, "x"], [2, "y"]]), &pk).unwrap();
        assert_eq!(keys[1], CompositeKey::new(vec![json!(2), json!("y")]));

        let flat = normalize_ids(&json!([1, "x", 2, "y"]), &pk).unwrap();
        assert_eq!(flat, keys);

        let objects = normalize_ids(&json!([{"a": 1, "b": "x"}, {"a": 2, "b": "y"}]), &pk).unwrap();
        assert_eq!(objects, keys);
    }

    #[test]
    fn arity_mismatches_fail() {
        let pk = props(&["a", "b"]);
        assert!(normalize_ids(&json!(1), &pk).is_err());
        assert!(normalize_ids(&json!([1, 2, 3]), &pk).is_err());
        assert!(normalize_ids(&json!([[1, 2, 3]]), &pk).is_err());
        assert!(normalize_ids(&json!({"a": 1}), &pk).is_err());
        assert!(normalize_ids(&json!([[1, 2], 3]), &pk).is_err());
    }

    #[test]
    fn normalizing_is_idempotent() {
        let pk = props(&["a", "b"]);
        for input in [
            json!([1, 2, 3, 4]),
            json!([[1, 2]]),
            json!({"a": 1, "b": 2}),
            json!([{"a": "x", "b": null}]),
        ] {
            let once = normalize_ids(&input, &pk).unwrap();
            let rendered = Value::Array(once.iter().map(CompositeKey::to_value).collect());
            assert_eq!(normalize_ids(&rendered, &pk).unwrap(), once);
        }
    }

    #[test]
    fn keys_hash_by_value() {
        let keys = unique_keys(vec![
            CompositeKey::new(vec![json!(1)]),
            CompositeKey::new(vec![json!(2)]),
            CompositeKey::new(vec![json!(1)]),
        ]);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].values(), &[json!(1)]);
    }
}
