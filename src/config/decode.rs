//! Row decoding for system tables. JSON columns may arrive as text or as JSON values;
//! a column that fails to decode falls back to its type's default and the load continues.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

pub type Row = Map<String, Value>;

/// Decode a JSON column, falling back to `T::default()` on absence or parse failure.
pub fn decode_or_default<T>(row: &Row, column: &str, table: &str) -> T
where
    T: DeserializeOwned + Default,
{
    let parsed = match row.get(column) {
        None | Some(Value::Null) => return T::default(),
        Some(Value::String(s)) if s.trim().is_empty() => return T::default(),
        Some(Value::String(s)) => serde_json::from_str::<T>(s),
        Some(v) => serde_json::from_value::<T>(v.clone()),
    };
    parsed.unwrap_or_else(|e| {
        tracing::warn!(table = %table, column = %column, id = %row_id(row), error = %e, "invalid json column, using default");
        T::default()
    })
}

/// Decode a JSON column that holds an arbitrary value (e.g. `default_value`).
pub fn decode_value(row: &Row, column: &str) -> Option<Value> {
    match row.get(column) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))),
        Some(v) => Some(v.clone()),
    }
}

/// String column; numbers are rendered, null and absence give `""`.
pub fn row_str(row: &Row, column: &str) -> String {
    row_opt_str(row, column).unwrap_or_default()
}

pub fn row_opt_str(row: &Row, column: &str) -> Option<String> {
    match row.get(column) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

/// Boolean column stored as bool, integer or text (`true`, `t`, `1`).
pub fn row_bool(row: &Row, column: &str) -> bool {
    match row.get(column) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "t" | "1" | "yes"),
        _ => false,
    }
}

pub fn row_i64(row: &Row, column: &str) -> i64 {
    match row.get(column) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Row id rendered as text; ids may be stored as text or integers.
pub fn row_id(row: &Row) -> String {
    row_str(row, "id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RlsConfig;
    use crate::sql::Relation;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn decodes_text_and_native_json() {
        let r = row(json!({ "id": 1, "a": "{\"k\": 1}", "b": { "k": 2 } }));
        let a: Map<String, Value> = decode_or_default(&r, "a", "system_entities");
        let b: Map<String, Value> = decode_or_default(&r, "b", "system_entities");
        assert_eq!(a["k"], json!(1));
        assert_eq!(b["k"], json!(2));
    }

    #[test]
    fn malformed_json_falls_back() {
        let r = row(json!({ "id": "r1", "metadata": "{not json", "actions": "oops", "rls_config": "[" }));
        let m: Map<String, Value> = decode_or_default(&r, "metadata", "system_entities");
        let a: Vec<Value> = decode_or_default(&r, "actions", "system_workflows");
        let rls: RlsConfig = decode_or_default(&r, "rls_config", "system_rls");
        assert!(m.is_empty());
        assert!(a.is_empty());
        assert_eq!(rls.relation, Relation::And);
        assert!(rls.conditions.is_empty());
    }

    #[test]
    fn scalar_helpers() {
        let r = row(json!({ "id": 7, "on": 1, "off": "false", "t": "t", "n": "12", "d": "\"x\"" }));
        assert_eq!(row_id(&r), "7");
        assert!(row_bool(&r, "on"));
        assert!(!row_bool(&r, "off"));
        assert!(row_bool(&r, "t"));
        assert!(!row_bool(&r, "missing"));
        assert_eq!(row_i64(&r, "n"), 12);
        assert_eq!(decode_value(&r, "d"), Some(json!("x")));
        assert_eq!(decode_value(&r, "missing"), None);
    }
}
