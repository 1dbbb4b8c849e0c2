//! Record validation from field definitions. Collects every failure instead of stopping at the first.

use crate::config::{EntityConfiguration, FieldDefinition, FieldType, ValidationRules};
use crate::error::FieldError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

pub struct RecordValidator;

impl RecordValidator {
    /// Validate a full record for create. Every required field must be present and non-null.
    pub fn validate(config: &EntityConfiguration, data: &Map<String, Value>) -> Vec<FieldError> {
        let mut errors = Vec::new();
        for field in config.stored_fields().filter(|f| f.is_active) {
            match data.get(&field.name) {
                None | Some(Value::Null) if field.is_required => {
                    errors.push(FieldError::new(
                        field.name.clone(),
                        "required",
                        format!("{} is required", field.name),
                    ));
                }
                Some(v) => validate_field(field, v, &mut errors),
                None => {}
            }
        }
        errors
    }

    /// Validate only the fields present in `data` (update). Required fields may be absent but not nulled.
    pub fn validate_partial(config: &EntityConfiguration, data: &Map<String, Value>) -> Vec<FieldError> {
        let mut errors = Vec::new();
        for (name, v) in data {
            let Some(field) = config.field(name).filter(|f| f.is_active) else {
                continue;
            };
            if v.is_null() && field.is_required {
                errors.push(FieldError::new(name.clone(), "required", format!("{} is required", name)));
                continue;
            }
            validate_field(field, v, &mut errors);
        }
        errors
    }
}

fn validate_field(field: &FieldDefinition, v: &Value, errors: &mut Vec<FieldError>) {
    if v.is_null() {
        return;
    }
    let col = field.name.as_str();
    if !matches_type(field.field_type, v) {
        errors.push(FieldError::new(
            col,
            "invalid_type",
            format!("{} must be of type {}", col, field.field_type.as_str()),
        ));
        return;
    }
    check_rules(col, v, &field.validation_rules, errors);
}

fn matches_type(ty: FieldType, v: &Value) -> bool {
    match ty {
        FieldType::String => v.is_string(),
        FieldType::Reference => v.is_string() || v.is_number(),
        FieldType::Number => v.is_number(),
        FieldType::Integer => v.is_i64() || v.is_u64() || v.as_f64().is_some_and(|f| f.fract() == 0.0),
        FieldType::Boolean => v.is_boolean(),
        FieldType::Date => v
            .as_str()
            .is_some_and(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || is_datetime(s)),
        FieldType::Datetime => v.as_str().is_some_and(is_datetime),
        FieldType::Json => true,
        FieldType::Object => v.is_object(),
        FieldType::Array => v.is_array(),
        FieldType::Computed => true,
    }
}

fn is_datetime(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid"))
}

fn check_rules(col: &str, v: &Value, rules: &ValidationRules, errors: &mut Vec<FieldError>) {
    if let Some(s) = v.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = rules.min_length {
            if len < min {
                errors.push(FieldError::new(
                    col,
                    "min_length",
                    format!("{} must be at least {} characters", col, min),
                ));
            }
        }
        if let Some(max) = rules.max_length {
            if len > max {
                errors.push(FieldError::new(
                    col,
                    "max_length",
                    format!("{} must be at most {} characters", col, max),
                ));
            }
        }
        if let Some(pattern) = &rules.pattern {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(s) => {}
                Ok(_) => errors.push(FieldError::new(
                    col,
                    "pattern",
                    format!("{} does not match required pattern", col),
                )),
                Err(_) => errors.push(FieldError::new(col, "pattern", format!("invalid pattern for {}", col))),
            }
        }
        if rules.email && !email_re().is_match(s) {
            errors.push(FieldError::new(col, "email", format!("{} must be a valid email", col)));
        }
    }
    if let Some(n) = v.as_f64() {
        if let Some(min) = rules.min {
            if n < min {
                errors.push(FieldError::new(col, "min", format!("{} must be at least {}", col, min)));
            }
        }
        if let Some(max) = rules.max {
            if n > max {
                errors.push(FieldError::new(col, "max", format!("{} must be at most {}", col, max)));
            }
        }
    }
    if let Some(allowed) = &rules.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            errors.push(FieldError::new(
                col,
                "enum",
                format!(
                    "{} must be one of: {:?}",
                    col,
                    allowed.iter().take(5).collect::<Vec<_>>()
                ),
            ));
        }
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}
