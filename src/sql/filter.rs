//! Filter vocabulary shared by callers, views, RLS and the SQL builder.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Contains,
    StartsWith,
    EndsWith,
    In,
    Nin,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Like => "like",
            Operator::Contains => "contains",
            Operator::StartsWith => "startswith",
            Operator::EndsWith => "endswith",
            Operator::In => "in",
            Operator::Nin => "nin",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive. Accepts the canonical names plus the symbolic and long-form
/// aliases that appear in stored RLS and workflow conditions.
impl FromStr for Operator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_lowercase().as_str() {
            "eq" | "=" | "==" | "equals" => Operator::Eq,
            "neq" | "ne" | "!=" | "<>" | "not_equals" => Operator::Neq,
            "gt" | ">" | "greater_than" => Operator::Gt,
            "gte" | ">=" | "greater_than_or_equal" => Operator::Gte,
            "lt" | "<" | "less_than" => Operator::Lt,
            "lte" | "<=" | "less_than_or_equal" => Operator::Lte,
            "like" => Operator::Like,
            "contains" => Operator::Contains,
            "startswith" | "starts_with" => Operator::StartsWith,
            "endswith" | "ends_with" => Operator::EndsWith,
            "in" => Operator::In,
            "nin" | "not_in" | "notin" => Operator::Nin,
            other => return Err(EngineError::QueryBuild(format!("unknown operator '{}'", other))),
        };
        Ok(op)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

impl Relation {
    pub fn keyword(self) -> &'static str {
        match self {
            Relation::And => "AND",
            Relation::Or => "OR",
        }
    }
}

impl FromStr for Relation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "and" => Ok(Relation::And),
            "or" => Ok(Relation::Or),
            other => Err(format!("invalid relation: {} (expected and or or)", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Filter {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::new(field, Operator::Eq, value)
    }
}

/// A node of the WHERE tree. Every source of restriction (tenant, caller, view, RLS)
/// contributes predicates; the builder renders the complete list once.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Filter(Filter),
    Group {
        relation: Relation,
        predicates: Vec<Predicate>,
    },
    Constant(bool),
}

impl From<Filter> for Predicate {
    fn from(f: Filter) -> Self {
        Predicate::Filter(f)
    }
}

impl Predicate {
    pub fn all(predicates: Vec<Predicate>) -> Self {
        Predicate::Group {
            relation: Relation::And,
            predicates,
        }
    }

    pub fn any(predicates: Vec<Predicate>) -> Self {
        Predicate::Group {
            relation: Relation::Or,
            predicates,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

impl FromStr for SortDirection {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(EngineError::QueryBuild(format!("invalid sort direction '{}'", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        SortSpec {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        SortSpec {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Parse filters from either a list of `{field, operator|op, value}` objects or a
/// map form `{field: value}` / `{field: {op: value, ...}}`.
pub fn parse_filters(raw: &Value) -> Result<Vec<Filter>, EngineError> {
    match raw {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(parse_filter_object).collect(),
        Value::Object(map) => parse_filter_map(map),
        other => Err(EngineError::QueryBuild(format!("filters must be an array or object, got {}", other))),
    }
}

fn parse_filter_object(item: &Value) -> Result<Filter, EngineError> {
    let field = item
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::QueryBuild("filter is missing 'field'".into()))?;
    let op = item
        .get("operator")
        .or_else(|| item.get("op"))
        .and_then(Value::as_str)
        .unwrap_or("eq");
    let value = item.get("value").cloned().unwrap_or(Value::Null);
    Ok(Filter::new(field, op.parse()?, value))
}

fn parse_filter_map(map: &Map<String, Value>) -> Result<Vec<Filter>, EngineError> {
    let mut out = Vec::new();
    for (field, spec) in map {
        match spec {
            Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.parse::<Operator>().is_ok()) => {
                for (op, value) in ops {
                    out.push(Filter::new(field.clone(), op.parse()?, value.clone()));
                }
            }
            other => out.push(Filter::eq(field.clone(), other.clone())),
        }
    }
    Ok(out)
}
