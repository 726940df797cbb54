//! Field-level transformation application.
//!
//! `direct`, `cast`, `uppercase`, `lowercase` and `default` run in-process;
//! `function` and `expression` call the external transformation service
//! synchronously with a deadline.

use std::str::FromStr;
use std::time::Duration;

use redb_types::errors::ErrorKind;
use redb_types::models::{JsonRow, TransformationRule, TransformationType};
use redb_types::serde::Deserialize;
use redb_types::serde_json::{json, Number, Value};

/// Client for the external transformation service. Calls are synchronous
/// JSON POSTs carrying a deadline derived from pipeline back-pressure policy.
#[derive(Debug, Clone)]
pub struct TransformationClient {
    endpoint: String,
    deadline: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(crate = "redb_types::serde")]
struct TransformResponse {
    value: Value,
}

impl TransformationClient {
    pub fn new(endpoint: impl Into<String>, deadline: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            deadline,
            http: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn apply(
        &self,
        rule: &TransformationRule,
        value: &Value,
        row: &JsonRow,
    ) -> Result<Value, ErrorKind> {
        let request = json!({
            "transformation_type": rule.transformation_type,
            "function": rule.function,
            "column": rule.source_column,
            "value": value,
            "row": row,
            "parameters": rule.parameters,
        });
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.deadline)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ErrorKind::DeadlineExceeded
                } else {
                    ErrorKind::ConnectionFailed(Box::new(e))
                }
            })?;
        let response = response
            .error_for_status()
            .map_err(|e| ErrorKind::ConnectionFailed(Box::new(e)))?;
        let body: TransformResponse = response
            .json()
            .await
            .map_err(|e| ErrorKind::ConnectionFailed(Box::new(e)))?;
        Ok(body.value)
    }
}

/// Applies the ordered rule list to one row. Columns no rule names pass
/// through unchanged; a rule renaming a column removes the source field.
pub async fn apply_rules(
    data: JsonRow,
    rules: &[TransformationRule],
    client: Option<&TransformationClient>,
) -> Result<JsonRow, ErrorKind> {
    let mut row = data;
    for rule in rules {
        let value = row.get(&rule.source_column).cloned().unwrap_or(Value::Null);
        let transformed = match rule.transformation_type {
            TransformationType::Direct => value,
            TransformationType::Uppercase => map_string(value, str::to_uppercase),
            TransformationType::Lowercase => map_string(value, str::to_lowercase),
            TransformationType::Cast => cast_value(value, rule)?,
            TransformationType::Default => {
                if value.is_null() {
                    rule.parameters.get("value").cloned().unwrap_or(Value::Null)
                } else {
                    value
                }
            }
            TransformationType::Function | TransformationType::Expression => {
                let client = client.ok_or_else(|| {
                    ErrorKind::InvalidConfiguration(format!(
                        "rule on `{}` needs a transformation endpoint",
                        rule.source_column
                    ))
                })?;
                client.apply(rule, &value, &row).await?
            }
        };
        if rule.target_column != rule.source_column {
            row.remove(&rule.source_column);
        }
        row.insert(rule.target_column.clone(), transformed);
    }
    Ok(row)
}

fn map_string(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        other => other,
    }
}

fn cast_value(value: Value, rule: &TransformationRule) -> Result<Value, ErrorKind> {
    let target = rule
        .parameters
        .get("to")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ErrorKind::InvalidConfiguration(format!(
                "cast rule on `{}` is missing the `to` parameter",
                rule.source_column
            ))
        })?;
    if value.is_null() {
        return Ok(Value::Null);
    }

    let cast_err = || {
        ErrorKind::InvalidQuery(format!(
            "cannot cast `{}` value {value} to {target}",
            rule.source_column
        ))
    };

    match target {
        "string" | "text" => Ok(Value::String(match value {
            Value::String(s) => s,
            other => other.to_string(),
        })),
        "int64" | "integer" => {
            let n = match &value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                Value::Bool(b) => Some(i64::from(*b)),
                _ => None,
            };
            n.map(|v| Value::Number(v.into())).ok_or_else(cast_err)
        }
        "float64" | "double" => {
            let n = match &value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => f64::from_str(s.trim()).ok(),
                _ => None,
            };
            n.and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(cast_err)
        }
        "boolean" | "bool" => {
            let b = match &value {
                Value::Bool(b) => Some(*b),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" => Some(true),
                    "false" | "f" | "0" => Some(false),
                    _ => None,
                },
                Value::Number(n) => n.as_i64().map(|v| v != 0),
                _ => None,
            };
            b.map(Value::Bool).ok_or_else(cast_err)
        }
        other => Err(ErrorKind::InvalidConfiguration(format!(
            "unknown cast target `{other}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb_types::models::TransformationRule as Rule;

    fn row(pairs: &[(&str, Value)]) -> JsonRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn uppercase_leaves_other_columns_alone() {
        let data = row(&[("id", json!(5)), ("name", json!("eve"))]);
        let rules = [Rule::unary(TransformationType::Uppercase, "name", "name")];
        let out = apply_rules(data, &rules, None).await.unwrap();
        assert_eq!(out.get("name"), Some(&json!("EVE")));
        assert_eq!(out.get("id"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn rules_apply_in_order() {
        let data = row(&[("name", json!("Eve"))]);
        let rules = [
            Rule::unary(TransformationType::Lowercase, "name", "name"),
            Rule::unary(TransformationType::Uppercase, "name", "name"),
        ];
        let out = apply_rules(data, &rules, None).await.unwrap();
        assert_eq!(out.get("name"), Some(&json!("EVE")));
    }

    #[tokio::test]
    async fn rename_removes_source_field() {
        let data = row(&[("name", json!("eve"))]);
        let rules = [Rule::direct("name", "full_name")];
        let out = apply_rules(data, &rules, None).await.unwrap();
        assert!(out.get("name").is_none());
        assert_eq!(out.get("full_name"), Some(&json!("eve")));
    }

    #[tokio::test]
    async fn cast_to_int() {
        let data = row(&[("age", json!("42"))]);
        let mut rule = Rule::unary(TransformationType::Cast, "age", "age");
        rule.parameters.insert("to".to_string(), json!("int64"));
        let out = apply_rules(data, &[rule], None).await.unwrap();
        assert_eq!(out.get("age"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn cast_failure_is_invalid_query() {
        let data = row(&[("age", json!("not-a-number"))]);
        let mut rule = Rule::unary(TransformationType::Cast, "age", "age");
        rule.parameters.insert("to".to_string(), json!("int64"));
        let err = apply_rules(data, &[rule], None).await.unwrap_err();
        assert!(matches!(err, ErrorKind::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn default_fills_missing_values() {
        let data = row(&[("region", Value::Null)]);
        let mut rule = Rule::unary(TransformationType::Default, "region", "region");
        rule.parameters.insert("value".to_string(), json!("eu"));
        let out = apply_rules(data, &[rule], None).await.unwrap();
        assert_eq!(out.get("region"), Some(&json!("eu")));
    }

    #[tokio::test]
    async fn function_rule_without_endpoint_is_rejected() {
        let data = row(&[("name", json!("eve"))]);
        let mut rule = Rule::unary(TransformationType::Function, "name", "name");
        rule.function = Some("initials".to_string());
        let err = apply_rules(data, &[rule], None).await.unwrap_err();
        assert!(matches!(err, ErrorKind::InvalidConfiguration(_)));
    }
}
