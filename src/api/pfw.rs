//! `/plugins/pfw` handlers

use super::{AppState, parse_body};
use crate::audit::EventType;
use crate::core::compiler::Clock;
use crate::core::error::{Error, Result};
use crate::core::expr::{self, ExprReport};
use crate::core::rules::{Config, MASKED};
use crate::core::store::{StoredRule, TaskRun};
use crate::core::tasks::{TaskConfig, TaskName};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

fn parse_index(raw: &str) -> Result<usize> {
    raw.parse()
        .map_err(|_| Error::validation("index", format!("'{raw}' is not a rule index")))
}

pub async fn get_config(State(state): State<AppState>) -> Json<Config> {
    Json(state.store.masked_config().await)
}

// ═══════════════════════════════════════════════════════════════════════════
// Indexed buckets
// ═══════════════════════════════════════════════════════════════════════════

pub async fn add_rule<T>(State(state): State<AppState>, body: Bytes) -> Result<Json<T>>
where
    T: StoredRule + Serialize + DeserializeOwned,
{
    let result = async {
        let rule: T = parse_body(&body)?;
        let pending = state.begin().await;
        let added = state.store.add(rule).await?;
        state.commit(pending).await?;
        Ok::<_, Error>(added)
    }
    .await;

    let details = match &result {
        Ok((index, _)) => json!({ "bucket": T::BUCKET.to_string(), "index": index }),
        Err(_) => json!({ "bucket": T::BUCKET.to_string() }),
    };
    state.record(EventType::AddRule, details, &result).await;

    let (_, stored) = result?;
    Ok(Json(stored.redacted()))
}

pub async fn update_rule<T>(
    State(state): State<AppState>,
    Path(index): Path<String>,
    body: Bytes,
) -> Result<Json<T>>
where
    T: StoredRule + Serialize + DeserializeOwned,
{
    let result = async {
        let index = parse_index(&index)?;
        let rule: T = parse_body(&body)?;
        let pending = state.begin().await;
        let updated = state.store.update(index, rule).await?;
        state.commit(pending).await?;
        Ok::<_, Error>(updated)
    }
    .await;

    let details = json!({ "bucket": T::BUCKET.to_string(), "index": index });
    state.record(EventType::UpdateRule, details, &result).await;

    Ok(Json(result?.redacted()))
}

pub async fn delete_rule<T>(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Json<T>>
where
    T: StoredRule + Serialize,
{
    let result = async {
        let index = parse_index(&index)?;
        let pending = state.begin().await;
        let removed = state.store.delete::<T>(index).await?;
        state.commit(pending).await?;
        Ok::<_, Error>(removed)
    }
    .await;

    let details = json!({ "bucket": T::BUCKET.to_string(), "index": index });
    state.record(EventType::DeleteRule, details, &result).await;

    Ok(Json(result?.redacted()))
}

/// `DELETE` on the unindexed path: the body is the rule to remove.
pub async fn delete_matching_rule<T>(State(state): State<AppState>, body: Bytes) -> Result<Json<T>>
where
    T: StoredRule + Serialize + DeserializeOwned + PartialEq,
{
    let result = async {
        let rule: T = parse_body(&body)?;
        let pending = state.begin().await;
        let removed = state.store.delete_matching(rule).await?;
        state.commit(pending).await?;
        Ok::<_, Error>(removed)
    }
    .await;

    let details = match &result {
        Ok((index, _)) => json!({ "bucket": T::BUCKET.to_string(), "index": index }),
        Err(_) => json!({ "bucket": T::BUCKET.to_string() }),
    };
    state.record(EventType::DeleteRule, details, &result).await;

    let (_, removed) = result?;
    Ok(Json(removed.redacted()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Variables
// ═══════════════════════════════════════════════════════════════════════════

/// Variables are stored as strings; clients may send numbers and booleans.
fn variable_value(body: &[u8]) -> Result<String> {
    match parse_body::<Value>(body)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(Error::validation(
            "value",
            "expected a string, number or boolean",
        )),
    }
}

pub async fn get_variable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<String>> {
    Ok(Json(state.store.get_variable(&name).await?))
}

pub async fn set_variable(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<String>> {
    let result = async {
        let value = variable_value(&body)?;
        let pending = state.begin().await;
        state.store.set_variable(&name, value.clone()).await?;
        state.commit(pending).await?;
        Ok::<_, Error>(value)
    }
    .await;

    state
        .record(EventType::SetVariable, json!({ "name": name }), &result)
        .await;
    Ok(Json(result?))
}

pub async fn delete_variable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let result = async {
        let pending = state.begin().await;
        state.store.delete_variable(&name).await?;
        state.commit(pending).await
    }
    .await;

    state
        .record(EventType::DeleteVariable, json!({ "name": name }), &result)
        .await;
    result?;
    Ok(Json(json!({})))
}

// ═══════════════════════════════════════════════════════════════════════════
// Expressions
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExprRequest {
    Bare(String),
    Object {
        #[serde(rename = "Expr")]
        expr: String,
        /// Overrides for the stored variables, this evaluation only
        #[serde(rename = "Variables", default)]
        variables: BTreeMap<String, String>,
    },
}

/// Dry-run evaluation; nothing is stored.
pub async fn test_expression(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExprReport>> {
    let mut variables = state.store.variables().await;
    let input = match parse_body::<ExprRequest>(&body)? {
        ExprRequest::Bare(expr) => expr,
        ExprRequest::Object {
            expr,
            variables: overrides,
        } => {
            variables.extend(overrides);
            expr
        }
    };
    Ok(Json(expr::test(&input, &variables)))
}

// ═══════════════════════════════════════════════════════════════════════════
// Token
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenRequest {
    Bare(String),
    Object {
        #[serde(rename = "APIToken")]
        token: String,
    },
}

/// Stores the API token; the response never carries it.
pub async fn set_token(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    let result = async {
        let token = match parse_body::<TokenRequest>(&body)? {
            TokenRequest::Bare(token) | TokenRequest::Object { token } => token,
        };
        let pending = state.begin().await;
        state.store.set_token(&token).await?;
        state.save(pending).await
    }
    .await;

    state.record(EventType::SetToken, json!({}), &result).await;
    result?;
    Ok(Json(json!({ "APIToken": MASKED })))
}

// ═══════════════════════════════════════════════════════════════════════════
// Tasks
// ═══════════════════════════════════════════════════════════════════════════

pub async fn task_config(State(state): State<AppState>) -> Json<TaskConfig> {
    Json(state.store.tasks().await)
}

pub async fn configure_task(
    State(state): State<AppState>,
    Path(task): Path<String>,
    body: Bytes,
) -> Result<Json<TaskConfig>> {
    let result = async {
        let name = TaskName::parse(&task)?;
        let document: Value = parse_body(&body)?;
        let pending = state.begin().await;
        state.store.configure_task(name, document).await?;
        state.save(pending).await
    }
    .await;

    state
        .record(EventType::ConfigureTask, json!({ "task": task }), &result)
        .await;
    result?;
    Ok(Json(state.store.tasks().await))
}

/// Records a run request for the task's owning service to pick up.
pub async fn run_task(
    State(state): State<AppState>,
    Path(task): Path<String>,
) -> Result<Json<TaskRun>> {
    let result = async {
        let name = TaskName::parse(&task)?;
        let pending = state.begin().await;
        let run = state.store.request_task_run(name, Clock::now().unix).await;
        state.save(pending).await?;
        Ok::<_, Error>(run)
    }
    .await;

    state
        .record(EventType::RunTask, json!({ "task": task }), &result)
        .await;
    Ok(Json(result?))
}

// ═══════════════════════════════════════════════════════════════════════════
// Compiled maps
// ═══════════════════════════════════════════════════════════════════════════

pub async fn list_maps(State(state): State<AppState>) -> Json<Value> {
    let compiled = state.engine.current();
    let maps: Vec<Value> = compiled
        .maps
        .iter()
        .map(|map| {
            json!({
                "Name": map.name,
                "Table": map.table,
                "Elements": map.elements.len(),
            })
        })
        .collect();
    Json(json!({
        "Maps": maps,
        "Warnings": compiled.warnings,
        "Checksum": compiled.checksum,
        "CompiledAt": compiled.compiled_at,
        "ApplyError": compiled.apply_error,
    }))
}

/// One map in `nft -j list map` form.
pub async fn get_map(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let compiled = state.engine.current();
    compiled
        .maps
        .get(&name)
        .map(|map| Json(map.to_list_json()))
        .ok_or_else(|| Error::not_found(format!("map '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index() {
        assert_eq!(parse_index("0").unwrap(), 0);
        assert_eq!(parse_index("12").unwrap(), 12);
        assert!(matches!(parse_index("-1"), Err(Error::Validation { .. })));
        assert!(matches!(parse_index("one"), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_variable_value_forms() {
        assert_eq!(variable_value(br#""away""#).unwrap(), "away");
        assert_eq!(variable_value(b"42").unwrap(), "42");
        assert_eq!(variable_value(b"true").unwrap(), "true");
        assert!(variable_value(b"[1]").is_err());
        assert!(variable_value(b"").is_err());
    }

    #[test]
    fn test_expr_request_forms() {
        assert!(matches!(
            serde_json::from_str::<ExprRequest>(r#""hour > 3""#).unwrap(),
            ExprRequest::Bare(_)
        ));
        let ExprRequest::Object { expr, variables } =
            serde_json::from_str(r#"{"Expr": "mode == \"away\"", "Variables": {"mode": "away"}}"#)
                .unwrap()
        else {
            panic!("expected object form");
        };
        assert_eq!(expr, r#"mode == "away""#);
        assert_eq!(variables["mode"], "away");
    }
}
