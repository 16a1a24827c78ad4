//! `/firewall` handlers
//!
//! Plain rules have no index: `PUT` appends (service ports upsert) and
//! `DELETE` removes every entry whose fields match the request body.

use super::{AppState, parse_body};
use crate::audit::EventType;
use crate::core::error::{Error, Result};
use crate::core::firewall::{BlockRule, FirewallConfig, ForwardingRule, ServicePort};
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

type Insert<T> = fn(&mut FirewallConfig, T) -> Result<()>;
type Remove = fn(&mut FirewallConfig, &Value) -> Result<usize>;

pub async fn get_config(State(state): State<AppState>) -> Json<FirewallConfig> {
    Json(state.store.firewall().await)
}

async fn insert<T>(
    state: &AppState,
    kind: &'static str,
    body: &[u8],
    add: Insert<T>,
) -> Result<Json<FirewallConfig>>
where
    T: DeserializeOwned + Send,
{
    let result = async {
        let rule: T = parse_body(body)?;
        let pending = state.begin().await;
        state.store.edit_firewall(|fw| add(fw, rule)).await?;
        state.commit(pending).await
    }
    .await;

    state
        .record(EventType::AddFirewallRule, json!({ "kind": kind }), &result)
        .await;
    result?;
    Ok(Json(state.store.firewall().await))
}

async fn remove(
    state: &AppState,
    kind: &'static str,
    body: &[u8],
    delete: Remove,
) -> Result<Json<Value>> {
    let result = async {
        let pattern: Value = parse_body(body)?;
        let pending = state.begin().await;
        let deleted = state.store.edit_firewall(|fw| delete(fw, &pattern)).await?;
        state.commit(pending).await?;
        Ok::<_, Error>(deleted)
    }
    .await;

    let details = match &result {
        Ok(deleted) => json!({ "kind": kind, "deleted": deleted }),
        Err(_) => json!({ "kind": kind }),
    };
    state
        .record(EventType::DeleteFirewallRules, details, &result)
        .await;
    Ok(Json(json!({ "Deleted": result? })))
}

pub async fn add_forward(State(state): State<AppState>, body: Bytes) -> Result<Json<FirewallConfig>> {
    insert::<ForwardingRule>(&state, "forward", &body, FirewallConfig::add_forward).await
}

pub async fn delete_forward(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    remove(&state, "forward", &body, FirewallConfig::delete_forward).await
}

pub async fn add_block(State(state): State<AppState>, body: Bytes) -> Result<Json<FirewallConfig>> {
    insert::<BlockRule>(&state, "block", &body, FirewallConfig::add_block).await
}

pub async fn delete_block(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    remove(&state, "block", &body, FirewallConfig::delete_block).await
}

pub async fn add_service_port(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<FirewallConfig>> {
    insert::<ServicePort>(&state, "service_port", &body, FirewallConfig::upsert_service_port).await
}

pub async fn delete_service_port(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    remove(&state, "service_port", &body, FirewallConfig::delete_service_port).await
}
