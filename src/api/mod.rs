//! REST surface
//!
//! - `/plugins/pfw/...`: indexed PFW rule CRUD (`DELETE` without an index
//!   removes the rule matching the body), variables, token, tasks and
//!   compiled map inspection
//! - `/firewall/...`: the plain firewall rules with delete-by-attributes
//!
//! Every accepted mutation is persisted, handed to the compiler service and
//! written to the audit trail, in that order. A mutation whose save fails is
//! rolled back before the error is returned. Errors are returned as
//! `{"error": "<message>"}` with the status chosen by [`Error`].

pub mod auth;
mod firewall;
mod pfw;

use crate::audit::{AuditLog, EventType};
use crate::config::{AuthConfig, save_state};
use crate::core::engine::Engine;
use crate::core::error::{Error, Result};
use crate::core::rules::{BlockRule, ForwardRule, GroupRule, SiteVpn, TagRule};
use crate::core::store::{PersistedState, RuleStore};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router, middleware};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RuleStore>,
    pub engine: Arc<Engine>,
    pub auth: Arc<AuthConfig>,
    audit: Option<Arc<AuditLog>>,
    state_path: Option<Arc<PathBuf>>,
    persist_lock: Arc<Mutex<()>>,
}

impl AppState {
    /// State without persistence, audit or credentials.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            store: Arc::clone(engine.store()),
            engine,
            auth: Arc::new(AuthConfig::default()),
            audit: None,
            state_path: None,
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(Arc::new(audit));
        self
    }

    pub fn with_state_path(mut self, path: PathBuf) -> Self {
        self.state_path = Some(Arc::new(path));
        self
    }

    /// Serializes the mutation that follows with its save. Dropping the
    /// returned guard without saving leaves the store as the mutation left it.
    async fn begin(&self) -> Pending<'_> {
        let guard = self.persist_lock.lock().await;
        let checkpoint = match &self.state_path {
            Some(_) => Some(self.store.export().await),
            None => None,
        };
        Pending {
            _guard: guard,
            checkpoint,
        }
    }

    /// Writes the store to the state file, if one is configured. A failed
    /// write puts the store back to the checkpoint taken by [`Self::begin`].
    async fn save(&self, pending: Pending<'_>) -> Result<()> {
        let (Some(path), Some(checkpoint)) = (&self.state_path, pending.checkpoint) else {
            return Ok(());
        };
        let state = self.store.export().await;
        if let Err(e) = save_state(path, &state).await {
            warn!(error = %e, "State not saved, rolling back the change");
            self.store.restore(checkpoint).await;
            // The ticker may have compiled the rolled back change meanwhile
            self.engine.notify().await;
            return Err(e);
        }
        Ok(())
    }

    /// Saves, then lets the compiler service pick up the change.
    async fn commit(&self, pending: Pending<'_>) -> Result<()> {
        self.save(pending).await?;
        self.engine.notify().await;
        Ok(())
    }

    async fn record<T>(&self, event: EventType, details: Value, outcome: &Result<T>) {
        if let Some(audit) = &self.audit {
            let outcome = match outcome {
                Ok(_) => Ok(()),
                Err(e) => Err(e.to_string()),
            };
            audit.record(event, details, outcome).await;
        }
    }
}

/// An in-flight mutation: holds the writer lock and the pre-mutation state
struct Pending<'a> {
    _guard: MutexGuard<'a, ()>,
    checkpoint: Option<PersistedState>,
}

/// Builds the full router with auth applied to mutating requests.
pub fn router(state: AppState) -> Router {
    let pfw = Router::new()
        .route("/config", get(pfw::get_config))
        .route(
            "/block",
            put(pfw::add_rule::<BlockRule>).delete(pfw::delete_matching_rule::<BlockRule>),
        )
        .route(
            "/block/{index}",
            put(pfw::update_rule::<BlockRule>).delete(pfw::delete_rule::<BlockRule>),
        )
        .route(
            "/forward",
            put(pfw::add_rule::<ForwardRule>).delete(pfw::delete_matching_rule::<ForwardRule>),
        )
        .route(
            "/forward/{index}",
            put(pfw::update_rule::<ForwardRule>).delete(pfw::delete_rule::<ForwardRule>),
        )
        .route(
            "/tag",
            put(pfw::add_rule::<TagRule>).delete(pfw::delete_matching_rule::<TagRule>),
        )
        .route(
            "/tag/{index}",
            put(pfw::update_rule::<TagRule>).delete(pfw::delete_rule::<TagRule>),
        )
        .route(
            "/group",
            put(pfw::add_rule::<GroupRule>).delete(pfw::delete_matching_rule::<GroupRule>),
        )
        .route(
            "/group/{index}",
            put(pfw::update_rule::<GroupRule>).delete(pfw::delete_rule::<GroupRule>),
        )
        .route(
            "/sitevpns",
            put(pfw::add_rule::<SiteVpn>).delete(pfw::delete_matching_rule::<SiteVpn>),
        )
        .route(
            "/sitevpns/{index}",
            put(pfw::update_rule::<SiteVpn>).delete(pfw::delete_rule::<SiteVpn>),
        )
        .route(
            "/variable/{name}",
            get(pfw::get_variable)
                .put(pfw::set_variable)
                .delete(pfw::delete_variable),
        )
        .route("/testExpression", post(pfw::test_expression))
        .route("/token", put(pfw::set_token))
        .route("/tasks/config", get(pfw::task_config))
        .route("/tasks/configure/{task}", put(pfw::configure_task))
        .route("/tasks/run/{task}", put(pfw::run_task))
        .route("/maps", get(pfw::list_maps))
        .route("/maps/{name}", get(pfw::get_map));

    let plain = Router::new()
        .route("/config", get(firewall::get_config))
        .route(
            "/forward",
            put(firewall::add_forward).delete(firewall::delete_forward),
        )
        .route(
            "/block",
            put(firewall::add_block).delete(firewall::delete_block),
        )
        .route(
            "/service_port",
            put(firewall::add_service_port).delete(firewall::delete_service_port),
        );

    Router::new()
        .nest("/plugins/pfw", pfw)
        .nest("/firewall", plain)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .with_state(state)
}

/// Serves the API until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("REST API listening on {addr}");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation { .. } | Error::Expression(_) => StatusCode::BAD_REQUEST,
            Error::Auth => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Parses a JSON request body; malformed documents are validation errors.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::validation("body", e.to_string()))
}
