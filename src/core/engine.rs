//! Compiler service
//!
//! Owns the compiled map state. Store mutations call [`Engine::notify`];
//! depending on [`CompileMode`] that either compiles inline or schedules a
//! compile after the debounce window. A minute ticker recompiles regardless
//! so time windows and expirations take effect without API traffic.
//!
//! A batch whose checksum matches the last applied one is not re-applied.

use crate::core::compiler::{self, Clock, CompileWarning, FirewallMaps};
use crate::core::nft_json::NftApplier;
use crate::core::store::RuleStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Upper bound on the debounce window
pub const MAX_DEBOUNCE: Duration = Duration::from_millis(1000);

const SCHEDULE_TICK: Duration = Duration::from_secs(60);

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CompileMode {
    /// Respond first, compile once the debounce window closes
    #[default]
    Debounce,
    /// Compile and apply before the mutating request returns
    Sync,
}

/// Result of the most recent compile
#[derive(Debug, Clone, Default)]
pub struct CompiledState {
    pub maps: FirewallMaps,
    pub warnings: Vec<CompileWarning>,
    pub checksum: String,
    /// Unix seconds
    pub compiled_at: i64,
    /// Error from the last apply attempt, if it failed
    pub apply_error: Option<String>,
}

/// Compiles the PFW rules and the plain firewall rules into one map set.
pub async fn compile_store(store: &RuleStore, clock: Clock) -> CompiledState {
    let config = store.config().await;
    let firewall = store.firewall().await;
    let directory = store.directory().await;

    let compilation = compiler::compile(&config, &directory, clock);
    for warning in &compilation.warnings {
        warn!(
            bucket = %warning.bucket,
            index = warning.index,
            kind = %warning.kind,
            "{}: {}",
            warning.rule,
            warning.message
        );
    }

    let mut maps = compilation.maps;
    maps.extend(firewall.compile());
    let checksum = maps.checksum();

    CompiledState {
        maps,
        warnings: compilation.warnings,
        checksum,
        compiled_at: clock.unix,
        apply_error: None,
    }
}

enum Request {
    Changed,
    Flush(oneshot::Sender<()>),
}

struct Inner {
    store: Arc<RuleStore>,
    applier: NftApplier,
    state: watch::Sender<Arc<CompiledState>>,
    /// Checksum of the last successfully applied batch; held across
    /// compile+apply so runs never interleave
    applied: Mutex<Option<String>>,
}

impl Inner {
    async fn run(&self) -> Arc<CompiledState> {
        let mut applied = self.applied.lock().await;
        let mut state = compile_store(&self.store, Clock::now()).await;

        if applied.as_deref() == Some(state.checksum.as_str()) {
            debug!(checksum = %state.checksum, "maps unchanged, skipping apply");
        } else {
            match self.applier.apply(&state.maps.to_batch()).await {
                Ok(()) => {
                    info!(
                        maps = state.maps.len(),
                        elements = state.maps.element_count(),
                        mode = %self.applier.mode(),
                        "Firewall maps updated"
                    );
                    *applied = Some(state.checksum.clone());
                }
                Err(e) => {
                    error!("Failed to apply firewall maps: {e}");
                    state.apply_error = Some(e.to_string());
                }
            }
        }

        let state = Arc::new(state);
        self.state.send_replace(Arc::clone(&state));
        state
    }
}

/// Handle to the compiler service
pub struct Engine {
    inner: Arc<Inner>,
    mode: CompileMode,
    requests: mpsc::Sender<Request>,
}

impl Engine {
    /// Compiles once, then spawns the worker that serves later requests.
    ///
    /// Must be called inside a Tokio runtime. The worker exits when the
    /// `Engine` is dropped.
    pub async fn start(
        store: Arc<RuleStore>,
        applier: NftApplier,
        mode: CompileMode,
        debounce: Duration,
    ) -> Self {
        let debounce = debounce.min(MAX_DEBOUNCE);
        let (state, _) = watch::channel(Arc::new(CompiledState::default()));
        let inner = Arc::new(Inner {
            store,
            applier,
            state,
            applied: Mutex::new(None),
        });
        inner.run().await;

        let (requests, rx) = mpsc::channel(64);
        tokio::spawn(worker(Arc::clone(&inner), rx, debounce));
        info!(%mode, debounce_ms = debounce.as_millis(), "Compiler service started");

        Self {
            inner,
            mode,
            requests,
        }
    }

    pub fn mode(&self) -> CompileMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.inner.store
    }

    pub fn current(&self) -> Arc<CompiledState> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CompiledState>> {
        self.inner.state.subscribe()
    }

    /// Signals that the store changed.
    pub async fn notify(&self) {
        match self.mode {
            CompileMode::Sync => {
                self.inner.run().await;
            }
            CompileMode::Debounce => {
                // A full queue already holds a pending compile
                if self.requests.try_send(Request::Changed).is_err() {
                    debug!("compile already queued");
                }
            }
        }
    }

    /// Compiles immediately and waits for the result to be published.
    pub async fn flush(&self) -> Arc<CompiledState> {
        let (ack, done) = oneshot::channel();
        if self.requests.send(Request::Flush(ack)).await.is_err() || done.await.is_err() {
            // Worker gone; compile on the caller's task instead
            return self.inner.run().await;
        }
        self.current()
    }
}

async fn worker(inner: Arc<Inner>, mut rx: mpsc::Receiver<Request>, debounce: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + SCHEDULE_TICK, SCHEDULE_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(Request::Changed) => {
                    // The window opens on the first change and is not extended
                    deadline.get_or_insert_with(|| Instant::now() + debounce);
                }
                Some(Request::Flush(ack)) => {
                    deadline = None;
                    inner.run().await;
                    let _ = ack.send(());
                }
                None => break,
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                inner.run().await;
            }
            _ = ticker.tick() => {
                debug!("schedule tick");
                inner.run().await;
            }
        }
    }
    debug!("compiler service stopped");
}
