use crate::capabilities::Capabilities;
use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::connection::handle_connection;
use crate::error::AgentError;
use crate::gates::{ApprovalGate, ArmGate, TargetPolicy};
use crate::metrics::{counters, HealthState};
use crate::pairing::{IssuedToken, PairingTokens};
use crate::ratelimit::RateLimiter;
use crate::registry::DeviceRegistry;
use crate::replay::ReplayCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// How long in-flight connections may run after shutdown begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// All process-wide agent state. Each concern carries its own lock.
pub struct AgentState {
    /// Runtime configuration.
    pub config: AgentConfig,
    /// Time source for every expiry decision.
    pub clock: Arc<dyn Clock>,
    /// Paired devices.
    pub registry: Arc<DeviceRegistry>,
    /// The one-time pairing token.
    pub pairing: PairingTokens,
    /// Process-wide arm window.
    pub arm: ArmGate,
    /// Per-device approval windows.
    pub approvals: ApprovalGate,
    /// Seen envelope nonces.
    pub replay: ReplayCache,
    /// Per-origin request budget.
    pub rate_limiter: RateLimiter,
    /// Foreground target allow/deny lists.
    pub policy: TargetPolicy,
    /// Desktop side effects.
    pub capabilities: Capabilities,
    /// Serializes injections. Held by the blocking injector task until the
    /// helper returns.
    pub inject_lock: Arc<tokio::sync::Mutex<()>>,
    /// Caps concurrent connections.
    pub conn_limit: Arc<Semaphore>,
    /// Readiness and device count for the metrics endpoint.
    pub health: HealthState,
}

impl AgentState {
    /// Builds the state for one agent process.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        registry: Arc<DeviceRegistry>,
        capabilities: Capabilities,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let health = HealthState::new();
        health.set_paired_devices(registry.len());
        Self {
            pairing: PairingTokens::new(),
            arm: ArmGate::new(),
            approvals: ApprovalGate::new(),
            replay: ReplayCache::new(config.replay_window_ms, config.max_clock_skew_ms),
            rate_limiter: RateLimiter::new(config.rate_limit, config.rate_window_ms),
            policy: TargetPolicy::new(&config.allow_targets, &config.deny_targets),
            inject_lock: Arc::new(tokio::sync::Mutex::new(())),
            conn_limit: Arc::new(Semaphore::new(config.max_conns)),
            health,
            config,
            clock,
            registry,
            capabilities,
        }
    }

    /// Issues a pairing token when `requested` or when no device is paired
    /// yet. Returns `None` if the agent is paired and none was requested.
    pub fn pairing_mode(&self, requested: bool) -> Option<IssuedToken> {
        if !requested && !self.registry.is_empty() {
            return None;
        }
        if !requested {
            info!("no paired devices, entering pairing mode");
        }
        Some(
            self.pairing
                .issue(self.clock.now_ms(), self.config.pairing_ttl_ms),
        )
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<AgentState>) -> Result<(), AgentError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop with an externally-controlled shutdown signal.
///
/// When the paired sender sends or is dropped, the loop stops accepting new
/// connections and waits for in-flight connections to finish.
///
/// # Errors
///
/// Returns an error if the listener address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<AgentState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), AgentError> {
    let local_addr = listener.local_addr()?;
    info!("agent listening on {}", local_addr);
    state.health.set_ready(true);
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let Ok(permit) = Arc::clone(&state.conn_limit).try_acquire_owned() else {
                            warn!("max connections reached, rejecting {}", addr);
                            counters::connections_refused_total("max_conns");
                            drop(stream);
                            continue;
                        };
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, &state).await {
                                debug!("connection from {} closed: {}", addr, e);
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }

    state.health.set_ready(false);
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.abort_all();
    }

    info!("agent shut down gracefully");
    Ok(())
}
