use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hapi_bridge::state::AppState;
use hapi_core::config::Config;
use hapi_core::store::Store;
use hapi_harness::rate_limiter::{MultiKeyRateLimiter, RateLimitConfig};
use hapi_harness::shutdown::ShutdownSignal;
use hapi_harness::token::resolve_cli_api_token;
use rand::Rng;
use tracing::{error, info, warn};

use crate::cpu_sampler::CpuSampler;

/// Configuration for the background loops' own timers (distinct from
/// the bead poll interval, which lives in `config.beads` since it is
/// itself part of the bead-polling contract `hapi-engine` owns).
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    pub sweep_secs: u64,
    pub team_expiry_secs: u64,
    pub cpu_sample_secs: u64,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self { sweep_secs: 10, team_expiry_secs: 30, cpu_sample_secs: 15 }
    }
}

/// The hub process: owns the durable store, the in-memory engine root
/// objects, and the background loops that keep presence, beads, and
/// team TTLs honest between requests.
pub struct Daemon {
    config: Config,
    state: Arc<AppState>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
    cli_api_token: String,
}

impl Daemon {
    /// Opens (or creates) the database at `config.database.path` and
    /// builds the root object set.
    pub async fn new(config: Config) -> Result<Self> {
        let store = Store::open(&config.database.path).await.context("failed to open hub database")?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Store) -> Self {
        let rate_limiter = Arc::new(MultiKeyRateLimiter::new(
            RateLimitConfig::per_second(200),
            RateLimitConfig::per_second(20),
            RateLimitConfig::per_second(50),
        ));
        let cli_api_token = resolve_cli_api_token(config.security.cli_api_token.as_deref());
        let state = Arc::new(AppState::new(Arc::new(store), rate_limiter));
        Self {
            config,
            state,
            intervals: DaemonIntervals::default(),
            shutdown: ShutdownSignal::new(),
            cli_api_token,
        }
    }

    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Runs the HTTP/WS facade plus every background loop until the
    /// shutdown signal fires. Binds to a pre-created listener so the
    /// caller can pick ports dynamically (tests) or from config (main).
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let router = hapi_bridge::app(self.state.clone(), self.cli_api_token.clone());
        let bind_addr = listener.local_addr()?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let serve_handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "hub HTTP server error");
            }
        });
        info!(%bind_addr, "hub listening");

        self.spawn_background_loops();

        let _ = serve_handle.await;
        info!("hub stopped");
        Ok(())
    }

    /// Binds to `config.daemon.{host,port}` and runs until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind hub listener on {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    fn spawn_background_loops(&self) {
        let state = self.state.clone();
        let config = self.config.clone();
        let intervals = self.intervals.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(Self::run_loops(state, config, intervals, shutdown));
    }

    async fn run_loops(state: Arc<AppState>, config: Config, intervals: DaemonIntervals, shutdown: ShutdownSignal) {
        let mut sweep_interval = tokio::time::interval(Duration::from_secs(intervals.sweep_secs));
        let mut team_expiry_interval = tokio::time::interval(Duration::from_secs(intervals.team_expiry_secs));
        let mut cpu_sample_interval = tokio::time::interval(Duration::from_secs(intervals.cpu_sample_secs));
        let bead_poll_base = Duration::from_secs(config.beads.poll_interval_secs);
        let bead_jitter_max = config.beads.jitter_secs;

        sweep_interval.tick().await;
        team_expiry_interval.tick().await;
        cpu_sample_interval.tick().await;

        let mut cpu_sampler = CpuSampler::new();
        let mut shutdown_rx = shutdown.subscribe();
        let mut next_bead_poll = Box::pin(tokio::time::sleep(jittered(bead_poll_base, bead_jitter_max)));

        loop {
            tokio::select! {
                _ = sweep_interval.tick() => {
                    if let Err(e) = Self::run_sweep(&state).await {
                        error!(error = %e, "inactive-session sweep failed");
                    }
                }
                _ = team_expiry_interval.tick() => {
                    if let Err(e) = Self::run_team_expiry(&state).await {
                        error!(error = %e, "team expiry sweep failed");
                    }
                }
                _ = cpu_sample_interval.tick() => {
                    cpu_sampler.tick(hapi_telemetry::metrics::global_metrics());
                }
                _ = &mut next_bead_poll => {
                    if let Err(e) = Self::run_bead_poll(&state).await {
                        error!(error = %e, "bead poll failed");
                    }
                    next_bead_poll = Box::pin(tokio::time::sleep(jittered(bead_poll_base, bead_jitter_max)));
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping background loops");
                    break;
                }
            }
        }
    }

    async fn namespaces(state: &AppState) -> Result<Vec<String>, hapi_core::error::StoreError> {
        state.store.list_namespaces().await
    }

    async fn run_sweep(state: &AppState) -> Result<(), hapi_core::error::StoreError> {
        let namespaces = Self::namespaces(state).await?;
        let now = chrono::Utc::now();
        for namespace in &namespaces {
            let ns = namespace.clone();
            state
                .session_cache
                .sweep_expired(&state.store, &state.publisher, now, move |_id| Some(ns.clone()))
                .await?;
            let cleared = state
                .session_cache
                .clear_inactive_sessions(&state.store, &state.publisher, namespace, now, chrono::Duration::days(7))
                .await?;
            if !cleared.is_empty() {
                info!(namespace, count = cleared.len(), "cleared long-inactive sessions");
            }
        }
        Ok(())
    }

    async fn run_team_expiry(state: &AppState) -> Result<(), hapi_core::error::StoreError> {
        let namespaces = Self::namespaces(state).await?;
        let now = chrono::Utc::now();
        for namespace in &namespaces {
            let expired = state.store.get_expired_temporary_teams(namespace, now).await?;
            for team in expired {
                match state.store.delete_team(team.id, namespace).await {
                    Ok(()) => {
                        state.publisher.publish(hapi_types::Event::TeamRemoved {
                            namespace: namespace.clone(),
                            team_id: team.id,
                        });
                        info!(namespace, team_id = %team.id, "expired temporary team removed");
                    }
                    Err(e) => warn!(namespace, team_id = %team.id, error = %e, "failed to remove expired team"),
                }
            }
        }
        Ok(())
    }

    async fn run_bead_poll(state: &AppState) -> Result<(), hapi_core::error::StoreError> {
        let namespaces = Self::namespaces(state).await?;
        for namespace in &namespaces {
            state
                .bead_service
                .poll_namespace(&state.store, &state.publisher, &state.registry, state.ws_client.as_ref(), namespace)
                .await?;
        }
        Ok(())
    }
}

fn jittered(base: Duration, jitter_secs: u64) -> Duration {
    if jitter_secs == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(0..=jitter_secs);
    base + Duration::from_secs(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn daemon_runs_and_stops_on_shutdown() {
        let store = Store::open_in_memory().await.unwrap();
        let daemon = Daemon::with_store(Config::default(), store);
        let shutdown = daemon.shutdown_handle();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let run_handle = tokio::spawn(async move { daemon.run_with_listener(listener).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(2), run_handle).await;
        assert!(result.is_ok(), "daemon did not stop within timeout");
    }

    #[test]
    fn jittered_stays_within_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..20 {
            let d = jittered(base, 5);
            assert!(d >= base && d <= base + Duration::from_secs(5));
        }
    }
}
