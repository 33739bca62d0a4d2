//! Top-level connection state machine.
//!
//! `Stopped -> Starting -> Ready`, or `Starting -> Stopped` with an error
//! message. Custom configs are tried first in stored order, then remote
//! candidates in ascending latency order. The first candidate that launches,
//! opens its local port and passes the connectivity check wins.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::candidate::CandidateConfig;
use crate::config::AppConfig;
use crate::error::{AttemptError, LaunchError, Result, RunError, ValidationError};
use crate::fetcher::{CandidateFetcher, CandidateSource};
use crate::shared::latency::{self, Latency};
use crate::store::ConfigStore;
use crate::supervisor::{ProcessSupervisor, ProxyEngine};
use crate::validator::{ConnectionValidator, ConnectivityCheck};

/// Read-only snapshot of the public state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorState {
    pub is_running: bool,
    pub is_ready: bool,
    pub best_server_host: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub socks_port: u16,
    /// Transient file the patched config is written to before every launch.
    pub config_path: PathBuf,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    pub probe_timeout: Duration,
}

impl OrchestratorSettings {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            socks_port: config.engine.socks_port,
            config_path: config.engine.transient_config_path(),
            ready_timeout: config.engine.ready_timeout(),
            ready_poll: config.engine.ready_poll(),
            probe_timeout: config.probe.timeout(),
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    settings: OrchestratorSettings,
    store: Arc<ConfigStore>,
    source: Arc<dyn CandidateSource>,
    engine: Mutex<Box<dyn ProxyEngine>>,
    checker: Arc<dyn ConnectivityCheck>,
    state: watch::Sender<OrchestratorState>,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    run: Mutex<Option<RunHandle>>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        store: Arc<ConfigStore>,
        source: Arc<dyn CandidateSource>,
        engine: Box<dyn ProxyEngine>,
        checker: Arc<dyn ConnectivityCheck>,
    ) -> Self {
        let (state, _) = watch::channel(OrchestratorState::default());
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                source,
                engine: Mutex::new(engine),
                checker,
                state,
            }),
            run: Mutex::new(None),
        }
    }

    /// Wire the real store, fetcher, supervisor and validator from `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        let store = Arc::new(ConfigStore::open_default());
        let source = Arc::new(CandidateFetcher::new(
            config.remote.url.clone(),
            Duration::from_millis(config.remote.timeout_ms),
        ));
        let engine = Box::new(ProcessSupervisor::new(
            config.engine.binary_path(),
            config.engine.stop_grace(),
        ));
        let checker = Arc::new(ConnectionValidator::new(
            config.validation.test_url.clone(),
            Duration::from_millis(config.validation.timeout_ms),
        ));
        Self::new(
            OrchestratorSettings::from_config(config),
            store,
            source,
            engine,
            checker,
        )
    }

    /// Begin a connection run in the background. Ignored while running.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;
        if self.inner.state.borrow().is_running {
            debug!("start_ignored_already_running");
            return;
        }
        if let Some(previous) = run.take() {
            let _ = previous.task.await;
        }

        self.inner.state.send_replace(OrchestratorState {
            is_running: true,
            ..OrchestratorState::default()
        });

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(async move { inner.run(token).await });
        *run = Some(RunHandle { cancel, task });
    }

    /// Cancel any in-flight run and kill the engine. Safe to call repeatedly;
    /// state is only reset when a run was active.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        if let Some(handle) = run.take() {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(error = %e, "run_task_join_failed");
            }
        }
        self.inner.engine.lock().await.stop().await;

        if self.inner.state.borrow().is_running {
            self.inner.state.send_replace(OrchestratorState::default());
            info!("proxy_stopped");
        }
    }

    pub async fn restart(&self) {
        self.stop().await;
        self.start().await;
    }

    /// Stop and remove the transient engine config.
    pub async fn destroy(&self) {
        self.stop().await;
        let path = &self.inner.settings.config_path;
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "engine_config_removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "engine_config_remove_failed"),
        }
    }

    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.inner.state.subscribe()
    }

    /// Resolve once the current run is either ready or has given up.
    pub async fn wait_settled(&self) -> OrchestratorState {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(|s| s.is_ready || !s.is_running).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        settled
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().is_running
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.state.borrow().is_ready
    }

    #[must_use]
    pub fn best_server_host(&self) -> Option<String> {
        self.inner.state.borrow().best_server_host.clone()
    }

    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.inner.state.borrow().error_message.clone()
    }

    pub fn socks_port(&self) -> u16 {
        self.inner.settings.socks_port
    }

    /// Remote candidate list; a failed fetch is an empty list.
    pub async fn remote_candidates(&self) -> Vec<CandidateConfig> {
        self.inner.fetch_remote().await
    }

    /// Remote candidates that answered, fastest first.
    pub async fn ranked_remote_candidates(&self) -> Vec<(CandidateConfig, Duration)> {
        self.inner.ranked_remote().await
    }

    pub async fn ping_server(&self, config: &CandidateConfig) -> Latency {
        latency::probe_one(config, self.inner.settings.probe_timeout).await
    }

    pub fn add_custom_config(&self, raw: &str) -> std::result::Result<(), ValidationError> {
        self.inner.store.add(raw)
    }

    pub fn remove_custom_config(&self, index: usize) -> Result<()> {
        self.inner.store.remove(index)
    }

    #[must_use]
    pub fn custom_configs(&self) -> Vec<CandidateConfig> {
        self.inner.store.list()
    }
}

impl Inner {
    async fn run(&self, cancel: CancellationToken) {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("run_cancelled");
                return;
            }
            outcome = self.connect() => outcome,
        };

        match outcome {
            Ok(winner) => {
                let host = winner.host().map(str::to_string);
                info!(
                    label = %winner.label(),
                    host = ?host,
                    port = self.settings.socks_port,
                    "proxy_ready"
                );
                self.state.send_modify(|s| {
                    s.is_ready = true;
                    s.best_server_host = host;
                });
            }
            Err(e) => {
                warn!(error = %e, "run_failed");
                self.engine.lock().await.stop().await;
                self.state.send_replace(OrchestratorState {
                    error_message: Some(e.to_string()),
                    ..OrchestratorState::default()
                });
            }
        }
    }

    async fn connect(&self) -> std::result::Result<CandidateConfig, RunError> {
        self.engine
            .lock()
            .await
            .check_binary()
            .map_err(RunError::EngineUnavailable)?;

        let store = Arc::clone(&self.store);
        let custom = tokio::task::spawn_blocking(move || store.list())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "custom_configs_load_failed");
                Vec::new()
            });
        info!(count = custom.len(), "custom_configs_loaded");
        for candidate in &custom {
            if self.attempt(candidate).await {
                return Ok(candidate.clone());
            }
        }

        let ranked = self.ranked_remote().await;
        if ranked.is_empty() {
            return Err(RunError::NoResponsiveServers);
        }
        for (candidate, latency) in &ranked {
            debug!(label = %candidate.label(), latency_ms = latency.as_millis() as u64, "remote_candidate_next");
            if self.attempt(candidate).await {
                return Ok(candidate.clone());
            }
        }

        Err(RunError::Exhausted(custom.len() + ranked.len()))
    }

    /// One full launch/ready/check cycle. The engine is stopped again before
    /// returning `false`.
    async fn attempt(&self, candidate: &CandidateConfig) -> bool {
        let label = candidate.label();
        info!(label = %label, host = ?candidate.host(), "candidate_attempt");
        match self.try_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                warn!(label = %label, error = %e, "candidate_attempt_failed");
                self.engine.lock().await.stop().await;
                false
            }
        }
    }

    async fn try_candidate(&self, candidate: &CandidateConfig) -> std::result::Result<(), AttemptError> {
        let path = &self.settings.config_path;
        candidate
            .patched()
            .write_to(path)
            .await
            .map_err(|source| LaunchError::ConfigWrite {
                path: path.clone(),
                source,
            })?;

        let mut engine = self.engine.lock().await;
        engine.launch(path).await?;
        engine
            .wait_until_ready(
                self.settings.socks_port,
                self.settings.ready_timeout,
                self.settings.ready_poll,
            )
            .await?;
        drop(engine);

        if self.checker.check(self.settings.socks_port).await {
            Ok(())
        } else {
            Err(AttemptError::CheckFailed)
        }
    }

    async fn fetch_remote(&self) -> Vec<CandidateConfig> {
        // TODO: surface fetch failures separately from "no candidates" once
        // the state carries an error code.
        match self.source.fetch().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "candidate_list_unavailable");
                Vec::new()
            }
        }
    }

    async fn ranked_remote(&self) -> Vec<(CandidateConfig, Duration)> {
        let remote = self.fetch_remote().await;
        let probed = latency::probe_all(&remote, self.settings.probe_timeout).await;
        let ranked = latency::rank(probed);
        info!(fetched = remote.len(), reachable = ranked.len(), "remote_candidates_ranked");
        ranked
    }
}
