//! Process supervision: the config refresh loop plus one prediction service
//! per equipment.
//!
//! Each equipment runs in its own task (load model, bind, serve). A task that
//! fails is recorded in the [`SupervisorReport`] and leaves the others alone.
//! The refresh loop is watched and restarted if it ever dies. Once every
//! service has stopped, alerts still in flight get a bounded grace period.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use watchpost_core::{ConfigStore, EquipmentEntry};
use watchpost_detector::ModelStore;
use watchpost_notify::AlertDispatcher;

use crate::router::build_router;
use crate::service::PredictionService;

/// Pause before a dead refresh loop is started again.
pub const REFRESH_RESTART_DELAY: Duration = Duration::from_millis(500);

/// Longest wait for in-flight alerts once every service has stopped.
pub const ALERT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How one equipment service ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceExit {
    /// Shut down gracefully after a stop request.
    Stopped,
    /// Never started or died: missing model, corrupt artifact, bind error,
    /// panic, or a supervision task that vanished.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ServiceOutcome {
    pub equipment_id: String,
    pub port: u16,
    pub exit: ServiceExit,
}

#[derive(Debug, Clone, Default)]
pub struct SupervisorReport {
    /// One entry per configured equipment, sorted by id.
    pub services: Vec<ServiceOutcome>,
    /// Times the refresh loop had to be restarted.
    pub refresh_restarts: u32,
    /// A shutdown signal was received.
    pub interrupted: bool,
    /// Alerts still undelivered when the drain timeout ran out.
    pub alerts_abandoned: usize,
}

impl SupervisorReport {
    pub fn failed(&self) -> impl Iterator<Item = &ServiceOutcome> {
        self.services
            .iter()
            .filter(|s| matches!(s.exit, ServiceExit::Failed(_)))
    }

    pub fn all_failed(&self) -> bool {
        !self.services.is_empty() && self.failed().count() == self.services.len()
    }
}

pub struct Supervisor {
    config: Arc<ConfigStore>,
    models: ModelStore,
    dispatcher: Arc<AlertDispatcher>,
}

impl Supervisor {
    pub fn new(config: Arc<ConfigStore>, models: ModelStore, dispatcher: Arc<AlertDispatcher>) -> Self {
        Self {
            config,
            models,
            dispatcher,
        }
    }

    /// Run until every service has exited or SIGINT/SIGTERM arrives.
    pub async fn run(self, equipment: Vec<EquipmentEntry>) -> SupervisorReport {
        self.run_until(equipment, shutdown_signal()).await
    }

    /// Like [`Supervisor::run`], with a caller-supplied shutdown trigger.
    pub async fn run_until<F>(self, equipment: Vec<EquipmentEntry>, shutdown: F) -> SupervisorReport
    where
        F: Future<Output = ()> + Send,
    {
        let mut report = SupervisorReport::default();
        if equipment.is_empty() {
            warn!("no equipment configured; nothing to serve");
            return report;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut refresh = self.spawn_refresh(Duration::ZERO);

        // Equipment without a recorded outcome yet.
        let mut pending: BTreeMap<String, u16> = BTreeMap::new();
        let mut services = JoinSet::new();
        for entry in equipment {
            pending.insert(entry.id.clone(), entry.port);
            services.spawn(supervise_service(
                entry,
                Arc::clone(&self.config),
                self.models.clone(),
                Arc::clone(&self.dispatcher),
                stop_rx.clone(),
            ));
        }
        info!(services = services.len(), "supervisor started");

        tokio::pin!(shutdown);
        let mut lost: Option<String> = None;

        loop {
            tokio::select! {
                joined = services.join_next() => match joined {
                    Some(Ok(outcome)) => {
                        pending.remove(&outcome.equipment_id);
                        report.services.push(outcome);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "service supervision task lost");
                        lost = Some(e.to_string());
                    }
                    None => break,
                },
                exited = &mut refresh => {
                    match exited {
                        Ok(()) => error!("configuration refresh loop returned; restarting"),
                        Err(e) => error!(error = %e, "configuration refresh loop died; restarting"),
                    }
                    report.refresh_restarts += 1;
                    refresh = self.spawn_refresh(REFRESH_RESTART_DELAY);
                }
                _ = &mut shutdown, if !report.interrupted => {
                    info!("shutdown signal received, stopping services");
                    report.interrupted = true;
                    let _ = stop_tx.send(true);
                }
            }
        }

        refresh.abort();
        report.services.extend(lost_outcomes(pending, lost.as_deref()));
        report
            .services
            .sort_by(|a, b| a.equipment_id.cmp(&b.equipment_id));
        report.alerts_abandoned = self.dispatcher.drain(ALERT_DRAIN_TIMEOUT).await;

        info!(
            services = report.services.len(),
            failed = report.failed().count(),
            refresh_restarts = report.refresh_restarts,
            alerts_abandoned = report.alerts_abandoned,
            "supervisor finished"
        );
        report
    }

    fn spawn_refresh(&self, delay: Duration) -> JoinHandle<()> {
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            config.refresh_loop().await;
        })
    }
}

/// Outcomes for equipment whose supervision task ended without reporting.
fn lost_outcomes(pending: BTreeMap<String, u16>, reason: Option<&str>) -> Vec<ServiceOutcome> {
    let reason = reason.unwrap_or("no outcome reported");
    pending
        .into_iter()
        .map(|(equipment_id, port)| {
            warn!(equipment = %equipment_id, port, reason, "service outcome lost");
            ServiceOutcome {
                equipment_id,
                port,
                exit: ServiceExit::Failed(format!("supervision task lost: {reason}")),
            }
        })
        .collect()
}

/// Run one equipment service in its own task so a panic is caught and
/// attributed to the right equipment.
async fn supervise_service(
    entry: EquipmentEntry,
    config: Arc<ConfigStore>,
    models: ModelStore,
    dispatcher: Arc<AlertDispatcher>,
    stop: watch::Receiver<bool>,
) -> ServiceOutcome {
    let equipment_id = entry.id.clone();
    let port = entry.port;

    let exit = match tokio::spawn(serve_equipment(entry, config, models, dispatcher, stop)).await {
        Ok(Ok(())) => {
            info!(equipment = %equipment_id, port, "prediction service stopped");
            ServiceExit::Stopped
        }
        Ok(Err(e)) => {
            error!(equipment = %equipment_id, port, error = %format!("{e:#}"), "prediction service failed");
            ServiceExit::Failed(format!("{e:#}"))
        }
        Err(e) => {
            error!(equipment = %equipment_id, port, error = %e, "prediction service panicked");
            ServiceExit::Failed(format!("panicked: {e}"))
        }
    };

    ServiceOutcome {
        equipment_id,
        port,
        exit,
    }
}

async fn serve_equipment(
    entry: EquipmentEntry,
    config: Arc<ConfigStore>,
    models: ModelStore,
    dispatcher: Arc<AlertDispatcher>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let id = entry.id.clone();
    let model = tokio::task::spawn_blocking(move || models.load(&id))
        .await
        .context("model loading task failed")??;

    // Host and port are read once; a refresh does not rebind.
    let host = config.current().server.host.clone();
    let addr = format!("{host}:{}", entry.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let service = PredictionService::new(entry.id.clone(), Arc::new(model), config, dispatcher);
    info!(equipment = %entry.id, addr = %addr, "prediction service listening");

    axum::serve(listener, build_router(service))
        .with_graceful_shutdown(async move {
            while !*stop.borrow() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .with_context(|| format!("server on {addr} failed"))?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
///
/// If the handlers cannot be installed this never resolves, so the process
/// keeps serving instead of shutting down spuriously.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to register signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    }
}
