//! Turns anomaly alerts into notifications and hands them to the sink.
//!
//! Delivery is best effort: one attempt, the outcome logged, the error
//! returned to the caller who is free to ignore it. A failure never affects
//! the prediction that triggered the alert.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use watchpost_core::ConfigSnapshot;

use crate::templating::{
    TemplateContext, TemplateRenderer, DEFAULT_BODY_TEMPLATE, DEFAULT_SUBJECT_TEMPLATE,
};
use crate::traits::{Alert, AlertSink, DispatchResult, Notification, NotifyError};

/// Message sent whenever a prediction batch contains an outlier.
pub const ANOMALY_MESSAGE: &str = "Anomaly detected in the system! Check immediately.";

/// Background deliveries allowed to talk to the sink at the same time.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Renders alerts and delivers them through a single [`AlertSink`].
///
/// Background deliveries started with [`spawn_dispatch`](Self::spawn_dispatch)
/// are counted until they finish, so shutdown can [`drain`](Self::drain) them
/// instead of dropping a pending alert with the runtime.
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    renderer: TemplateRenderer,
    background: Arc<Background>,
}

struct Background {
    pending: AtomicUsize,
    idle: Notify,
    permits: Semaphore,
}

/// Counts one background delivery; released on completion, abort or panic.
struct PendingGuard(Arc<Background>);

impl PendingGuard {
    fn new(background: Arc<Background>) -> Self {
        background.pending.fetch_add(1, Ordering::SeqCst);
        Self(background)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self::with_max_concurrent(sink, DEFAULT_MAX_CONCURRENT)
    }

    /// Like [`new`](Self::new), capping simultaneous background deliveries.
    /// Alerts over the cap wait their turn; none are dropped.
    pub fn with_max_concurrent(sink: Arc<dyn AlertSink>, max_concurrent: usize) -> Self {
        Self {
            sink,
            renderer: TemplateRenderer::new(),
            background: Arc::new(Background {
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                permits: Semaphore::new(max_concurrent.max(1)),
            }),
        }
    }

    /// Deliver `alert` on a background task. The outcome is logged by
    /// [`dispatch`](Self::dispatch); the handle only reports completion.
    pub fn spawn_dispatch(
        self: &Arc<Self>,
        alert: Alert,
        snapshot: Arc<ConfigSnapshot>,
    ) -> JoinHandle<()> {
        let guard = PendingGuard::new(Arc::clone(&self.background));
        let dispatcher = Arc::clone(self);

        tokio::spawn(async move {
            let _guard = guard;
            // Never closed, so acquiring only waits.
            let _permit = dispatcher.background.permits.acquire().await;
            let _ = dispatcher.dispatch(&alert, &snapshot).await;
        })
    }

    /// Background deliveries not yet finished, queued ones included.
    pub fn pending(&self) -> usize {
        self.background.pending.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for every background delivery to finish.
    /// Returns how many were still pending when it gave up.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let start = Instant::now();
        let pending = self.pending();
        if pending == 0 {
            return 0;
        }
        tracing::info!(pending, "waiting for pending alerts");

        let all_done = async {
            loop {
                let notified = self.background.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(timeout, all_done).await.is_err() {
            let left = self.pending();
            tracing::warn!(
                pending = left,
                waited_ms = start.elapsed().as_millis() as u64,
                "alerts still pending at shutdown; abandoning them"
            );
            return left;
        }
        0
    }

    pub fn channel_name(&self) -> &str {
        self.sink.channel_name()
    }

    /// Render `alert` into a notification with a fresh alert id.
    pub fn compose(&self, alert: &Alert) -> Result<Notification, NotifyError> {
        let alert_id = uuid::Uuid::new_v4().to_string();
        let ctx = TemplateContext {
            message: alert.message.clone(),
            equipment_id: alert.equipment_id.clone(),
            alert_id: alert_id.clone(),
            now: chrono::Utc::now().to_rfc3339(),
        };

        Ok(Notification {
            subject: self.renderer.render(DEFAULT_SUBJECT_TEMPLATE, &ctx)?,
            body: self.renderer.render(DEFAULT_BODY_TEMPLATE, &ctx)?,
            metadata: HashMap::from([
                ("alert_id".to_string(), alert_id),
                ("equipment_id".to_string(), alert.equipment_id.clone()),
            ]),
        })
    }

    /// Deliver `alert` once using the settings in `snapshot`.
    pub async fn dispatch(
        &self,
        alert: &Alert,
        snapshot: &ConfigSnapshot,
    ) -> Result<DispatchResult, NotifyError> {
        let notification = self.compose(alert)?;
        let alert_id = notification
            .metadata
            .get("alert_id")
            .cloned()
            .unwrap_or_default();
        let channel = self.sink.channel_name().to_string();

        let start = Instant::now();
        let result = self.sink.deliver(&notification, snapshot).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                tracing::info!(
                    alert_id = %alert_id,
                    equipment = %alert.equipment_id,
                    channel = %channel,
                    recipient = %snapshot.email.recipient,
                    duration_ms,
                    "Alert delivered"
                );
                Ok(DispatchResult {
                    alert_id,
                    channel,
                    equipment_id: alert.equipment_id.clone(),
                    duration_ms,
                })
            }
            Err(e) => {
                tracing::warn!(
                    alert_id = %alert_id,
                    equipment = %alert.equipment_id,
                    channel = %channel,
                    error = %e,
                    duration_ms,
                    "Alert delivery failed"
                );
                Err(e)
            }
        }
    }

    /// Send the sink's test notification with `snapshot`.
    pub async fn test(&self, snapshot: &ConfigSnapshot) -> Result<(), NotifyError> {
        self.sink.test(snapshot).await
    }
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("channel", &self.sink.channel_name())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}
