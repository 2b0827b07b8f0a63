//! Process-wide configuration slot with periodic background refresh.
//!
//! A single refresh task writes; every prediction service reads. The slot
//! holds an `Arc<ConfigSnapshot>` and a refresh replaces the pointer, so a
//! reader sees either the old snapshot or the new one, never a mix.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigSnapshot, ConfigSource};
use crate::error::Result;

/// How often the refresh loop re-reads the source.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Consecutive refresh failures after which each failure is logged at `error`.
pub const DEFAULT_ESCALATE_AFTER: u32 = 10;

pub struct ConfigStore {
    source: Box<dyn ConfigSource>,
    current: RwLock<Arc<ConfigSnapshot>>,
    interval: Duration,
    escalate_after: u32,
    consecutive_failures: AtomicU32,
}

impl ConfigStore {
    /// Perform the first load. Failure here is the caller's to handle; the
    /// binary treats it as fatal.
    pub fn load(source: impl ConfigSource + 'static) -> Result<Self> {
        let snapshot = source.load()?;
        info!(source = %source.describe(), "initial configuration loaded");
        Ok(Self {
            source: Box::new(source),
            current: RwLock::new(Arc::new(snapshot)),
            interval: DEFAULT_REFRESH_INTERVAL,
            escalate_after: DEFAULT_ESCALATE_AFTER,
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_escalate_after(mut self, failures: u32) -> Self {
        self.escalate_after = failures.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        let slot = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&slot)
    }

    /// Number of refreshes that have failed in a row since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// The failure streak has reached the escalation threshold: refresh
    /// failures are now logged at `error` and health reports `degraded`.
    pub fn escalated(&self) -> bool {
        self.consecutive_failures() >= self.escalate_after
    }

    /// One refresh attempt. On success the new snapshot is published and
    /// returned; on failure the slot is left untouched.
    pub fn refresh(&self) -> Result<Arc<ConfigSnapshot>> {
        match self.source.load() {
            Ok(snapshot) => {
                let next = Arc::new(snapshot);
                {
                    let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
                    *slot = Arc::clone(&next);
                }
                let previous_failures = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if previous_failures > 0 {
                    info!(
                        source = %self.source.describe(),
                        failed_attempts = previous_failures,
                        "configuration refresh recovered"
                    );
                }
                Ok(next)
            }
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Re-read the source every interval, forever.
    ///
    /// The initial load already happened in [`ConfigStore::load`], so the
    /// first read occurs one interval after start. Failures keep the previous
    /// snapshot; after `escalate_after` consecutive failures they are logged
    /// at `error` instead of `warn`.
    pub async fn refresh_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(
            source = %self.source.describe(),
            interval_secs = self.interval.as_secs_f64(),
            "configuration refresh loop started"
        );

        loop {
            ticker.tick().await;

            // File sources do blocking I/O.
            let store = Arc::clone(&self);
            let outcome = tokio::task::spawn_blocking(move || store.refresh()).await;

            match outcome {
                Ok(Ok(snapshot)) => {
                    debug!(loaded_at = %snapshot.loaded_at, "configuration refreshed");
                }
                Ok(Err(e)) => {
                    let failures = self.consecutive_failures();
                    if self.escalated() {
                        error!(
                            error = %e,
                            consecutive_failures = failures,
                            "configuration refresh keeps failing; serving stale snapshot"
                        );
                    } else {
                        warn!(
                            error = %e,
                            consecutive_failures = failures,
                            "configuration refresh failed; keeping previous snapshot"
                        );
                    }
                }
                Err(e) => {
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "configuration refresh task panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("source", &self.source.describe())
            .field("interval", &self.interval)
            .field("escalate_after", &self.escalate_after)
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize};

    /// Source whose ports can be changed and which can be told to fail.
    struct ScriptedSource {
        port: Arc<AtomicU16>,
        failing: Arc<AtomicBool>,
        loads: Arc<AtomicUsize>,
    }

    impl ConfigSource for ScriptedSource {
        fn load(&self) -> Result<ConfigSnapshot> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ConfigError::unavailable("scripted", "source offline"));
            }
            let text = format!(
                r#"
[email]
smtp_server = "smtp.example.com"
smtp_port = {port}
username = "alerts@example.com"
password = "secret"
recipient = "ops@example.com"

[server]
port_equipment1 = {port}
"#,
                port = self.port.load(Ordering::SeqCst)
            );
            ConfigSnapshot::from_toml_str(&text, "scripted")
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct Handles {
        port: Arc<AtomicU16>,
        failing: Arc<AtomicBool>,
        loads: Arc<AtomicUsize>,
    }

    fn scripted() -> (ScriptedSource, Handles) {
        let port = Arc::new(AtomicU16::new(587));
        let failing = Arc::new(AtomicBool::new(false));
        let loads = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            port: port.clone(),
            failing: failing.clone(),
            loads: loads.clone(),
        };
        (source, Handles { port, failing, loads })
    }

    #[test]
    fn first_load_failure_is_returned() {
        let (source, handles) = scripted();
        handles.failing.store(true, Ordering::SeqCst);
        assert!(ConfigStore::load(source).is_err());
    }

    #[test]
    fn successful_refresh_publishes_new_snapshot() {
        let (source, handles) = scripted();
        let store = ConfigStore::load(source).unwrap();
        let before = store.current();

        handles.port.store(2525, Ordering::SeqCst);
        store.refresh().unwrap();

        let after = store.current();
        assert_eq!(after.email.smtp_port, 2525);
        // A reader that grabbed the old snapshot keeps seeing it whole.
        assert_eq!(before.email.smtp_port, 587);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn failed_refresh_keeps_previous_snapshot() {
        let (source, handles) = scripted();
        let store = ConfigStore::load(source).unwrap();
        let before = store.current();

        handles.port.store(2525, Ordering::SeqCst);
        handles.failing.store(true, Ordering::SeqCst);
        assert!(store.refresh().is_err());
        assert!(store.refresh().is_err());

        let after = store.current();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.email.smtp_port, 587);
        assert_eq!(store.consecutive_failures(), 2);
    }

    #[test]
    fn recovery_resets_failure_streak() {
        let (source, handles) = scripted();
        let store = ConfigStore::load(source).unwrap();

        handles.failing.store(true, Ordering::SeqCst);
        let _ = store.refresh();
        assert_eq!(store.consecutive_failures(), 1);

        handles.failing.store(false, Ordering::SeqCst);
        store.refresh().unwrap();
        assert_eq!(store.consecutive_failures(), 0);
    }

    #[test]
    fn failure_streak_escalates_at_threshold_and_clears_on_recovery() {
        let (source, handles) = scripted();
        let store = ConfigStore::load(source).unwrap().with_escalate_after(3);

        handles.failing.store(true, Ordering::SeqCst);
        let _ = store.refresh();
        let _ = store.refresh();
        assert_eq!(store.consecutive_failures(), 2);
        assert!(!store.escalated());

        let _ = store.refresh();
        assert!(store.escalated());
        let _ = store.refresh();
        assert!(store.escalated());

        handles.failing.store(false, Ordering::SeqCst);
        store.refresh().unwrap();
        assert!(!store.escalated());
    }

    #[test]
    fn escalation_threshold_is_at_least_one() {
        let (source, handles) = scripted();
        let store = ConfigStore::load(source).unwrap().with_escalate_after(0);
        assert!(!store.escalated());

        handles.failing.store(true, Ordering::SeqCst);
        let _ = store.refresh();
        assert!(store.escalated());
    }

    #[tokio::test]
    async fn refresh_loop_escalates_persistent_failures() {
        let (source, handles) = scripted();
        let store = Arc::new(
            ConfigStore::load(source)
                .unwrap()
                .with_interval(Duration::from_millis(10))
                .with_escalate_after(2),
        );
        handles.failing.store(true, Ordering::SeqCst);

        let task = tokio::spawn(store.clone().refresh_loop());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.consecutive_failures() >= 2);
        assert!(store.escalated());
        assert_eq!(store.current().email.smtp_port, 587);

        handles.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!store.escalated());

        task.abort();
    }

    #[tokio::test]
    async fn refresh_loop_picks_up_changes_and_survives_failures() {
        let (source, handles) = scripted();
        let store = Arc::new(
            ConfigStore::load(source)
                .unwrap()
                .with_interval(Duration::from_millis(10)),
        );

        let task = tokio::spawn(store.clone().refresh_loop());

        handles.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.current().email.smtp_port, 587);
        assert!(store.consecutive_failures() >= 1);

        handles.port.store(2525, Ordering::SeqCst);
        handles.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.current().email.smtp_port, 2525);
        assert!(handles.loads.load(Ordering::SeqCst) >= 3);
        assert!(!task.is_finished());

        task.abort();
    }

    #[test]
    fn concurrent_readers_see_whole_snapshots() {
        let (source, handles) = scripted();
        let store = Arc::new(ConfigStore::load(source).unwrap());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let snapshot = store.current();
                        // Both namespaces were written by the same load.
                        assert_eq!(
                            snapshot.server.port_for("equipment1"),
                            Some(snapshot.email.smtp_port)
                        );
                    }
                })
            })
            .collect();

        for port in 1000..1100u16 {
            handles.port.store(port, Ordering::SeqCst);
            store.refresh().unwrap();
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
