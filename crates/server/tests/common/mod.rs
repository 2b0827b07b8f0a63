//! Shared fixtures: a trained model, a file-backed config store and a
//! recording alert sink.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use watchpost_core::{ConfigSnapshot, ConfigStore, TomlFileSource};
use watchpost_detector::{train, EquipmentModel, TrainParams};
use watchpost_notify::{AlertDispatcher, AlertSink, Notification, NotifyError};
use watchpost_server::PredictionService;

/// Dense cloud around the origin: 11x11 grid over [-1, 1]².
pub fn normal_cloud() -> Vec<Vec<f64>> {
    (0..11)
        .flat_map(|i| (0..11).map(move |j| vec![i as f64 * 0.2 - 1.0, j as f64 * 0.2 - 1.0]))
        .collect()
}

pub fn trained_model(equipment_id: &str) -> EquipmentModel {
    train(equipment_id, &normal_cloud(), TrainParams::default()).unwrap()
}

pub fn config_text(smtp_server: &str, ports: &[(&str, u16)]) -> String {
    let mut text = format!(
        r#"
[email]
smtp_server = "{smtp_server}"
smtp_port = 587
username = "alerts@example.com"
password = "secret"
recipient = "ops@example.com"

[server]
host = "127.0.0.1"
"#
    );
    for (equipment, port) in ports {
        text.push_str(&format!("port_{equipment} = {port}\n"));
    }
    text
}

pub fn write_config(path: &Path, smtp_server: &str, ports: &[(&str, u16)]) {
    std::fs::write(path, config_text(smtp_server, ports)).unwrap();
}

pub fn file_store(path: &Path) -> Arc<ConfigStore> {
    Arc::new(ConfigStore::load(TomlFileSource::new(path)).unwrap())
}

/// Records every delivery instead of talking SMTP.
#[derive(Default)]
pub struct RecordingSink {
    pub count: AtomicUsize,
    pub deliveries: Mutex<Vec<(Notification, String)>>,
    pub fail: bool,
    /// Held before each delivery is recorded.
    pub delay: Option<Duration>,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// SMTP server named by the snapshot each delivery was handed.
    pub fn servers(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, server)| server.clone())
            .collect()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.body.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl AlertSink for RecordingSink {
    async fn deliver(
        &self,
        notification: &Notification,
        snapshot: &ConfigSnapshot,
    ) -> Result<(), NotifyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        self.deliveries
            .lock()
            .unwrap()
            .push((notification.clone(), snapshot.email.smtp_server.clone()));
        if self.fail {
            Err(NotifyError::Delivery("535 authentication failed".into()))
        } else {
            Ok(())
        }
    }

    fn channel_name(&self) -> &str {
        "recording"
    }
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub config: Arc<ConfigStore>,
    pub sink: Arc<RecordingSink>,
    pub service: PredictionService,
}

impl Fixture {
    pub fn new(equipment_id: &str) -> Self {
        Self::with_sink(equipment_id, RecordingSink::default())
    }

    pub fn with_sink(equipment_id: &str, sink: RecordingSink) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchpost.toml");
        write_config(&path, "smtp.example.com", &[(equipment_id, 5001)]);

        let config = file_store(&path);
        let sink = Arc::new(sink);
        let dispatcher = Arc::new(AlertDispatcher::new(sink.clone()));
        let service = PredictionService::new(
            equipment_id,
            Arc::new(trained_model(equipment_id)),
            Arc::clone(&config),
            dispatcher,
        );
        Self {
            dir,
            config,
            sink,
            service,
        }
    }

    pub fn config_path(&self) -> std::path::PathBuf {
        self.dir.path().join("watchpost.toml")
    }
}

/// Poll until `sink` has seen `n` deliveries, or give up after two seconds.
pub async fn wait_for_deliveries(sink: &RecordingSink, n: usize) {
    for _ in 0..200 {
        if sink.count() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
