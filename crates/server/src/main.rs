//! watchpost: per-equipment anomaly prediction service.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use watchpost_core::config::{config_path_from_env, load_dotenv};
use watchpost_core::store::DEFAULT_ESCALATE_AFTER;
use watchpost_core::{ConfigStore, TomlFileSource};
use watchpost_detector::{train, ModelStore, TrainParams};
use watchpost_notify::{Alert, AlertDispatcher, EmailNotifier, DEFAULT_MAX_CONCURRENT};
use watchpost_server::{ServiceExit, Supervisor};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "watchpost", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve predictions for every equipment listed in the config.
    Serve {
        /// Settings file. Defaults to $WATCHPOST_CONFIG, then watchpost.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Seconds between configuration re-reads.
        #[arg(long, env = "WATCHPOST_REFRESH_SECS", default_value_t = 60)]
        refresh_secs: u64,

        /// Overrides `models.dir` from the config file.
        #[arg(long, env = "WATCHPOST_MODELS_DIR")]
        models_dir: Option<PathBuf>,

        /// Consecutive refresh failures before they are logged as errors
        /// and `/health` reports `degraded`.
        #[arg(long, env = "WATCHPOST_ESCALATE_AFTER", default_value_t = DEFAULT_ESCALATE_AFTER)]
        escalate_after: u32,

        /// Alerts delivered at the same time; the rest queue.
        #[arg(long, env = "WATCHPOST_ALERT_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENT)]
        alert_concurrency: usize,
    },

    /// Fit a scaler and LOF detector on a JSON array of feature vectors.
    Train {
        #[arg(long)]
        data: PathBuf,

        #[arg(long)]
        equipment: String,

        #[arg(long, env = "WATCHPOST_MODELS_DIR", default_value = ".")]
        models_dir: PathBuf,

        #[arg(long, default_value_t = 20)]
        neighbors: usize,

        #[arg(long, default_value_t = 0.1)]
        contamination: f64,
    },

    /// Send one notification through the configured SMTP account.
    TestAlert {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Render the regular anomaly alert for this equipment instead of
        /// the generic test message.
        #[arg(long)]
        equipment: Option<String>,
    },
}

// ── Subcommands ─────────────────────────────────────────────────────

fn load_store(config: Option<PathBuf>) -> anyhow::Result<ConfigStore> {
    let path = config.unwrap_or_else(config_path_from_env);
    ConfigStore::load(TomlFileSource::new(&path))
        .with_context(|| format!("cannot start without configuration ({})", path.display()))
}

struct ServeOptions {
    config: Option<PathBuf>,
    refresh_secs: u64,
    models_dir: Option<PathBuf>,
    escalate_after: u32,
    alert_concurrency: usize,
}

async fn serve(opts: ServeOptions) -> anyhow::Result<()> {
    let store = load_store(opts.config)?
        .with_interval(Duration::from_secs(opts.refresh_secs.max(1)))
        .with_escalate_after(opts.escalate_after);
    let snapshot = store.current();
    snapshot.log_summary();

    let equipment = snapshot.server.equipment();
    if equipment.is_empty() {
        bail!("no server.port_<equipment> keys configured");
    }

    let models = ModelStore::new(opts.models_dir.unwrap_or_else(|| snapshot.models.dir.clone()));
    let dispatcher = Arc::new(AlertDispatcher::with_max_concurrent(
        Arc::new(EmailNotifier::new()),
        opts.alert_concurrency,
    ));

    let report = Supervisor::new(Arc::new(store), models, dispatcher)
        .run(equipment)
        .await;

    for outcome in &report.services {
        if let ServiceExit::Failed(reason) = &outcome.exit {
            tracing::warn!(equipment = %outcome.equipment_id, port = outcome.port, %reason, "service did not run");
        }
    }
    if report.alerts_abandoned > 0 {
        tracing::warn!(alerts = report.alerts_abandoned, "exited with undelivered alerts");
    }
    if report.all_failed() && !report.interrupted {
        bail!("every prediction service failed");
    }
    Ok(())
}

fn train_model(
    data: &Path,
    equipment: &str,
    models_dir: PathBuf,
    params: TrainParams,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(data)
        .with_context(|| format!("failed to read {}", data.display()))?;
    let rows: Vec<Vec<f64>> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of feature vectors", data.display()))?;

    let model = train(equipment, &rows, params)?;
    let path = ModelStore::new(models_dir).save(&model)?;
    info!(equipment, path = %path.display(), "model artifact written");
    Ok(())
}

async fn test_alert(config: Option<PathBuf>, equipment: Option<String>) -> anyhow::Result<()> {
    let snapshot = load_store(config)?.current();
    let dispatcher = AlertDispatcher::new(Arc::new(EmailNotifier::new()));

    match equipment {
        Some(id) => {
            let alert = Alert::new(watchpost_notify::ANOMALY_MESSAGE, id);
            dispatcher.dispatch(&alert, &snapshot).await?;
        }
        None => dispatcher.test(&snapshot).await?,
    }
    info!(recipient = %snapshot.email.recipient, "test alert sent");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            refresh_secs,
            models_dir,
            escalate_after,
            alert_concurrency,
        } => {
            serve(ServeOptions {
                config,
                refresh_secs,
                models_dir,
                escalate_after,
                alert_concurrency,
            })
            .await
        }
        Command::Train {
            data,
            equipment,
            models_dir,
            neighbors,
            contamination,
        } => {
            let params = TrainParams {
                n_neighbors: neighbors,
                contamination,
            };
            tokio::task::spawn_blocking(move || train_model(&data, &equipment, models_dir, params))
                .await?
        }
        Command::TestAlert { config, equipment } => test_alert(config, equipment).await,
    }
}
