use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default location of the settings file when `WATCHPOST_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "watchpost.toml";

/// SMTP submission port that speaks TLS from the first byte (SMTPS).
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Prefix of the per-equipment port keys in the `[server]` table.
const PORT_KEY_PREFIX: &str = "port_";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Resolve the settings file path: `WATCHPOST_CONFIG`, else [`DEFAULT_CONFIG_PATH`].
pub fn config_path_from_env() -> PathBuf {
    env_opt("WATCHPOST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ── Snapshot ──────────────────────────────────────────────────

/// One fully-formed reading of the operational settings.
///
/// Snapshots are never edited after construction. The store publishes a new
/// `Arc<ConfigSnapshot>` on every successful refresh, so anyone holding an
/// older one keeps a consistent view.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConfigSnapshot {
    pub email: EmailSettings,
    pub server: ServerSettings,
    pub models: ModelSettings,
    pub loaded_at: DateTime<Utc>,
}

/// A monitored piece of equipment and the port its prediction service binds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquipmentEntry {
    pub id: String,
    pub port: u16,
}

impl ConfigSnapshot {
    /// Parse a snapshot from TOML text.
    ///
    /// `origin` only labels errors. When `email.password` is absent the
    /// `SMTP_PASSWORD` environment variable is used instead.
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| ConfigError::unavailable(origin, e))?;

        let password = raw
            .email
            .password
            .or_else(|| env_opt("SMTP_PASSWORD"))
            .ok_or_else(|| ConfigError::unavailable(origin, "missing key `email.password`"))?;

        // 465 is always implicit TLS; a plaintext request there cannot be honoured.
        if raw.email.smtp_port == IMPLICIT_TLS_PORT && !raw.email.tls {
            return Err(ConfigError::unavailable(
                origin,
                "`email.tls = false` is not allowed on port 465, which always uses implicit TLS",
            ));
        }

        let mut ports = BTreeMap::new();
        for (key, value) in raw.server.rest {
            let Some(equipment) = key.strip_prefix(PORT_KEY_PREFIX) else {
                continue;
            };
            if equipment.is_empty() {
                return Err(ConfigError::unavailable(origin, "empty equipment name in `server.port_`"));
            }
            let port = value
                .as_integer()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| {
                    ConfigError::unavailable(
                        origin,
                        format!("`server.{key}` must be an integer port, got {value}"),
                    )
                })?;
            ports.insert(equipment.to_string(), port);
        }

        Ok(Self {
            email: EmailSettings {
                smtp_server: raw.email.smtp_server,
                smtp_port: raw.email.smtp_port,
                username: raw.email.username,
                password,
                recipient: raw.email.recipient,
                tls: raw.email.tls,
            },
            server: ServerSettings {
                host: raw.server.host,
                ports,
            },
            models: raw.models,
            loaded_at: Utc::now(),
        })
    }

    /// Look a setting up by its dotted name (`email.smtp_port`,
    /// `server.port_equipment1`, ...), rendered as a string.
    pub fn get(&self, key: &str) -> Option<String> {
        let (namespace, name) = key.split_once('.')?;
        match (namespace, name) {
            ("email", "smtp_server") => Some(self.email.smtp_server.clone()),
            ("email", "smtp_port") => Some(self.email.smtp_port.to_string()),
            ("email", "username") => Some(self.email.username.clone()),
            ("email", "password") => Some(self.email.password.clone()),
            ("email", "recipient") => Some(self.email.recipient.clone()),
            ("email", "tls") => Some(self.email.tls.to_string()),
            ("server", "host") => Some(self.server.host.clone()),
            ("server", port_key) => port_key
                .strip_prefix(PORT_KEY_PREFIX)
                .and_then(|equipment| self.server.ports.get(equipment))
                .map(|port| port.to_string()),
            ("models", "dir") => Some(self.models.dir.display().to_string()),
            _ => None,
        }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded at {}:", self.loaded_at.to_rfc3339());
        tracing::info!(
            "  email:   server={}:{}, from={}, to={}, tls={}",
            self.email.smtp_server,
            self.email.smtp_port,
            self.email.username,
            self.email.recipient,
            self.email.tls
        );
        tracing::info!("  server:  host={}", self.server.host);
        for (equipment, port) in &self.server.ports {
            tracing::info!("    {} -> port {}", equipment, port);
        }
        tracing::info!("  models:  dir={}", self.models.dir.display());
    }
}

// ── Email ─────────────────────────────────────────────────────

#[derive(Clone, Serialize, PartialEq)]
pub struct EmailSettings {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub recipient: String,
    pub tls: bool,
}

impl std::fmt::Debug for EmailSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailSettings")
            .field("smtp_server", &self.smtp_server)
            .field("smtp_port", &self.smtp_port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("recipient", &self.recipient)
            .field("tls", &self.tls)
            .finish()
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    /// Equipment identifier → listening port.
    pub ports: BTreeMap<String, u16>,
}

impl ServerSettings {
    pub fn port_for(&self, equipment: &str) -> Option<u16> {
        self.ports.get(equipment).copied()
    }

    /// Every configured equipment, ordered by identifier.
    pub fn equipment(&self) -> Vec<EquipmentEntry> {
        self.ports
            .iter()
            .map(|(id, port)| EquipmentEntry {
                id: id.clone(),
                port: *port,
            })
            .collect()
    }
}

// ── Models ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    #[serde(default = "default_models_dir")]
    pub dir: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
        }
    }
}

fn default_models_dir() -> PathBuf {
    PathBuf::from(".")
}

// ── Raw file layout ───────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    email: RawEmail,
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    models: ModelSettings,
}

#[derive(Deserialize)]
struct RawEmail {
    smtp_server: String,
    smtp_port: u16,
    username: String,
    password: Option<String>,
    recipient: String,
    #[serde(default = "default_tls")]
    tls: bool,
}

fn default_tls() -> bool {
    true
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default = "default_host")]
    host: String,
    #[serde(flatten)]
    rest: BTreeMap<String, toml::Value>,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            host: default_host(),
            rest: BTreeMap::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

// ── Sources ───────────────────────────────────────────────────

/// Where snapshots come from.
///
/// `load` is called once at startup and then on every refresh tick; it must
/// return a complete snapshot or an error, never a partial one.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<ConfigSnapshot>;

    /// Human-readable origin for logs.
    fn describe(&self) -> String;
}

/// Reads a TOML settings file with `[email]`, `[server]` and `[models]` tables.
#[derive(Debug, Clone)]
pub struct TomlFileSource {
    path: PathBuf,
}

impl TomlFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for TomlFileSource {
    fn load(&self) -> Result<ConfigSnapshot> {
        let origin = self.describe();
        let text = fs::read_to_string(&self.path).map_err(|e| ConfigError::unavailable(&origin, e))?;
        ConfigSnapshot::from_toml_str(&text, &origin)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
