//! SMTP email sink via `lettre` with TLS support.
//!
//! Every delivery builds its transport from the snapshot it is handed:
//! connect, STARTTLS (or implicit TLS on port 465), log in, send, close.
//! There is no connection pool, so credentials changed by a config refresh
//! are picked up by the very next alert.

use std::time::Duration;

use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use watchpost_core::config::{EmailSettings, IMPLICIT_TLS_PORT};
use watchpost_core::ConfigSnapshot;

use crate::traits::{AlertSink, Notification, NotifyError};

/// Port on which SMTP servers expect implicit TLS instead of STARTTLS.

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends notifications as emails via SMTP.
#[derive(Debug, Clone)]
pub struct EmailNotifier {
    timeout: Duration,
}

impl EmailNotifier {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Limit how long one SMTP conversation may take.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the transport described by `settings`.
    ///
    /// Port 465 uses implicit TLS; any other port uses STARTTLS unless
    /// `tls = false`, in which case the connection is plaintext. Port 465
    /// with `tls = false` is rejected rather than silently upgraded.
    fn transport(
        &self,
        settings: &EmailSettings,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        if settings.smtp_port == IMPLICIT_TLS_PORT && !settings.tls {
            return Err(NotifyError::Config(format!(
                "port {IMPLICIT_TLS_PORT} always uses implicit TLS; set tls = true or pick another port"
            )));
        }

        let builder = if settings.smtp_port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_server)
                .map_err(|e| NotifyError::Config(e.to_string()))?
        } else if settings.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_server)
                .map_err(|e| NotifyError::Config(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_server)
        };

        Ok(builder
            .port(settings.smtp_port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .timeout(Some(self.timeout))
            .build())
    }

    /// Compose the email: from the login account to the configured recipient.
    fn message(
        &self,
        notification: &Notification,
        settings: &EmailSettings,
    ) -> Result<Message, NotifyError> {
        let from: Mailbox = settings
            .username
            .parse()
            .map_err(|e: lettre::address::AddressError| NotifyError::Config(e.to_string()))?;
        let to: Mailbox = settings
            .recipient
            .parse()
            .map_err(|e: lettre::address::AddressError| NotifyError::Config(e.to_string()))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(&notification.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())
            .map_err(|e| NotifyError::Config(e.to_string()))
    }
}

impl Default for EmailNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AlertSink for EmailNotifier {
    async fn deliver(
        &self,
        notification: &Notification,
        snapshot: &ConfigSnapshot,
    ) -> Result<(), NotifyError> {
        let settings = &snapshot.email;
        let email = self.message(notification, settings)?;
        let transport = self.transport(settings)?;

        transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        tracing::debug!(
            channel = "email",
            server = %settings.smtp_server,
            port = settings.smtp_port,
            recipient = %settings.recipient,
            "smtp conversation complete"
        );
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}
