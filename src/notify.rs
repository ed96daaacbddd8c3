//! Fire-and-forget notifications for terminal dispatch failures and routed faxes.
//!
//! Delivery never blocks or fails the caller: sends run on a blocking task and
//! errors are only logged.

use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::config::NotifyConfig;
use crate::error::NotifyError;

/// Something worth telling a human about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    OutboundFailed {
        fax_id: Uuid,
        destination: String,
        attempts: u32,
        error: String,
    },
    InboundRouted {
        fax_id: Uuid,
        document_label: String,
        assignee: String,
        next_action: Option<String>,
    },
}

impl Notice {
    pub fn subject(&self) -> String {
        match self {
            Self::OutboundFailed { destination, .. } => format!("[FAX] 送信失敗: {destination}"),
            Self::InboundRouted {
                document_label,
                assignee,
                ..
            } => format!("[FAX] {document_label} を {assignee} に割り当てました"),
        }
    }

    pub fn body(&self) -> String {
        match self {
            Self::OutboundFailed {
                fax_id,
                destination,
                attempts,
                error,
            } => format!(
                "送信FAX {fax_id} ({destination}) は {attempts} 回の試行後に失敗しました。\n\nエラー: {error}\n"
            ),
            Self::InboundRouted {
                fax_id,
                document_label,
                assignee,
                next_action,
            } => {
                let mut body = format!("受信FAX {fax_id}\n種別: {document_label}\n担当: {assignee}\n");
                if let Some(action) = next_action {
                    body.push_str(&format!("次のアクション: {action}\n"));
                }
                body
            }
        }
    }
}

/// Notification sink. Implementations must not block the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// SMTP notifier built on lettre.
pub struct EmailNotifier {
    config: NotifyConfig,
}

impl EmailNotifier {
    pub fn new(config: NotifyConfig) -> Self {
        Self { config }
    }

    fn send_email(config: &NotifyConfig, subject: &str, body: &str) -> Result<(), NotifyError> {
        let email = Message::builder()
            .from(
                config
                    .from_address
                    .parse()
                    .map_err(|e: lettre::address::AddressError| NotifyError::InvalidAddress {
                        address: config.from_address.clone(),
                        reason: e.to_string(),
                    })?,
            )
            .to(config
                .to_address
                .parse()
                .map_err(|e: lettre::address::AddressError| NotifyError::InvalidAddress {
                    address: config.to_address.clone(),
                    reason: e.to_string(),
                })?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| NotifyError::Build(e.to_string()))?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| NotifyError::Smtp(format!("SMTP relay error: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        transport
            .send(&email)
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        tracing::info!(to = %config.to_address, "Notification email sent");
        Ok(())
    }
}

impl Notifier for EmailNotifier {
    fn notify(&self, notice: Notice) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime; dropping notification");
            return;
        };
        let config = self.config.clone();
        handle.spawn_blocking(move || {
            if let Err(e) = Self::send_email(&config, &notice.subject(), &notice.body()) {
                tracing::warn!(error = %e, "Notification email failed");
            }
        });
    }
}
