//! Collaborators the service wires into the engine.
//!
//! Mail server configuration is outside this service, so alert mail is
//! emitted as a structured `tracing` event for the log pipeline to route.

use std::sync::atomic::{AtomicU64, Ordering};

use warden_engine::{CollaboratorError, MailMessage, MailTransport};

/// Delivers alert mail by logging it.
#[derive(Debug, Default)]
pub struct LogMailTransport {
    delivered: AtomicU64,
}

impl LogMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered since startup.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl MailTransport for LogMailTransport {
    fn send(&self, message: &MailMessage) -> Result<(), CollaboratorError> {
        if message.recipients.is_empty() {
            return Err(CollaboratorError::Rejected("no recipients".into()));
        }
        tracing::info!(
            target: "warden::mail",
            recipients = %message.recipients.join(","),
            subject = %message.subject,
            body = %message.body,
            "alert mail"
        );
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_deliveries() {
        let mail = LogMailTransport::new();
        let message = MailMessage {
            recipients: vec!["soc@example.com".into()],
            subject: "Risk threshold exceeded".into(),
            body: "emp-42 risk 85".into(),
        };
        mail.send(&message).unwrap();
        mail.send(&message).unwrap();
        assert_eq!(mail.delivered(), 2);
    }

    #[test]
    fn rejects_empty_recipients() {
        let mail = LogMailTransport::new();
        let message = MailMessage {
            recipients: Vec::new(),
            subject: "s".into(),
            body: "b".into(),
        };
        assert!(matches!(
            mail.send(&message),
            Err(CollaboratorError::Rejected(_))
        ));
        assert_eq!(mail.delivered(), 0);
    }
}
