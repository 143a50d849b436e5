//! Outgoing mail. A process-wide dispatcher drains an unbounded channel on
//! its own background task, mirroring `HealthRegistry`'s channel-draining
//! loop; a failed send is re-enqueued at the tail rather than dropped.
//!
//! Grounded in `original_source/npsgd/email_manager.py`'s
//! `EmailManagerThread`/`blockingEmailSend`. SMTP itself is provided by
//! `lettre`, since neither the teacher nor the rest of the pack sends mail.

use lettre::message::{header::ContentType, Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::EmailError;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub from_address: String,
    /// Added to every outgoing message's recipients.
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

/// Classifies a binary attachment by filename extension, the same
/// text/image/audio split the source's `mimetypes.guess_type` falls
/// back from; anything unrecognized is `application/octet-stream`.
fn guess_content_type(filename: &str) -> ContentType {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let mime = match ext.as_str() {
        "txt" | "csv" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    };

    ContentType::parse(mime).unwrap_or(ContentType::parse("application/octet-stream").unwrap())
}

/// One message queued for delivery, with text and binary attachments kept
/// separate as the source does (`textAttachments` vs `binaryAttachments`).
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub text_attachments: Vec<(String, String)>,
    pub binary_attachments: Vec<(String, Vec<u8>)>,
}

impl OutgoingEmail {
    pub fn simple(recipient: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            text_attachments: Vec::new(),
            binary_attachments: Vec::new(),
        }
    }

    fn into_message(self, config: &SmtpConfig) -> Result<Message, EmailError> {
        let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(self.body));

        for (name, content) in self.text_attachments {
            multipart = multipart.singlepart(
                Attachment::new(name).body(content, ContentType::TEXT_PLAIN),
            );
        }
        for (name, content) in self.binary_attachments {
            let content_type = guess_content_type(&name);
            multipart = multipart.singlepart(Attachment::new(name).body(content, content_type));
        }

        let mut builder = Message::builder()
            .from(config.from_address.parse().map_err(|e| EmailError::Build(format!("{e}")))?)
            .to(self
                .recipient
                .parse()
                .map_err(|e| EmailError::Build(format!("{e}")))?);

        for cc in &config.cc {
            builder = builder.cc(cc.parse().map_err(|e| EmailError::Build(format!("{e}")))?);
        }
        for bcc in &config.bcc {
            builder = builder.bcc(bcc.parse().map_err(|e| EmailError::Build(format!("{e}")))?);
        }

        builder
            .subject(self.subject)
            .multipart(multipart)
            .map_err(|e| EmailError::Build(e.to_string()))
    }
}

fn build_transport(config: &SmtpConfig) -> Result<SmtpTransport, EmailError> {
    let builder = if config.use_tls {
        SmtpTransport::starttls_relay(&config.server)
    } else {
        Ok(SmtpTransport::builder_dangerous(&config.server))
    }
    .map_err(|e| EmailError::SmtpUnreachable(e.to_string()))?;

    Ok(builder
        .port(config.port)
        .credentials(Credentials::new(config.username.clone(), config.password.clone()))
        .build())
}

/// Open a session, send one message, close. Used directly by the worker
/// driver's result-email path, where a failed send must surface as a
/// task-level failure rather than silently retrying.
pub fn blocking_send(config: &SmtpConfig, email: OutgoingEmail) -> Result<(), EmailError> {
    let transport = build_transport(config)?;
    let message = email.into_message(config)?;
    transport
        .send(&message)
        .map_err(|e| EmailError::SmtpUnreachable(e.to_string()))?;
    Ok(())
}

/// Handle for enqueueing mail onto the background dispatcher. Cloneable;
/// `send` never blocks and never fails to accept work as long as the
/// dispatcher task is alive.
#[derive(Clone)]
pub struct EmailDispatcher {
    sender: mpsc::UnboundedSender<OutgoingEmail>,
}

impl EmailDispatcher {
    /// Spawn the background dispatcher loop. The returned handle is the
    /// only way to reach it; dropping every handle stops the loop.
    pub fn spawn(config: SmtpConfig) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<OutgoingEmail>();
        let loopback = sender.clone();

        tokio::spawn(async move {
            while let Some(email) = receiver.recv().await {
                let recipient = email.recipient.clone();
                let retry_copy = email.clone();
                let config = config.clone();
                let result =
                    tokio::task::spawn_blocking(move || blocking_send(&config, email)).await;

                match result {
                    Ok(Ok(())) => info!(%recipient, "email delivered"),
                    Ok(Err(err)) => {
                        warn!(%recipient, error = %err, "email send failed, re-enqueueing");
                        let _ = loopback.send(retry_copy);
                    }
                    Err(join_err) => {
                        warn!(%recipient, error = %join_err, "email send task panicked, re-enqueueing");
                        let _ = loopback.send(retry_copy);
                    }
                }
            }
        });

        Self { sender }
    }

    pub fn enqueue(&self, email: OutgoingEmail) {
        if self.sender.send(email).is_err() {
            warn!("email dispatcher loop is gone, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SmtpConfig {
        SmtpConfig {
            server: "localhost".to_owned(),
            port: 25,
            username: String::new(),
            password: String::new(),
            use_tls: false,
            from_address: "queue@example.com".to_owned(),
            cc: Vec::new(),
            bcc: Vec::new(),
        }
    }

    #[test]
    fn simple_email_has_no_attachments() {
        let email = OutgoingEmail::simple("a@b.com", "subject", "body");
        assert!(email.text_attachments.is_empty());
        assert!(email.binary_attachments.is_empty());
    }

    #[test]
    fn into_message_rejects_invalid_recipient() {
        let email = OutgoingEmail::simple("not-an-email", "subject", "body");
        let err = email.into_message(&test_config()).unwrap_err();
        assert!(matches!(err, EmailError::Build(_)));
    }

    #[test]
    fn into_message_builds_with_attachments() {
        let mut email = OutgoingEmail::simple("a@b.com", "subject", "body");
        email
            .text_attachments
            .push(("notes.txt".to_owned(), "hello".to_owned()));
        email
            .binary_attachments
            .push(("results.pdf".to_owned(), vec![0u8, 1, 2]));
        assert!(email.into_message(&test_config()).is_ok());
    }

    #[test]
    fn into_message_adds_cc_and_bcc_to_envelope_recipients() {
        let email = OutgoingEmail::simple("a@b.com", "subject", "body");
        let mut config = test_config();
        config.cc = vec!["cc@example.com".to_owned()];
        config.bcc = vec!["bcc@example.com".to_owned()];
        let message = email.into_message(&config).unwrap();
        let recipients: Vec<String> = message.envelope().to().iter().map(|a| a.to_string()).collect();
        assert!(recipients.contains(&"cc@example.com".to_owned()));
        assert!(recipients.contains(&"bcc@example.com".to_owned()));
    }

    fn content_type_str(content_type: ContentType) -> String {
        let mut headers = lettre::message::header::Headers::new();
        headers.set(content_type);
        headers.get_raw("Content-Type").unwrap().to_owned()
    }

    #[test]
    fn guess_content_type_classifies_by_extension() {
        assert_eq!(content_type_str(guess_content_type("results.png")), "image/png");
        assert_eq!(content_type_str(guess_content_type("notes.txt")), "text/plain");
        assert_eq!(
            content_type_str(guess_content_type("data.bin")),
            "application/octet-stream"
        );
    }
}
