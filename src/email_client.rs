use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::env;

struct SmtpSettings {
    server: String,
    username: String,
    password: String,
    from: String,
    to: String,
}

/// SMTP mailer configured from `EMAIL_SMTP_SERVER`, `EMAIL_USERNAME`,
/// `EMAIL_PASSWORD`, `EMAIL_FROM` and `EMAIL_TO`. Sending is a no-op when any
/// of them is missing.
pub struct EmailClient {
    settings: Option<SmtpSettings>,
}

impl EmailClient {
    pub fn new() -> Self {
        let read = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        let settings = (|| {
            let username = read("EMAIL_USERNAME")?;
            Some(SmtpSettings {
                server: read("EMAIL_SMTP_SERVER")?,
                from: read("EMAIL_FROM").unwrap_or_else(|| username.clone()),
                password: read("EMAIL_PASSWORD")?,
                to: read("EMAIL_TO")?,
                username,
            })
        })();
        Self { settings }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.is_some()
    }

    /// Returns whether the mail was handed to the SMTP server.
    pub fn send(&self, subject: &str, body: &str) -> bool {
        let Some(settings) = &self.settings else {
            log::debug!("email disabled, dropping '{}'", subject);
            return false;
        };
        match Self::deliver(settings, subject, body) {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to send email '{}': {}", subject, e);
                false
            }
        }
    }

    fn deliver(settings: &SmtpSettings, subject: &str, body: &str) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(settings.from.parse()?)
            .to(settings.to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;
        let mailer = SmtpTransport::relay(&settings.server)?
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();
        mailer.send(&email)?;
        Ok(())
    }
}

impl Default for EmailClient {
    fn default() -> Self {
        Self::new()
    }
}
