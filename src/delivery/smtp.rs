use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::debug;

use crate::config::SmtpConfig;

use super::{DeliveryError, Message, Transport};

const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends reports through an SMTP relay over implicit TLS.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SmtpTransport {
    pub fn new(cfg: &SmtpConfig) -> Result<Self> {
        let field = |v: &Option<String>, name: &str| {
            v.clone()
                .ok_or_else(|| anyhow!("missing required field `smtp.{name}`"))
        };

        let server = field(&cfg.server, "server")?;
        let port = cfg
            .port
            .ok_or_else(|| anyhow!("missing required field `smtp.port`"))?;
        let credentials = Credentials::new(
            field(&cfg.username, "username")?,
            field(&cfg.password, "password")?,
        );

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&server)
            .with_context(|| anyhow!("could not set up an SMTP relay `{server}`"))?
            .port(port)
            .credentials(credentials)
            .timeout(Some(SMTP_TIMEOUT))
            .build();

        let from = parse_mailbox(&field(&cfg.from, "from")?)?;
        let to = cfg
            .to
            .iter()
            .map(|addr| parse_mailbox(addr))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { mailer, from, to })
    }

    fn build_email(&self, message: &Message) -> Result<lettre::Message> {
        let mut builder = lettre::Message::builder()
            .from(self.from.clone())
            .subject(&message.subject);

        for to in &self.to {
            builder = builder.to(to.clone());
        }

        builder
            .multipart(MultiPart::alternative_plain_html(
                message.text.clone(),
                message.html.clone(),
            ))
            .context("could not build the email")
    }
}

fn parse_mailbox(addr: &str) -> Result<Mailbox> {
    addr.parse()
        .with_context(|| anyhow!("could not parse the address `{addr}`"))
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, message: &Message) -> Result<(), DeliveryError> {
        let email = self.build_email(message).map_err(DeliveryError::Permanent)?;

        match self.mailer.send(email).await {
            Ok(response) => {
                debug!(code = %response.code(), "The SMTP server accepted the message");

                Ok(())
            }

            // 5xx replies: bad credentials, rejected sender or recipient
            Err(e) if e.is_permanent() => Err(DeliveryError::Permanent(
                anyhow::Error::new(e).context("the SMTP server rejected the message"),
            )),

            Err(e) => Err(DeliveryError::Transient(
                anyhow::Error::new(e).context("could not send the message"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig {
            enabled: true,
            server: Some("smtp.example.com".into()),
            port: Some(465),
            username: Some("monitor".into()),
            password: Some("hunter2".into()),
            from: Some("Media Monitor <monitor@example.com>".into()),
            to: vec!["alice@example.com".into(), "bob@example.com".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn email_carries_both_bodies() {
        let transport = SmtpTransport::new(&config()).unwrap();
        let email = transport
            .build_email(&Message {
                subject: "Media Monitor Report".into(),
                text: "plain body".into(),
                html: "<p>html body</p>".into(),
            })
            .unwrap();

        let formatted = String::from_utf8(email.formatted()).unwrap();
        assert!(formatted.contains("Subject: Media Monitor Report"));
        assert!(formatted.contains("multipart/alternative"));
        assert!(formatted.contains("text/plain"));
        assert!(formatted.contains("text/html"));
        assert!(formatted.contains("alice@example.com"));
        assert!(formatted.contains("bob@example.com"));
        assert_eq!(email.envelope().to().len(), 2);
    }

    #[tokio::test]
    async fn missing_fields_are_reported() {
        let cfg = SmtpConfig {
            password: None,
            ..config()
        };

        let err = SmtpTransport::new(&cfg).err().unwrap();
        assert!(err.to_string().contains("smtp.password"));
    }
}
