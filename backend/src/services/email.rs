use crate::config::SmtpConfig;
use crate::sequences::{EmailSender, OutboundEmail, SequenceError, SequenceResult};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl EmailService {
    pub fn new(smtp_config: &SmtpConfig) -> SequenceResult<Self> {
        let creds = Credentials::new(
            smtp_config.username.clone(),
            smtp_config.password.clone(),
        );

        let builder = if smtp_config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_config.host)
                .map_err(|e| SequenceError::Configuration(format!("SMTP relay {}: {}", smtp_config.host, e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
        };

        let transport = builder
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Ok(EmailService {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        })
    }

    fn build_message(&self, email: &OutboundEmail) -> SequenceResult<Message> {
        let from = sender_mailbox(
            email.from_name.as_deref().unwrap_or(&self.from_name),
            email.from_email.as_deref().unwrap_or(&self.from_email),
        )?;

        let to = match email.to_name.as_deref() {
            Some(name) => format!("{} <{}>", name, email.to),
            None => email.to.clone(),
        }
        .parse::<Mailbox>()
        .map_err(|e| SequenceError::Delivery(format!("invalid recipient {}: {}", email.to, e)))?;

        let builder = Message::builder().from(from).to(to).subject(email.subject.as_str());

        let message = match (&email.html, &email.text) {
            (Some(html), Some(text)) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_PLAIN).body(text.clone()))
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_HTML).body(html.clone())),
            ),
            (Some(html), None) => builder.header(ContentType::TEXT_HTML).body(html.clone()),
            (None, Some(text)) => builder.header(ContentType::TEXT_PLAIN).body(text.clone()),
            (None, None) => builder.header(ContentType::TEXT_PLAIN).body(String::new()),
        };

        message.map_err(|e| SequenceError::Delivery(format!("could not build message: {}", e)))
    }
}

fn sender_mailbox(name: &str, address: &str) -> SequenceResult<Mailbox> {
    format!("{} <{}>", name, address)
        .parse::<Mailbox>()
        .map_err(|e| SequenceError::Configuration(format!("invalid sender {}: {}", address, e)))
}

#[async_trait]
impl EmailSender for EmailService {
    async fn send_email(&self, email: &OutboundEmail) -> SequenceResult<()> {
        let message = self.build_message(email)?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", email.to);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", email.to, e);
                Err(SequenceError::Delivery(e.to_string()))
            }
        }
    }
}
