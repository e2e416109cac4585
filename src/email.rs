use crate::config::SmtpConfig;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Async SMTP service for tenant welcome notices.
pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl EmailService {
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            transport,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
        })
    }

    /// Send the welcome notice to a freshly provisioned tenant's admin.
    pub async fn send_welcome(
        &self,
        to_email: &str,
        subdomain: &str,
        company_name: &str,
    ) -> anyhow::Result<()> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid from address: {}", e))?;

        let to = to_email
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid to address: {}", e))?;

        let body = format!(
            "Welcome to Palletbase!\n\nYour workspace for {} is ready:\n\n  https://{}.palletbase.app\n\nSign in with this email address to start tracking orders, pallets and production runs.",
            company_name, subdomain
        );

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(format!("Your Palletbase workspace '{}' is ready", subdomain))
            .header(ContentType::TEXT_PLAIN)
            .body(body)?;

        self.transport
            .send(email)
            .await
            .map_err(|e| anyhow::anyhow!("SMTP send failed: {}", e))?;

        Ok(())
    }
}
