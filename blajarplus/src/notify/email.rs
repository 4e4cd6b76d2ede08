//! Outbound email.
//!
//! Two providers: [`ConsoleEmailProvider`] logs a boxed rendering of every
//! email (development, tests), [`SmtpEmailProvider`] delivers through an SMTP
//! relay with lettre.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as Email, Tokio1Executor};
use tracing::info;

/// Email delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// Sender or recipient address did not parse
    #[error("invalid address {address}: {reason}")]
    InvalidAddress {
        /// Offending address
        address: String,
        /// Parser message
        reason: String,
    },

    /// Message could not be assembled
    #[error("failed to build email: {0}")]
    Build(String),

    /// Relay refused or connection failed
    #[error("failed to send email: {0}")]
    Transport(String),
}

/// Something that can deliver the emails BlajarPlus sends.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Send a sign-in link.
    async fn send_magic_link(
        &self,
        to: &str,
        link: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EmailError>;

    /// Send a plain notification email.
    async fn send_notification(&self, to: &str, subject: &str, body: &str)
    -> Result<(), EmailError>;
}

/// Logs emails instead of sending them.
#[derive(Clone, Debug, Default)]
pub struct ConsoleEmailProvider;

impl ConsoleEmailProvider {
    /// Create a console provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn boxed(title: &str, to: &str, subject: &str, lines: &[&str]) -> String {
    let mut out = String::new();
    out.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
    out.push_str(&format!("║ {title:<61}║\n"));
    out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
    out.push_str(&format!("║ To: {to:<57}║\n"));
    out.push_str(&format!("║ Subject: {subject:<52}║\n"));
    out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
    for line in lines {
        let mut remaining: &str = line;
        while !remaining.is_empty() {
            let cut = remaining
                .char_indices()
                .nth(60)
                .map_or(remaining.len(), |(i, _)| i);
            let (chunk, rest) = remaining.split_at(cut);
            out.push_str(&format!("║ {chunk:<61}║\n"));
            remaining = rest;
        }
    }
    out.push_str("╚══════════════════════════════════════════════════════════════╝");
    out
}

#[async_trait]
impl EmailProvider for ConsoleEmailProvider {
    async fn send_magic_link(
        &self,
        to: &str,
        link: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EmailError> {
        let expires_minutes = (expires_at - Utc::now()).num_minutes();
        let expiry = format!("This link expires in {expires_minutes} minutes.");
        info!(
            to = %to,
            expires_in = %expires_minutes,
            "magic link email (console)\n{}",
            boxed(
                "MAGIC LINK EMAIL",
                to,
                "Masuk ke BlajarPlus",
                &["Open the link below to sign in.", &expiry, "", link],
            )
        );
        Ok(())
    }

    async fn send_notification(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), EmailError> {
        let lines: Vec<&str> = body.lines().collect();
        info!(
            to = %to,
            subject = %subject,
            "notification email (console)\n{}",
            boxed("NOTIFICATION", to, subject, &lines)
        );
        Ok(())
    }
}

/// SMTP settings.
#[derive(Clone)]
pub struct SmtpSettings {
    /// Relay host
    pub host: String,
    /// Relay port (587 for STARTTLS)
    pub port: u16,
    /// Username
    pub username: String,
    /// Password
    pub password: String,
    /// Sender address
    pub from_email: String,
    /// Sender display name
    pub from_name: String,
}

impl std::fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("from_email", &self.from_email)
            .field("from_name", &self.from_name)
            .finish()
    }
}

/// Sends email through an SMTP relay.
#[derive(Clone)]
pub struct SmtpEmailProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpEmailProvider {
    /// Build a provider for a STARTTLS relay.
    ///
    /// # Errors
    ///
    /// Returns [`EmailError::Transport`] if the relay host is invalid.
    pub fn new(settings: &SmtpSettings) -> Result<Self, EmailError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            .map_err(|e| EmailError::Transport(format!("SMTP relay error: {e}")))?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();

        Ok(Self {
            transport,
            from: format!("{} <{}>", settings.from_name, settings.from_email),
        })
    }

    async fn deliver(&self, to: &str, subject: &str, html: String) -> Result<(), EmailError> {
        let email = Email::builder()
            .from(self.from.parse().map_err(|e| EmailError::InvalidAddress {
                address: self.from.clone(),
                reason: format!("{e}"),
            })?)
            .to(to.parse().map_err(|e| EmailError::InvalidAddress {
                address: to.to_string(),
                reason: format!("{e}"),
            })?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html)
            .map_err(|e| EmailError::Build(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for SmtpEmailProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpEmailProvider")
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn layout(heading: &str, inner: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>{heading}</title></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
    <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
        <h2 style="color: #0f766e;">{heading}</h2>
        {inner}
        <p style="color: #666; font-size: 12px; margin-top: 40px;">BlajarPlus</p>
    </div>
</body>
</html>"#
    )
}

#[async_trait]
impl EmailProvider for SmtpEmailProvider {
    async fn send_magic_link(
        &self,
        to: &str,
        link: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EmailError> {
        let expires_minutes = (expires_at - Utc::now()).num_minutes();
        let link = escape_html(link);
        let inner = format!(
            r#"<p>Click the button below to sign in. This link expires in {expires_minutes} minutes.</p>
        <p style="margin: 30px 0;">
            <a href="{link}" style="display: inline-block; background-color: #0f766e; color: white; padding: 12px 24px; text-decoration: none; border-radius: 4px;">Masuk</a>
        </p>
        <p style="color: #666; font-size: 14px;">If you didn't request this email, you can ignore it.</p>
        <p style="color: #666; font-size: 12px;">Or paste this link into your browser:<br>{link}</p>"#
        );
        self.deliver(to, "Masuk ke BlajarPlus", layout("Masuk ke BlajarPlus", &inner))
            .await
    }

    async fn send_notification(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), EmailError> {
        let paragraphs: String = body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| format!("<p>{}</p>", escape_html(line)))
            .collect();
        self.deliver(to, subject, layout(&escape_html(subject), &paragraphs))
            .await
    }
}
