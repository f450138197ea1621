// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Post-cleanup transcript mail
//!
//! Invoked after a natural call end (never after a queue handoff). Errors
//! are reported to the caller which logs them at warn level; nothing here
//! may propagate into the cleanup path.

use crate::settings::Settings;
use anyhow::{Context, Result};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::Path;
use std::sync::Arc;

pub struct TranscriptMail<'a> {
    pub call_id: &'a str,
    pub caller_identity: &'a str,
    pub file_path: &'a Path,
    pub reason: &'a str,
}

pub struct Mailer {
    settings: Arc<Settings>,
}

impl Mailer {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub async fn send_transcript(&self, mail: TranscriptMail<'_>) -> Result<()> {
        let settings = &self.settings;

        let subject = render_template(
            &settings.email_subject_template,
            mail.caller_identity,
            mail.call_id,
            mail.reason,
        );

        let mut body = render_template(
            &settings.email_body_template,
            mail.caller_identity,
            mail.call_id,
            mail.reason,
        );

        match tokio::fs::read_to_string(mail.file_path).await {
            Ok(transcript) => body.push_str(&transcript),
            Err(e) => {
                log::warn!(
                    "could not read transcript {} for mailing: {e}",
                    mail.file_path.display()
                );
                body.push_str("(transcript file could not be read)\n");
            }
        }

        let mut builder = Message::builder()
            .from(
                settings
                    .email_from
                    .parse()
                    .context("invalid EMAIL_FROM address")?,
            )
            .subject(subject);

        let mut recipients = 0;
        for recipient in settings.email_to.split(',') {
            let recipient = recipient.trim();
            if recipient.is_empty() {
                continue;
            }

            builder = builder.to(recipient
                .parse()
                .with_context(|| format!("invalid EMAIL_TO entry {recipient:?}"))?);
            recipients += 1;
        }

        if recipients == 0 {
            log::warn!("EMAIL_ENABLED is set but EMAIL_TO is empty, not sending transcript");
            return Ok(());
        }

        let message = builder.body(body)?;

        let transport = self.transport()?;
        transport
            .send(message)
            .await
            .context("SMTP delivery failed")?;

        log::info!(
            "sent transcript of call {} to {}",
            mail.call_id,
            settings.email_to
        );

        Ok(())
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let settings = &self.settings;

        let mut builder = if settings.smtp_secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_host)
        }
        .port(settings.smtp_port);

        if let Some((user, pass)) = settings.smtp_user.as_ref().zip(settings.smtp_pass.as_ref()) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(builder.build())
    }
}

/// Fill the `{{callerId}}`, `{{channelId}}` and `{{reason}}` placeholders
fn render_template(template: &str, caller_id: &str, channel_id: &str, reason: &str) -> String {
    template
        .replace("{{callerId}}", caller_id)
        .replace("{{channelId}}", channel_id)
        .replace("{{reason}}", reason)
}
