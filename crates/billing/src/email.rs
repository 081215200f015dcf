//! Billing email notifications
//!
//! Thin client for a transactional email API plus the dispatcher that runs
//! side effects scheduled by the state machine. Dispatch happens after the
//! record write commits, off the request path; a lost email is a logged
//! nuisance, never a processing failure.

use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use crate::entitlement::SideEffect;
use crate::error::{BillingError, BillingResult};

/// Outbound email must never stall a webhook response.
const EMAIL_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_base: String,
    /// Missing key disables sending entirely (logged no-ops).
    pub api_key: Option<String>,
    pub from_address: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: std::env::var("EMAIL_API_BASE")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            api_key: std::env::var("EMAIL_API_KEY").ok(),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Kanjipress <billing@kanjipress.com>".to_string()),
        }
    }

    /// Config with sending disabled; used when email is not set up.
    pub fn disabled() -> Self {
        Self {
            api_base: String::new(),
            api_key: None,
            from_address: String::new(),
        }
    }
}

/// Sends billing emails through the transactional email API.
#[derive(Clone)]
pub struct BillingEmailService {
    config: Arc<EmailConfig>,
    http: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(EMAIL_HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            config: Arc::new(config),
            http,
        }
    }

    pub fn from_env() -> Self {
        let service = Self::new(EmailConfig::from_env());
        if service.config.api_key.is_none() {
            tracing::warn!("EMAIL_API_KEY not set - billing emails disabled");
        }
        service
    }

    pub async fn send_welcome(&self, to: &str, plan_name: &str) -> BillingResult<()> {
        self.deliver(
            to,
            "Welcome to Kanjipress!",
            &format!(
                "<p>Your {} subscription is active. All worksheets and premium \
                 decks are unlocked - happy studying!</p>",
                plan_name
            ),
        )
        .await
    }

    pub async fn send_trial_ending(
        &self,
        to: &str,
        plan_name: &str,
        days_remaining: i64,
    ) -> BillingResult<()> {
        self.deliver(
            to,
            "Your Kanjipress trial is ending soon",
            &format!(
                "<p>Your {} trial ends in {} day(s). Your subscription will \
                 start automatically unless you cancel before then.</p>",
                plan_name, days_remaining
            ),
        )
        .await
    }

    async fn deliver(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        let api_key = match &self.config.api_key {
            Some(key) => key,
            None => {
                tracing::info!(to = %to, subject = %subject, "Email disabled - skipping send");
                return Ok(());
            }
        };

        let response = self
            .http
            .post(format!("{}/emails", self.config.api_base))
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "from": self.config.from_address,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BillingError::Notification(format!(
                "email API returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Executes side effects scheduled by the state machine.
///
/// Fire-and-forget: the spawned task owns its effects, holds no locks, and
/// its failures are logged and dropped.
#[derive(Clone)]
pub struct NotificationDispatcher {
    email: BillingEmailService,
}

impl NotificationDispatcher {
    pub fn new(email: BillingEmailService) -> Self {
        Self { email }
    }

    /// Spawn dispatch of the effects; returns immediately.
    pub fn dispatch(&self, effects: Vec<SideEffect>) {
        if effects.is_empty() {
            return;
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run(effects).await;
        });
    }

    /// Execute effects inline. Each effect gets a short backoff retry; after
    /// that it is logged and abandoned.
    pub async fn run(&self, effects: Vec<SideEffect>) {
        for effect in effects {
            let strategy = ExponentialBackoff::from_millis(250).take(2);
            let attempt = || async { self.execute(&effect).await };

            if let Err(e) = Retry::spawn(strategy, attempt).await {
                tracing::error!(
                    effect = ?effect,
                    error = %e,
                    "Failed to dispatch notification"
                );
            }
        }
    }

    async fn execute(&self, effect: &SideEffect) -> BillingResult<()> {
        match effect {
            SideEffect::WelcomeEmail { email, plan_name } => {
                self.email.send_welcome(email, plan_name).await
            }
            SideEffect::TrialEndingNotice {
                email,
                plan_name,
                days_remaining,
            } => {
                self.email
                    .send_trial_ending(email, plan_name, *days_remaining)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_service_skips_sending() {
        let service = BillingEmailService::new(EmailConfig::disabled());
        service.send_welcome("a@x.com", "Kanjipress Plus").await.unwrap();
    }

    #[tokio::test]
    async fn welcome_email_posts_to_the_api() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .with_status(200)
            .with_body("{\"id\":\"email_1\"}")
            .expect(1)
            .create_async()
            .await;

        let service = BillingEmailService::new(EmailConfig {
            api_base: server.url(),
            api_key: Some("re_test".to_string()),
            from_address: "billing@test".to_string(),
        });

        service.send_welcome("a@x.com", "Kanjipress Plus").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn dispatch_failure_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        // 3 hits: initial attempt plus two backoff retries, all failing.
        let mock = server
            .mock("POST", "/emails")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let dispatcher = NotificationDispatcher::new(BillingEmailService::new(EmailConfig {
            api_base: server.url(),
            api_key: Some("re_test".to_string()),
            from_address: "billing@test".to_string(),
        }));

        // Must not panic or propagate the failure.
        dispatcher
            .run(vec![SideEffect::WelcomeEmail {
                email: "a@x.com".to_string(),
                plan_name: "Kanjipress Plus".to_string(),
            }])
            .await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn each_effect_is_sent_exactly_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .with_status(200)
            .with_body("{}")
            .expect(2)
            .create_async()
            .await;

        let dispatcher = NotificationDispatcher::new(BillingEmailService::new(EmailConfig {
            api_base: server.url(),
            api_key: Some("re_test".to_string()),
            from_address: "billing@test".to_string(),
        }));

        dispatcher
            .run(vec![
                SideEffect::WelcomeEmail {
                    email: "a@x.com".to_string(),
                    plan_name: "Kanjipress Plus".to_string(),
                },
                SideEffect::TrialEndingNotice {
                    email: "b@x.com".to_string(),
                    plan_name: "Kanjipress Plus".to_string(),
                    days_remaining: 3,
                },
            ])
            .await;

        mock.assert_async().await;
    }
}
