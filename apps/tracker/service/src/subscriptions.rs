//! Double opt-in newsletter subscriptions.
//!
//! A visitor submits an email address, receives a confirmation link, and
//! only becomes a subscriber once the link is followed. Pending tokens are
//! single-use, keyed by a server-side secret, and expire after a configured
//! TTL. State lives behind one `RwLock` and is snapshotted to a JSON file
//! after every mutation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

/// Confirmation tokens are 32 lowercase hex characters.
pub const TOKEN_LENGTH: usize = 32;

const MAX_EMAIL_LENGTH: usize = 254;

#[derive(Clone)]
pub struct SubscriptionService {
    transport: Arc<dyn EmailTransport>,
    state: Arc<RwLock<SubscriptionState>>,
    store: SubscriptionStateStore,
    token_secret: Option<String>,
    confirm_ttl: Duration,
    resubmit_cooldown: Duration,
    confirm_base_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct SubscriptionState {
    pending_by_token: HashMap<String, PendingTokenRecord>,
    pending_token_by_email: HashMap<String, String>,
    subscribers_by_email: HashMap<String, SubscriberRecord>,
    consumed_tokens: HashMap<String, ConsumedTokenRecord>,
    last_request_at: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingTokenRecord {
    token: String,
    email: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubscriberRecord {
    id: String,
    email: String,
    subscribed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsumedTokenRecord {
    email: String,
    consumed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubscribeResult {
    pub email: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub message_id: String,
}

#[derive(Debug, Clone)]
pub struct ConfirmResult {
    pub already_confirmed: bool,
    pub subscriber: SubscriberView,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberView {
    pub id: String,
    pub email: String,
    pub subscribed_at: DateTime<Utc>,
}

impl SubscriberView {
    fn from_record(record: &SubscriberRecord) -> Self {
        Self {
            id: record.id.clone(),
            email: record.email.clone(),
            subscribed_at: record.subscribed_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("{message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("A confirmation email was sent recently. Retry in {retry_after_seconds}s.")]
    Cooldown { retry_after_seconds: i64 },
    #[error("That confirmation link is not valid.")]
    InvalidToken,
    #[error("That confirmation link was not found. Request a new one.")]
    NotFound,
    #[error("That confirmation link has expired. Request a new one.")]
    Expired,
    #[error("{message}")]
    Provider { message: String },
    #[error("{message}")]
    Storage { message: String },
}

#[derive(Debug, Clone)]
pub struct EmailDelivery {
    pub message_id: String,
}

/// Outbound email seam. The service only ever asks a transport to deliver
/// one confirmation link; everything else about email is out of scope.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_confirmation(
        &self,
        to: &str,
        confirm_url: &str,
    ) -> Result<EmailDelivery, SubscriptionError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
pub struct MockEmailTransport {
    sent: Mutex<Vec<RecordedEmail>>,
}

#[derive(Debug, Clone)]
pub struct RecordedEmail {
    pub to: String,
    pub confirm_url: String,
}

impl MockEmailTransport {
    pub async fn sent(&self) -> Vec<RecordedEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailTransport for MockEmailTransport {
    async fn send_confirmation(
        &self,
        to: &str,
        confirm_url: &str,
    ) -> Result<EmailDelivery, SubscriptionError> {
        self.sent.lock().await.push(RecordedEmail {
            to: to.to_string(),
            confirm_url: confirm_url.to_string(),
        });

        Ok(EmailDelivery {
            message_id: format!("mock_{}", Uuid::new_v4().simple()),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[derive(Debug, Clone)]
struct ResendEmailTransport {
    api_key: String,
    base_url: String,
    from: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ResendSendResponse {
    id: String,
}

#[async_trait]
impl EmailTransport for ResendEmailTransport {
    async fn send_confirmation(
        &self,
        to: &str,
        confirm_url: &str,
    ) -> Result<EmailDelivery, SubscriptionError> {
        let body = serde_json::json!({
            "from": self.from,
            "to": [to],
            "subject": "Confirm your Silksong release updates",
            "html": format!(
                "<p>Follow <a href=\"{confirm_url}\">this link</a> to confirm your \
                 subscription to Silksong release updates.</p>\
                 <p>If you did not request this, you can ignore this email.</p>"
            ),
        });

        let response = self
            .http
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| SubscriptionError::Provider {
                message: format!("confirmation email request failed: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SubscriptionError::Provider {
                message: format!("email provider rejected the confirmation send ({status})"),
            });
        }

        let payload: ResendSendResponse =
            response
                .json()
                .await
                .map_err(|error| SubscriptionError::Provider {
                    message: format!("email provider returned an unreadable response: {error}"),
                })?;

        Ok(EmailDelivery {
            message_id: payload.id,
        })
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}

#[derive(Debug, Clone)]
struct UnavailableEmailTransport {
    message: String,
}

#[async_trait]
impl EmailTransport for UnavailableEmailTransport {
    async fn send_confirmation(
        &self,
        _to: &str,
        _confirm_url: &str,
    ) -> Result<EmailDelivery, SubscriptionError> {
        Err(SubscriptionError::Provider {
            message: self.message.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

fn transport_from_config(config: &Config) -> Arc<dyn EmailTransport> {
    match config.email_provider_mode.as_str() {
        "mock" => Arc::new(MockEmailTransport::default()),
        "resend" => match config.resend_api_key.as_ref() {
            Some(api_key) => Arc::new(ResendEmailTransport {
                api_key: api_key.clone(),
                base_url: config.resend_api_base_url.clone(),
                from: config.email_from.clone(),
                http: reqwest::Client::new(),
            }),
            None => Arc::new(UnavailableEmailTransport {
                message: "resend email transport requires RESEND_API_KEY".to_string(),
            }),
        },
        other => Arc::new(UnavailableEmailTransport {
            message: format!("unknown email provider mode '{other}'"),
        }),
    }
}

#[derive(Debug, Clone)]
struct SubscriptionStateStore {
    path: Option<PathBuf>,
}

impl SubscriptionStateStore {
    fn from_config(config: &Config) -> Self {
        Self {
            path: config.subscribe_store_path.clone(),
        }
    }

    fn load_state(&self) -> SubscriptionState {
        let Some(path) = self.path.as_ref() else {
            return SubscriptionState::default();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return SubscriptionState::default();
            }
            Err(error) => {
                tracing::warn!(
                    target: "tracker.subscriptions",
                    path = %path.display(),
                    error = %error,
                    "failed to read subscription store; booting with empty state",
                );
                return SubscriptionState::default();
            }
        };

        match serde_json::from_str::<SubscriptionState>(&raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(
                    target: "tracker.subscriptions",
                    path = %path.display(),
                    error = %error,
                    "failed to parse subscription store; booting with empty state",
                );
                SubscriptionState::default()
            }
        }
    }

    async fn persist_state(&self, state: &SubscriptionState) -> Result<(), SubscriptionError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| SubscriptionError::Storage {
                    message: format!("failed to prepare subscription store directory: {error}"),
                })?;
        }

        let payload = serde_json::to_vec(state).map_err(|error| SubscriptionError::Storage {
            message: format!("failed to encode subscription store payload: {error}"),
        })?;
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| SubscriptionError::Storage {
                message: format!("failed to write subscription store payload: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|error| SubscriptionError::Storage {
                message: format!("failed to finalize subscription store payload: {error}"),
            })?;

        Ok(())
    }
}

impl SubscriptionService {
    pub fn from_config(config: &Config) -> Self {
        Self::with_transport(config, transport_from_config(config))
    }

    pub fn with_transport(config: &Config, transport: Arc<dyn EmailTransport>) -> Self {
        let store = SubscriptionStateStore::from_config(config);
        let loaded_state = store.load_state();

        Self {
            transport,
            state: Arc::new(RwLock::new(loaded_state)),
            store,
            token_secret: config.token_secret.clone(),
            confirm_ttl: Duration::seconds(config.confirm_ttl_seconds as i64),
            resubmit_cooldown: Duration::seconds(config.resubmit_cooldown_seconds as i64),
            confirm_base_url: config.confirm_base_url.clone(),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Issue a pending confirmation token and send the confirmation email.
    ///
    /// An existing pending token for the same email is overwritten, so
    /// resubmitting after the cooldown invalidates the earlier link. The
    /// pending record is persisted before the email goes out; a transport
    /// failure leaves the token in place for a later resubmit.
    pub async fn subscribe(&self, email: String) -> Result<SubscribeResult, SubscriptionError> {
        let normalized_email = normalize_email(&email)?;

        let token_secret =
            self.token_secret
                .as_ref()
                .ok_or_else(|| SubscriptionError::Provider {
                    message: "confirmation token signing is not configured".to_string(),
                })?;

        let now = Utc::now();
        let nonce = Uuid::new_v4().simple().to_string();
        let token = derive_token(token_secret, &normalized_email, now, &nonce)?;
        let expires_at = now + self.confirm_ttl;

        let snapshot = {
            let mut state = self.state.write().await;

            if let Some(last) = state.last_request_at.get(&normalized_email) {
                let elapsed = now.signed_duration_since(*last);
                if elapsed < self.resubmit_cooldown {
                    let retry_after_seconds =
                        (self.resubmit_cooldown - elapsed).num_seconds().max(1);
                    return Err(SubscriptionError::Cooldown {
                        retry_after_seconds,
                    });
                }
            }

            if let Some(previous_token) = state.pending_token_by_email.remove(&normalized_email) {
                state.pending_by_token.remove(&previous_token);
            }

            state.pending_by_token.insert(
                token.clone(),
                PendingTokenRecord {
                    token: token.clone(),
                    email: normalized_email.clone(),
                    created_at: now,
                    expires_at,
                },
            );
            state
                .pending_token_by_email
                .insert(normalized_email.clone(), token.clone());
            state.last_request_at.insert(normalized_email.clone(), now);

            state.clone()
        };
        self.store.persist_state(&snapshot).await?;

        let confirm_url = format!(
            "{}/api/newsletter/confirm/{}",
            self.confirm_base_url, token
        );
        let delivery = self
            .transport
            .send_confirmation(&normalized_email, &confirm_url)
            .await?;

        Ok(SubscribeResult {
            email: normalized_email,
            token,
            expires_at,
            message_id: delivery.message_id,
        })
    }

    /// Check a token without consuming it. Format is rejected before any
    /// lookup; expired records are removed on sight.
    pub async fn validate_token(&self, token: &str) -> Result<String, SubscriptionError> {
        if !token_format_is_valid(token) {
            return Err(SubscriptionError::InvalidToken);
        }

        let now = Utc::now();
        let mut state = self.state.write().await;

        let record = state
            .pending_by_token
            .get(token)
            .cloned()
            .ok_or(SubscriptionError::NotFound)?;

        if record.expires_at <= now {
            state.pending_by_token.remove(token);
            state.pending_token_by_email.remove(&record.email);
            let snapshot = state.clone();
            drop(state);
            if let Err(error) = self.store.persist_state(&snapshot).await {
                tracing::warn!(
                    target: "tracker.subscriptions",
                    error = %error,
                    "failed to persist removal of an expired token",
                );
            }
            return Err(SubscriptionError::Expired);
        }

        Ok(record.email)
    }

    /// Consume a token: insert the subscriber if absent and drop the
    /// pending record. Re-confirming a consumed token for a subscribed
    /// email answers `already_confirmed` instead of erroring.
    pub async fn confirm(&self, token: &str) -> Result<ConfirmResult, SubscriptionError> {
        if !token_format_is_valid(token) {
            return Err(SubscriptionError::InvalidToken);
        }

        let now = Utc::now();
        let (result, snapshot) = {
            let mut state = self.state.write().await;

            if let Some(consumed) = state.consumed_tokens.get(token) {
                if let Some(existing) = state.subscribers_by_email.get(&consumed.email) {
                    return Ok(ConfirmResult {
                        already_confirmed: true,
                        subscriber: SubscriberView::from_record(existing),
                    });
                }
            }

            let record = state
                .pending_by_token
                .get(token)
                .cloned()
                .ok_or(SubscriptionError::NotFound)?;

            if record.expires_at <= now {
                state.pending_by_token.remove(token);
                state.pending_token_by_email.remove(&record.email);
                let snapshot = state.clone();
                drop(state);
                let _ = self.store.persist_state(&snapshot).await;
                return Err(SubscriptionError::Expired);
            }

            state.pending_by_token.remove(token);
            state.pending_token_by_email.remove(&record.email);
            state.consumed_tokens.insert(
                token.to_string(),
                ConsumedTokenRecord {
                    email: record.email.clone(),
                    consumed_at: now,
                },
            );

            let (subscriber, already_confirmed) =
                match state.subscribers_by_email.get(&record.email) {
                    Some(existing) => (existing.clone(), true),
                    None => {
                        let subscriber = SubscriberRecord {
                            id: format!("sub_{}", Uuid::new_v4().simple()),
                            email: record.email.clone(),
                            subscribed_at: now,
                        };
                        state
                            .subscribers_by_email
                            .insert(record.email.clone(), subscriber.clone());
                        (subscriber, false)
                    }
                };

            (
                ConfirmResult {
                    already_confirmed,
                    subscriber: SubscriberView::from_record(&subscriber),
                },
                state.clone(),
            )
        };
        self.store.persist_state(&snapshot).await?;

        Ok(result)
    }

    /// Drop expired pending tokens, stale consumed-token markers, and
    /// cooldown stamps past their window. Returns how many token records
    /// were removed.
    pub async fn sweep_expired(&self) -> Result<usize, SubscriptionError> {
        let now = Utc::now();
        let (removed, snapshot) = {
            let mut state = self.state.write().await;

            let expired_tokens: Vec<String> = state
                .pending_by_token
                .values()
                .filter(|record| record.expires_at <= now)
                .map(|record| record.token.clone())
                .collect();
            for token in &expired_tokens {
                if let Some(record) = state.pending_by_token.remove(token) {
                    state.pending_token_by_email.remove(&record.email);
                }
            }

            let stale_consumed: Vec<String> = state
                .consumed_tokens
                .iter()
                .filter(|(_, record)| now.signed_duration_since(record.consumed_at) > self.confirm_ttl)
                .map(|(token, _)| token.clone())
                .collect();
            for token in &stale_consumed {
                state.consumed_tokens.remove(token);
            }

            let stale_stamps: Vec<String> = state
                .last_request_at
                .iter()
                .filter(|(_, stamp)| now.signed_duration_since(**stamp) > self.resubmit_cooldown)
                .map(|(email, _)| email.clone())
                .collect();
            for email in &stale_stamps {
                state.last_request_at.remove(email);
            }

            (expired_tokens.len() + stale_consumed.len(), state.clone())
        };

        if removed > 0 {
            self.store.persist_state(&snapshot).await?;
        }

        Ok(removed)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.read().await.subscribers_by_email.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending_by_token.len()
    }
}

#[cfg(test)]
impl SubscriptionService {
    pub async fn pending_token_for(&self, email: &str) -> Option<String> {
        self.state
            .read()
            .await
            .pending_token_by_email
            .get(email)
            .cloned()
    }

    pub async fn backdate_pending(&self, token: &str, seconds: i64) {
        let mut state = self.state.write().await;
        if let Some(record) = state.pending_by_token.get_mut(token) {
            record.created_at -= Duration::seconds(seconds);
            record.expires_at -= Duration::seconds(seconds);
        }
    }

    pub async fn clear_cooldown(&self, email: &str) {
        self.state.write().await.last_request_at.remove(email);
    }
}

fn normalize_email(raw_email: &str) -> Result<String, SubscriptionError> {
    let email = raw_email.trim().to_lowercase();

    if email.is_empty() {
        return Err(SubscriptionError::Validation {
            field: "email",
            message: "Email is required.".to_string(),
        });
    }

    if email.len() > MAX_EMAIL_LENGTH {
        return Err(SubscriptionError::Validation {
            field: "email",
            message: "Email address is too long.".to_string(),
        });
    }

    let invalid = || SubscriptionError::Validation {
        field: "email",
        message: "Email address is not valid.".to_string(),
    };

    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };

    if local.is_empty()
        || domain.is_empty()
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
    {
        return Err(invalid());
    }

    Ok(email)
}

fn token_format_is_valid(token: &str) -> bool {
    token.len() == TOKEN_LENGTH
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn derive_token(
    secret: &str,
    email: &str,
    issued_at: DateTime<Utc>,
    nonce: &str,
) -> Result<String, SubscriptionError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|error| {
            SubscriptionError::Provider {
                message: format!("failed to initialize confirmation token signer: {error}"),
            }
        })?;
    mac.update(format!("{email}\n{}\n{nonce}", issued_at.timestamp()).as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut token = String::with_capacity(TOKEN_LENGTH);
    for byte in digest.iter().take(TOKEN_LENGTH / 2) {
        use std::fmt::Write as _;
        let _ = write!(&mut token, "{byte:02x}");
    }

    Ok(token)
}
