use super::{DeliveryError, NotificationChannel};
use crate::entities::message::Message;
use crate::entities::user::User;
use async_trait::async_trait;
use oauth1_request as oauth;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

/// OAuth1 user-context credentials of the account that sends the messages.
#[derive(Clone, serde::Deserialize)]
pub struct TwitterCredentials {
    #[serde(rename = "API_KEY")]
    pub api_key: String,
    #[serde(rename = "API_KEY_SECRET")]
    pub api_key_secret: String,
    #[serde(rename = "ACCESS_TOKEN")]
    pub access_token: String,
    #[serde(rename = "ACCESS_TOKEN_SECRET")]
    pub access_token_secret: String,
}

impl std::fmt::Debug for TwitterCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwitterCredentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

/// Sends messages as Twitter direct messages.
pub struct TwitterDmChannel {
    api_base_url: Url,
    credentials: TwitterCredentials,
    http_client: reqwest::Client,
}

#[derive(serde::Serialize)]
struct DmEvent<'a> {
    event: DmEventBody<'a>,
}

#[derive(serde::Serialize)]
struct DmEventBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message_create: MessageCreate<'a>,
}

#[derive(serde::Serialize)]
struct MessageCreate<'a> {
    target: Target<'a>,
    message_data: MessageData<'a>,
}

#[derive(serde::Serialize)]
struct Target<'a> {
    recipient_id: &'a str,
}

#[derive(serde::Serialize)]
struct MessageData<'a> {
    text: &'a str,
}

impl<'a> DmEvent<'a> {
    fn new(recipient_id: &'a str, text: &'a str) -> Self {
        Self {
            event: DmEventBody {
                kind: "message_create",
                message_create: MessageCreate {
                    target: Target { recipient_id },
                    message_data: MessageData { text },
                },
            },
        }
    }
}

impl TwitterDmChannel {
    const DM_PATH: &str = "/1.1/direct_messages/events/new.json";

    pub fn new(api_base_url: Url, credentials: TwitterCredentials) -> Result<Self, DeliveryError> {
        Ok(Self {
            api_base_url,
            credentials,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
        })
    }

    /// Load the four OAuth1 keys from a JSON secrets file.
    pub fn from_secrets_file(api_base_url: Url, path: &Path) -> Result<Self, DeliveryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DeliveryError::Credentials(format!("{}: {}", path.display(), e)))?;
        let credentials: TwitterCredentials = serde_json::from_str(&raw)
            .map_err(|e| DeliveryError::Credentials(format!("{}: {}", path.display(), e)))?;
        Self::new(api_base_url, credentials)
    }

    fn dm_url(&self) -> Result<Url, DeliveryError> {
        Ok(self.api_base_url.join(Self::DM_PATH)?)
    }

    /// `Authorization` header for a POST to `url` with a JSON body.
    ///
    /// JSON bodies are not part of the OAuth1 signature base string.
    fn authorization(&self, url: &Url) -> String {
        let token = oauth::Token::from_parts(
            self.credentials.api_key.as_str(),
            self.credentials.api_key_secret.as_str(),
            self.credentials.access_token.as_str(),
            self.credentials.access_token_secret.as_str(),
        );
        oauth::post(url.as_str(), &(), &token, oauth::HMAC_SHA1)
    }
}

#[async_trait]
impl NotificationChannel for TwitterDmChannel {
    async fn deliver(&self, user: &User, message: &Message) -> Result<(), DeliveryError> {
        let Some(recipient_id) = user.twitter_user_id.as_deref() else {
            return Err(DeliveryError::MissingRecipient { user_id: user.id });
        };

        let url = self.dm_url()?;
        let authorization = self.authorization(&url);
        let response = self
            .http_client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(&DmEvent::new(recipient_id, &message.body))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(
                user_id = user.id,
                status = status.as_u16(),
                "Twitter rejected direct message"
            );
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Logs messages instead of sending them. Always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockDmChannel;

#[async_trait]
impl NotificationChannel for MockDmChannel {
    async fn deliver(&self, user: &User, message: &Message) -> Result<(), DeliveryError> {
        info!(
            user_id = user.id,
            key = %message.key,
            body = %message.body,
            "Mock direct message"
        );
        Ok(())
    }
}
