use std::fmt;
use std::time::Duration;

use reqwest::{Client, Method};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum RestError {
    Http(reqwest::Error),
}

impl fmt::Display for RestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestError::Http(e) => write!(f, "HTTP error: {e}"),
        }
    }
}

impl std::error::Error for RestError {}

impl From<reqwest::Error> for RestError {
    fn from(e: reqwest::Error) -> Self {
        RestError::Http(e)
    }
}

/// An API response: the status code plus the parsed JSON body (an empty
/// object when the body is empty or not JSON). Non-2xx statuses are not
/// errors here — callers branch on the code themselves.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub data: serde_json::Value,
}

/// Thin wrapper over the Discord REST API. Carries no protocol state; the
/// gateway client is entirely independent of it.
pub struct RestClient {
    client: Client,
    base_url: String,
    token: String,
}

impl RestClient {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            token,
        }
    }

    /// Make a request to the given endpoint (path below the API base).
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, RestError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut builder = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Bot {}", self.token))
            .timeout(REQUEST_TIMEOUT);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let resp = builder.send().await?;

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        let data = serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({}));
        Ok(ApiResponse { status, data })
    }

    pub async fn create_message(
        &self,
        channel_id: &str,
        payload: &serde_json::Value,
    ) -> Result<ApiResponse, RestError> {
        self.request(
            Method::POST,
            &format!("/channels/{channel_id}/messages"),
            Some(payload),
        )
        .await
    }

    pub async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        payload: &serde_json::Value,
    ) -> Result<ApiResponse, RestError> {
        self.request(
            Method::PATCH,
            &format!("/channels/{channel_id}/messages/{message_id}"),
            Some(payload),
        )
        .await
    }

    pub async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<ApiResponse, RestError> {
        self.request(
            Method::DELETE,
            &format!("/channels/{channel_id}/messages/{message_id}"),
            None,
        )
        .await
    }
}
