//! HTTP gateway client.
//!
//! Speaks a small JSON protocol against the configured gateway base URL:
//! `POST /send` and `POST /edit`. HTTP 429 maps to `RateLimited` so the
//! delivery layer can back off.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::settings::GatewayConfig;

use super::{ChatTransport, MessageId, TransportError};

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    conversation_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    buttons: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct EditRequest<'a> {
    message_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: String,
}

/// Reqwest-based gateway client.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{path}", self.base_url));
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(TransportError::Other(format!(
                "gateway returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        buttons: Option<&[String]>,
    ) -> Result<MessageId, TransportError> {
        debug!(
            "gateway send to {} ({} bytes, buttons: {})",
            conversation_id,
            text.len(),
            buttons.map(|b| b.len()).unwrap_or(0)
        );

        let response = self
            .execute(self.request("/send").json(&SendRequest {
                conversation_id,
                text,
                buttons,
            }))
            .await?;

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(body.message_id)
    }

    async fn edit(&self, message_id: &MessageId, text: &str) -> Result<(), TransportError> {
        debug!("gateway edit {} ({} bytes)", message_id, text.len());

        self.execute(self.request("/edit").json(&EditRequest {
            message_id,
            text,
        }))
        .await?;
        Ok(())
    }
}
