//! Chat service endpoints

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;

use crate::{
    error::{Error, Result},
    stream::ByteStream,
    types::{ChatRequest, Conversation, Message, MessageId, Rating},
};

/// The endpoints a chat client talks to.
///
/// Implemented over HTTP by [`HttpChatApi`]; tests substitute their own.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Conversations of a user, most recently updated first
    async fn list_conversations(&self, user: &str) -> Result<Vec<Conversation>>;

    /// Messages of a conversation, newest first
    async fn list_messages(&self, conversation_id: &str, user: &str) -> Result<Vec<Message>>;

    /// Start a generation and return the raw response body
    async fn send_query(&self, request: &ChatRequest) -> Result<ByteStream>;

    /// Ask the server to stop a running generation
    async fn cancel_task(&self, task_id: &str, user: &str) -> Result<()>;

    /// Persist a rating; `None` clears it
    async fn set_feedback(
        &self,
        message_id: &MessageId,
        rating: Option<Rating>,
        user: &str,
    ) -> Result<()>;
}

/// List envelope used by the listing endpoints
#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

/// Error envelope returned with non-success statuses
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// HTTP implementation of [`ChatApi`]
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    page_limit: u32,
}

impl HttpChatApi {
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost/v1";
    const DEFAULT_PAGE_LIMIT: u32 = 20;

    /// Create a client for the service rooted at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            page_limit: Self::DEFAULT_PAGE_LIMIT,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Number of items requested per listing call
    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    /// Bound the time spent establishing connections.
    ///
    /// Only the connect phase is limited; a streaming body may stay open
    /// for as long as the server keeps generating.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Turn a non-success status into [`Error::Api`]
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::api(status.as_u16(), error_message(&body)))
    }
}

impl Default for HttpChatApi {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_URL)
    }
}

/// Extract a readable message from an error response body
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            code: Some(code),
            message,
        }) => format!("{}: {}", code, message),
        Ok(ErrorBody { message, .. }) => message,
        Err(_) if body.trim().is_empty() => "empty response body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self, user: &str) -> Result<Vec<Conversation>> {
        let limit = self.page_limit.to_string();
        let request = self.client.get(self.url("conversations")).query(&[
            ("user", user),
            ("limit", limit.as_str()),
            ("sort_by", "-updated_at"),
        ]);

        let response = Self::check(self.authorize(request).send().await?).await?;
        let page: Page<Conversation> = response.json().await?;
        if page.has_more {
            tracing::debug!("More than {} conversations available", self.page_limit);
        }
        Ok(page.data)
    }

    async fn list_messages(&self, conversation_id: &str, user: &str) -> Result<Vec<Message>> {
        let limit = self.page_limit.to_string();
        let request = self.client.get(self.url("messages")).query(&[
            ("conversation_id", conversation_id),
            ("user", user),
            ("limit", limit.as_str()),
        ]);

        let response = Self::check(self.authorize(request).send().await?).await?;
        let page: Page<Message> = response.json().await?;
        Ok(page.data)
    }

    async fn send_query(&self, request: &ChatRequest) -> Result<ByteStream> {
        let builder = self.client.post(self.url("chat-messages")).json(request);
        let response = Self::check(self.authorize(builder).send().await?).await?;

        tracing::debug!(status = %response.status(), "Response stream opened");
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from));
        Ok(Box::pin(body))
    }

    async fn cancel_task(&self, task_id: &str, user: &str) -> Result<()> {
        let builder = self
            .client
            .post(self.url(&format!("chat-messages/{}/stop", task_id)))
            .json(&serde_json::json!({ "user": user }));

        Self::check(self.authorize(builder).send().await?).await?;
        Ok(())
    }

    async fn set_feedback(
        &self,
        message_id: &MessageId,
        rating: Option<Rating>,
        user: &str,
    ) -> Result<()> {
        let builder = self
            .client
            .post(self.url(&format!("messages/{}/feedbacks", message_id)))
            .json(&serde_json::json!({ "rating": rating, "user": user }));

        Self::check(self.authorize(builder).send().await?).await?;
        Ok(())
    }
}
