//! HTTP client for a JSON chat-history API.
//!
//! Endpoints:
//! - `GET {base}/conversations/{id}/messages?limit=N&before_id=M`: newest first
//! - `GET {base}/conversations/{id}/messages?limit=1&reverse=true`: oldest first
//!
//! Both answer `{ "messages": [ { "id": .., "date": .., "payload": .. } ] }`.
//! HTTP 429 becomes [`BackfillError::RateLimited`], with the wait taken from the
//! `Retry-After` header or a `retry_after` body field.

use crate::error::{BackfillError, BackfillResult};
use crate::source::HistorySource;
use async_trait::async_trait;
use chatvault_types::{ConversationId, HistoryMessage, MessageId};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

#[derive(Deserialize)]
struct MessagesResponse {
    messages: Vec<HistoryMessage>,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: Option<u64>,
}

/// [`HistorySource`] over HTTP with bearer authentication.
pub struct HttpHistorySource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpHistorySource {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> BackfillResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get_messages(
        &self,
        conversation: ConversationId,
        query: &[(&str, String)],
    ) -> BackfillResult<Vec<HistoryMessage>> {
        let url = format!("{}/conversations/{conversation}/messages", self.base_url);
        let mut req = self.client.get(&url).query(query);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;

        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            let wait_secs = retry_after_secs(resp).await;
            debug!("429 on GET {url}, source asks for {wait_secs}s");
            return Err(BackfillError::RateLimited { wait_secs });
        }

        let resp = resp
            .error_for_status()
            .map_err(|e| BackfillError::Source(e.to_string()))?;
        let body: MessagesResponse = resp.json().await?;
        Ok(body.messages)
    }
}

async fn retry_after_secs(resp: Response) -> u64 {
    let header = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(secs) = header {
        return secs;
    }
    resp.json::<RateLimitBody>()
        .await
        .ok()
        .and_then(|b| b.retry_after)
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch_messages(
        &self,
        conversation: ConversationId,
        limit: usize,
        before_id: MessageId,
    ) -> BackfillResult<Vec<HistoryMessage>> {
        self.get_messages(
            conversation,
            &[("limit", limit.to_string()), ("before_id", before_id.to_string())],
        )
        .await
    }

    async fn fetch_earliest(&self, conversation: ConversationId) -> BackfillResult<Option<MessageId>> {
        let messages = self
            .get_messages(
                conversation,
                &[("limit", "1".to_string()), ("reverse", "true".to_string())],
            )
            .await?;
        Ok(messages.first().map(|m| m.id))
    }
}
