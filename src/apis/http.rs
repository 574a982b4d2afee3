use std::sync::Arc;
use std::time::Duration;

use reqwest::{IntoUrl, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::{SourceContext, SourceError};
use crate::cache::ResponseCache;
use crate::record::Source;
use crate::retry::RetryPolicy;

pub const USER_AGENT: &str = "review-search/0.1";

/// Longest error body kept in [`SourceError::Status`].
const ERROR_BODY_LIMIT: usize = 500;

/// HTTP handle owned by one adapter: cache lookup, retried send, status
/// mapping and cache store around every GET.
#[derive(Clone)]
pub struct Http {
    client: reqwest::Client,
    retry: RetryPolicy,
    cache: Option<Arc<ResponseCache>>,
    source: Source,
}

impl Http {
    pub fn new(source: Source, timeout: Duration, ctx: &SourceContext) -> Result<Self, SourceError> {
        Self::build(source, reqwest::Client::builder().user_agent(USER_AGENT).timeout(timeout), ctx)
    }

    pub fn build(
        source: Source,
        builder: reqwest::ClientBuilder,
        ctx: &SourceContext,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: builder.build()?,
            retry: ctx.retry.clone(),
            cache: ctx.cache.clone(),
            source,
        })
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.client.get(url)
    }

    /// Send with retries and return the body of a 2xx response.
    pub async fn text(&self, req: RequestBuilder) -> Result<String, SourceError> {
        let request = req.build()?;
        let key = request.url().to_string();
        if let Some(body) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            tracing::debug!(source = %self.source, url = %key, "cache hit");
            return Ok(body);
        }

        let label = format!("{} {}", self.source, request.url().path());
        let body = self
            .retry
            .run(&label, || {
                let attempt = request.try_clone();
                let client = &self.client;
                async move {
                    let attempt = attempt.ok_or_else(|| {
                        SourceError::Api("request body cannot be replayed".to_string())
                    })?;
                    let resp = check_status(client.execute(attempt).await?).await?;
                    Ok(resp.text().await?)
                }
            })
            .await?;

        if let Some(cache) = &self.cache {
            cache.insert(key, body.clone());
            tracing::debug!(source = %self.source, entries = cache.len(), "response cached");
        }
        Ok(body)
    }

    pub async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, SourceError> {
        let body = self.text(req).await?;
        serde_json::from_str(&body)
            .map_err(|e| SourceError::Parse(format!("{} returned malformed JSON: {}", self.source, e)))
    }
}

async fn check_status(resp: Response) -> Result<Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    Err(SourceError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Pause between consecutive requests to the same backend.
pub async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
