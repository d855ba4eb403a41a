//! Rate-limited HTTP plumbing shared by the adapters.
//!
//! A [`RequestTemplate`] describes one provider call. Each attempt rebuilds the
//! `reqwest` request from it inside the rate limit manager, so adapters never
//! loop or retry on their own.

use std::time::Duration;

use reqwest::{Client, Method, header::RETRY_AFTER};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::connectors::ConnectorError;
use crate::error::IntegrationError;
use crate::models::ProviderType;
use crate::rate_limit::{RateLimitManager, RequestPriority, RequestSpec};

#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub headers: Vec<(&'static str, String)>,
    pub query: Vec<(String, String)>,
    pub json: Option<Value>,
    pub form: Option<Vec<(String, String)>>,
}

impl RequestTemplate {
    pub fn new<S: Into<String>>(method: Method, url: S) -> Self {
        Self {
            method,
            url: url.into(),
            bearer: None,
            headers: Vec::new(),
            query: Vec::new(),
            json: None,
            form: None,
        }
    }

    pub fn get<S: Into<String>>(url: S) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post<S: Into<String>>(url: S) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn bearer<S: Into<String>>(mut self, token: S) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn header<S: Into<String>>(mut self, name: &'static str, value: S) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn query<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.form = Some(fields);
        self
    }

    fn build(&self, client: &Client) -> reqwest::RequestBuilder {
        let mut request = client.request(self.method.clone(), &self.url);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        for (name, value) in &self.headers {
            request = request.header(*name, value);
        }
        if !self.query.is_empty() {
            request = request.query(&self.query);
        }
        if let Some(body) = &self.json {
            request = request.json(body);
        } else if let Some(fields) = &self.form {
            request = request.form(fields);
        }
        request
    }
}

/// Decoded provider response with the `Link` header kept for cursor pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub body: Value,
    pub link: Option<String>,
}

/// Per-provider HTTP client routing every call through the rate limit manager.
#[derive(Clone)]
pub struct ProviderHttpClient {
    provider: ProviderType,
    client: Client,
    limiter: RateLimitManager,
}

impl ProviderHttpClient {
    pub fn new(
        provider: ProviderType,
        limiter: RateLimitManager,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pos-connectors/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            provider,
            client,
            limiter,
        })
    }

    pub fn provider(&self) -> ProviderType {
        self.provider
    }

    pub async fn send(
        &self,
        tenant_id: Option<Uuid>,
        operation: &str,
        priority: RequestPriority,
        template: RequestTemplate,
    ) -> Result<ProviderResponse, IntegrationError> {
        let spec = RequestSpec::new(self.provider, operation)
            .tenant(tenant_id)
            .priority(priority);
        let client = self.client.clone();
        self.limiter
            .execute(spec, move || {
                let client = client.clone();
                let template = template.clone();
                async move { perform(&client, &template).await }
            })
            .await
    }

    /// [`send`](Self::send) at normal priority, returning only the body.
    pub async fn json(
        &self,
        tenant_id: Option<Uuid>,
        operation: &str,
        template: RequestTemplate,
    ) -> Result<Value, IntegrationError> {
        self.send(tenant_id, operation, RequestPriority::Normal, template)
            .await
            .map(|response| response.body)
    }
}

async fn perform(
    client: &Client,
    template: &RequestTemplate,
) -> Result<ProviderResponse, ConnectorError> {
    debug!(method = %template.method, url = %template.url, "Calling provider API");
    let response = template.build(client).send().await?;
    let status = response.status();

    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|secs| secs.ceil().max(0.0) as u64);
        let body = response.text().await.ok().filter(|b| !b.is_empty());
        return Err(ConnectorError::HttpError {
            status: status.as_u16(),
            body,
            retry_after,
        });
    }

    let link = response
        .headers()
        .get(reqwest::header::LINK)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response.bytes().await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).map_err(|err| ConnectorError::MalformedResponse {
            details: err.to_string(),
        })?
    };

    Ok(ProviderResponse { body, link })
}

/// URL tagged `rel="next"` in an RFC 8288 `Link` header.
pub fn next_link(link: &str) -> Option<String> {
    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        is_next.then(|| {
            target
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string()
        })
    })
}
