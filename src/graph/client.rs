//! Microsoft Graph client issuing single and `$batch` requests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use super::batch::{self, BatchResult};
use super::endpoint::{Endpoint, EndpointInput};
use crate::error::GraphError;

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An authorized request handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub bearer: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

/// Response of a single request, or one entry of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl GraphResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Either one endpoint or a list to send as one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphRequest {
    Single(EndpointInput),
    Batch(Vec<EndpointInput>),
}

impl From<&str> for GraphRequest {
    fn from(url: &str) -> Self {
        Self::Single(url.into())
    }
}

impl From<EndpointInput> for GraphRequest {
    fn from(input: EndpointInput) -> Self {
        Self::Single(input)
    }
}

impl From<Vec<EndpointInput>> for GraphRequest {
    fn from(inputs: Vec<EndpointInput>) -> Self {
        Self::Batch(inputs)
    }
}

/// Result of [`GraphClient::ms_graph`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GraphResult {
    Single(GraphResponse),
    Batch(BatchResult),
}

/// HTTP transport used by the Graph client, allowing for mocking.
#[async_trait]
pub trait GraphTransport: Send + Sync {
    /// Perform the request. Non-2xx statuses are returned, not raised.
    async fn send(&self, request: HttpRequest) -> Result<GraphResponse, GraphError>;
}

/// Transport implementation using reqwest.
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, GraphError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GraphError::GraphRequestFailed(e.to_string()))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl GraphTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<GraphResponse, GraphError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| GraphError::InvalidEndpoint(format!("method {}", request.method)))?;

        let mut builder = self
            .http_client
            .request(method, &request.url)
            .bearer_auth(&request.bearer)
            .header("client-request-id", uuid::Uuid::new_v4().to_string());

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GraphError::GraphRequestFailed(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| GraphError::ParseFailed(e.to_string()))?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(GraphResponse {
            status,
            headers,
            body,
        })
    }
}

/// Microsoft Graph API client.
pub struct GraphClient {
    transport: Arc<dyn GraphTransport>,
    base_url: String,
}

impl GraphClient {
    pub fn new(transport: Arc<dyn GraphTransport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue `request` as a single call or as one batch.
    pub async fn ms_graph(
        &self,
        access_token: &str,
        request: GraphRequest,
        batch_url: Option<&str>,
    ) -> Result<GraphResult, GraphError> {
        match request {
            GraphRequest::Single(input) => self
                .single(access_token, input)
                .await
                .map(GraphResult::Single),
            GraphRequest::Batch(inputs) => self
                .batch(access_token, inputs, batch_url)
                .await
                .map(GraphResult::Batch),
        }
    }

    /// Send one request. Relative URLs are resolved against the base URL.
    pub async fn single(
        &self,
        access_token: &str,
        input: EndpointInput,
    ) -> Result<GraphResponse, GraphError> {
        let endpoint = Endpoint::normalize(input)?;
        self.send_endpoint(access_token, &endpoint).await
    }

    /// Send the endpoints as one `$batch` call and reassemble the responses.
    pub async fn batch(
        &self,
        access_token: &str,
        inputs: Vec<EndpointInput>,
        batch_url: Option<&str>,
    ) -> Result<BatchResult, GraphError> {
        let endpoints = inputs
            .into_iter()
            .map(Endpoint::normalize)
            .collect::<Result<Vec<_>, _>>()?;

        let keyed = self.batch_keyed(access_token, &endpoints, batch_url).await?;
        Ok(batch::normalize(keyed))
    }

    pub(crate) async fn send_endpoint(
        &self,
        access_token: &str,
        endpoint: &Endpoint,
    ) -> Result<GraphResponse, GraphError> {
        let url = if endpoint.url.starts_with("http") {
            endpoint.url.clone()
        } else {
            format!("{}{}", self.base_url, endpoint.url)
        };

        debug!("Graph {} {}", endpoint.method, url);

        let response = self
            .transport
            .send(HttpRequest {
                method: endpoint.method.clone(),
                url,
                bearer: access_token.to_string(),
                headers: endpoint.headers.clone(),
                body: endpoint.body.clone(),
            })
            .await?;

        check_status(response)
    }

    /// Batch call returning responses keyed by sub-request id.
    pub(crate) async fn batch_keyed(
        &self,
        access_token: &str,
        endpoints: &[Endpoint],
        batch_url: Option<&str>,
    ) -> Result<BTreeMap<String, Value>, GraphError> {
        let requests: Vec<_> = endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| endpoint.to_batch_request(index))
            .collect();

        let url = format!(
            "{}/$batch",
            batch_url
                .map(|url| url.trim_end_matches('/'))
                .unwrap_or(&self.base_url)
        );

        debug!("Graph batch of {} requests to {}", requests.len(), url);

        let response = self
            .transport
            .send(HttpRequest {
                method: "POST".to_string(),
                url,
                bearer: access_token.to_string(),
                headers: BTreeMap::new(),
                body: Some(json!({ "requests": requests })),
            })
            .await?;

        let response = check_status(response)?;
        let responses = match response.body {
            Value::Object(mut fields) => match fields.remove("responses") {
                Some(Value::Array(responses)) => responses,
                _ => {
                    return Err(GraphError::ParseFailed(
                        "batch response has no responses array".into(),
                    ))
                }
            },
            _ => {
                return Err(GraphError::ParseFailed(
                    "batch response is not an object".into(),
                ))
            }
        };

        batch::demultiplex(responses)
    }
}

fn check_status(response: GraphResponse) -> Result<GraphResponse, GraphError> {
    match response.status {
        200..=299 => Ok(response),
        401 => Err(GraphError::Unauthorized),
        403 => Err(GraphError::Forbidden),
        429 => Err(GraphError::RateLimited),
        // Don't expose raw API error details - just log status code
        status => {
            error!("Graph request failed: HTTP {}", status);
            Err(GraphError::Status(status))
        }
    }
}
