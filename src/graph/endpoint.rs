//! Endpoint declarations and their grouping into single and batch requests.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;

/// Batch group key for endpoints that use the client's own base URL.
pub const DEFAULT_BATCH_KEY: &str = "default";

/// Prefix of ids assigned to batch sub-requests without an explicit id.
pub const DEFAULT_ID_PREFIX: &str = "defaultID-";

/// An endpoint as declared by the application: a bare URL or an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointInput {
    Url(String),
    Spec(EndpointSpec),
}

impl From<&str> for EndpointInput {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for EndpointInput {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<EndpointSpec> for EndpointInput {
    fn from(spec: EndpointSpec) -> Self {
        Self::Spec(spec)
    }
}

/// Object form of an endpoint declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, alias = "batchUrl", skip_serializing_if = "Option::is_none")]
    pub batch_url: Option<String>,
    /// Always re-fetch, never serve or persist a cached result.
    #[serde(default)]
    pub force: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A validated endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub id: Option<String>,
    pub url: String,
    pub method: String,
    pub batch_url: Option<String>,
    pub force: bool,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

/// One entry of a `$batch` request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSubRequest {
    pub id: String,
    pub url: String,
    pub method: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Endpoint {
    /// Turn a declaration into an endpoint. A declaration without a URL is
    /// rejected.
    pub fn normalize(input: EndpointInput) -> Result<Self, GraphError> {
        let spec = match input {
            EndpointInput::Url(url) => EndpointSpec {
                url: Some(url),
                ..EndpointSpec::default()
            },
            EndpointInput::Spec(spec) => spec,
        };

        let url = match spec.url {
            Some(url) if !url.is_empty() => url,
            _ => {
                return Err(GraphError::InvalidEndpoint(format!(
                    "invalid endpoint url (id: {})",
                    spec.id.as_deref().unwrap_or("<none>")
                )))
            }
        };

        Ok(Self {
            id: spec.id,
            url,
            method: spec.method.unwrap_or_else(|| "GET".to_string()),
            batch_url: spec.batch_url,
            force: spec.force,
            headers: spec.headers,
            body: spec.body,
        })
    }

    /// Sub-request for position `index` of a batch.
    pub fn to_batch_request(&self, index: usize) -> BatchSubRequest {
        BatchSubRequest {
            id: self
                .id
                .clone()
                .unwrap_or_else(|| format!("{}{}", DEFAULT_ID_PREFIX, index)),
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Endpoints split by how they will be issued.
#[derive(Debug, Default, PartialEq)]
pub struct Categorized {
    pub singles: Vec<Endpoint>,
    /// Batch URL (or [`DEFAULT_BATCH_KEY`]) to the endpoints sent in that batch.
    pub batches: BTreeMap<String, Vec<Endpoint>>,
}

/// Group endpoints keyed by id into single requests and per-URL batches.
///
/// Ids in `exclude` are skipped. Each endpoint takes its map key as id.
pub fn categorize(endpoints: &BTreeMap<String, Endpoint>, exclude: &HashSet<String>) -> Categorized {
    let mut categorized = Categorized::default();

    for (id, endpoint) in endpoints {
        if exclude.contains(id) {
            continue;
        }

        let mut endpoint = endpoint.clone();
        endpoint.id = Some(id.clone());

        match endpoint.batch_url.take() {
            Some(batch_url) => categorized
                .batches
                .entry(batch_url)
                .or_default()
                .push(endpoint),
            None => categorized.singles.push(endpoint),
        }
    }

    categorized
}

/// Batch URL to post to for a group key; `None` means the client default.
pub fn batch_target(key: &str) -> Option<&str> {
    (key != DEFAULT_BATCH_KEY).then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint(url: &str, batch_url: Option<&str>) -> Endpoint {
        Endpoint::normalize(EndpointInput::Spec(EndpointSpec {
            url: Some(url.into()),
            batch_url: batch_url.map(Into::into),
            ..EndpointSpec::default()
        }))
        .unwrap()
    }

    #[test]
    fn test_bare_url_normalizes_to_get() {
        let endpoint = Endpoint::normalize("/me".into()).unwrap();
        assert_eq!(endpoint.url, "/me");
        assert_eq!(endpoint.method, "GET");
        assert!(!endpoint.force);
        assert!(endpoint.id.is_none());
    }

    #[test]
    fn test_missing_url_is_invalid() {
        let result = Endpoint::normalize(EndpointInput::Spec(EndpointSpec {
            id: Some("broken".into()),
            ..EndpointSpec::default()
        }));
        assert!(matches!(result, Err(GraphError::InvalidEndpoint(_))));

        let result = Endpoint::normalize("".into());
        assert!(matches!(result, Err(GraphError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_endpoint_input_from_json() {
        let inputs: Vec<EndpointInput> = serde_json::from_value(json!([
            "/me",
            { "url": "/me/messages", "method": "GET", "batchUrl": "https://x", "force": true }
        ]))
        .unwrap();

        assert_eq!(inputs[0], EndpointInput::Url("/me".into()));
        let spec = Endpoint::normalize(inputs[1].clone()).unwrap();
        assert_eq!(spec.batch_url.as_deref(), Some("https://x"));
        assert!(spec.force);
    }

    #[test]
    fn test_batch_request_default_ids() {
        let endpoint = Endpoint::normalize("/me".into()).unwrap();
        assert_eq!(endpoint.to_batch_request(3).id, "defaultID-3");

        let named = Endpoint {
            id: Some("profile".into()),
            ..endpoint
        };
        assert_eq!(named.to_batch_request(3).id, "profile");
    }

    #[test]
    fn test_categorize_groups_by_batch_url() {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("a".to_string(), endpoint("/a", Some("https://x")));
        endpoints.insert("b".to_string(), endpoint("/b", Some("https://x")));
        endpoints.insert("c".to_string(), endpoint("/c", None));
        endpoints.insert("d".to_string(), endpoint("/d", Some(DEFAULT_BATCH_KEY)));

        let categorized = categorize(&endpoints, &HashSet::new());

        assert_eq!(categorized.singles.len(), 1);
        assert_eq!(categorized.singles[0].id.as_deref(), Some("c"));

        let group = &categorized.batches["https://x"];
        let ids: Vec<_> = group.iter().filter_map(|e| e.id.as_deref()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(group.iter().all(|e| e.batch_url.is_none()));

        assert!(categorized.batches.contains_key(DEFAULT_BATCH_KEY));
        assert_eq!(batch_target(DEFAULT_BATCH_KEY), None);
        assert_eq!(batch_target("https://x"), Some("https://x"));
    }

    #[test]
    fn test_categorize_applies_exclusions() {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("a".to_string(), endpoint("/a", Some("https://x")));
        endpoints.insert("b".to_string(), endpoint("/b", None));

        let exclude: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        assert_eq!(categorize(&endpoints, &exclude), Categorized::default());
    }
}
