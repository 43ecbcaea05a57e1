//! Microsoft Graph request batching and caching.
//!
//! Endpoints are normalized, grouped into single and `$batch` requests,
//! issued with the session's access token, and their results cached per
//! token value.

pub mod batch;
pub mod cache;
pub mod client;
pub mod endpoint;

pub use batch::BatchResult;
pub use cache::GraphResultCache;
pub use client::{
    GraphClient, GraphRequest, GraphResponse, GraphResult, GraphTransport, HttpRequest,
    ReqwestTransport,
};
pub use endpoint::{categorize, Categorized, Endpoint, EndpointInput, EndpointSpec};
