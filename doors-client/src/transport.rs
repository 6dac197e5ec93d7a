//! HTTP seam: sync sessions (streamed downlink) and hook requests.
//! `HttpTransport` is the reqwest implementation; tests swap in a fake.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::config::Config;

/// Response header carrying follow-up actions of a hook reply.
pub const AFTER_HEADER: &str = "D00r-After";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Body of a streaming sync response.
#[async_trait]
pub trait Downlink: Send {
    /// Next chunk of the body, `None` once the body ends.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

pub enum SyncResponse {
    Stream(Box<dyn Downlink>),
    /// Non-success status; the body is not read.
    Status(u16),
}

/// Encoded hook request body.
#[derive(Debug, Clone, PartialEq)]
pub struct HookBody {
    pub content_type: Option<&'static str>,
    pub bytes: Bytes,
}

impl HookBody {
    pub fn empty() -> Self {
        Self {
            content_type: None,
            bytes: Bytes::new(),
        }
    }

    pub fn json(value: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            content_type: Some("application/json;charset=UTF-8"),
            bytes: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: Some("text/plain;charset=UTF-8"),
            bytes: Bytes::from(text.into()),
        }
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: Some("application/octet-stream"),
            bytes: bytes.into(),
        }
    }
}

/// Raw hook response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub after: Option<String>,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a sync session with the JSON upload body.
    async fn open_sync(&self, body: Vec<u8>) -> Result<SyncResponse, TransportError>;
    async fn post_hook(&self, door: u64, hook: u64, body: HookBody) -> Result<HttpReply, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    config: Config,
}

impl HttpTransport {
    pub fn new(config: Config) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, config })
    }
}

struct BodyStream(reqwest::Response);

#[async_trait]
impl Downlink for BodyStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.0.chunk().await?)
    }
}

fn map_err(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(e)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_sync(&self, body: Vec<u8>) -> Result<SyncResponse, TransportError> {
        let resp = self
            .client
            .put(self.config.sync_url())
            .header(reqwest::header::ACCEPT, "application/octet-stream")
            .header(reqwest::header::CONTENT_TYPE, "application/json;charset=UTF-8")
            .body(body)
            .send()
            .await
            .map_err(map_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Ok(SyncResponse::Status(status.as_u16()));
        }
        Ok(SyncResponse::Stream(Box::new(BodyStream(resp))))
    }

    async fn post_hook(&self, door: u64, hook: u64, body: HookBody) -> Result<HttpReply, TransportError> {
        let mut req = self
            .client
            .post(self.config.hook_url(door, hook))
            .timeout(self.config.request_timeout())
            .body(body.bytes);
        if let Some(ct) = body.content_type {
            req = req.header(reqwest::header::CONTENT_TYPE, ct);
        }
        let resp = req.send().await.map_err(map_err)?;
        let status = resp.status().as_u16();
        let after = resp
            .headers()
            .get(AFTER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(map_err)?;
        Ok(HttpReply { status, after, body })
    }
}
