//! Hook requests: what gets submitted, how replies are classified, and the
//! handle a caller awaits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use doors_core::{Call, HookId, ScopeSet};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::engine::Event;
use crate::transport::{HookBody, HttpReply, Transport, TransportError};

/// Event that triggered a hook; canceled hooks suppress it.
pub trait TriggerEvent: Send + Sync {
    fn prevent_default(&self);
}

/// One client-initiated request.
pub struct HookRequest {
    pub door: u64,
    pub hook: u64,
    /// Scope chain; empty means a single free scope.
    pub scopes: Vec<ScopeSet>,
    pub body: HookBody,
    /// Run locally right before dispatch.
    pub before: Vec<Call>,
    /// Run when the request fails, except for cancel, not found and gone.
    pub on_error: Vec<Call>,
    /// Opaque indicator description handed to the page.
    pub indicator: Value,
    pub event: Option<Arc<dyn TriggerEvent>>,
}

impl HookRequest {
    pub fn new(door: u64, hook: u64) -> Self {
        Self {
            door,
            hook,
            scopes: Vec::new(),
            body: HookBody::empty(),
            before: Vec::new(),
            on_error: Vec::new(),
            indicator: Value::Null,
            event: None,
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<ScopeSet>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_body(mut self, body: HookBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_on_error(mut self, actions: Vec<Call>) -> Self {
        self.on_error = actions;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookReply {
    pub status: u16,
    pub body: Bytes,
    /// Follow-up actions from the `D00r-After` header.
    pub after: Vec<Call>,
    /// 403: the server had already handled this hook.
    pub already_done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error("canceled")]
    Canceled,
    #[error("instance gone")]
    Unauthorized,
    #[error("hook not found")]
    NotFound,
    #[error("bad request")]
    BadRequest,
    #[error("server error {0}")]
    Server(u16),
    #[error("unexpected status {0}")]
    Other(u16),
    #[error("network: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
}

pub type HookResult = Result<HookReply, HookError>;

/// Map a raw reply onto the hook taxonomy.
pub fn classify(reply: HttpReply) -> HookResult {
    match reply.status {
        200..=299 => Ok(HookReply {
            status: reply.status,
            after: reply.after.as_deref().map(parse_after).unwrap_or_default(),
            body: reply.body,
            already_done: false,
        }),
        403 => Ok(HookReply {
            status: reply.status,
            body: reply.body,
            after: Vec::new(),
            already_done: true,
        }),
        400 => Err(HookError::BadRequest),
        401 | 410 => Err(HookError::Unauthorized),
        404 => Err(HookError::NotFound),
        s @ 500..=599 => Err(HookError::Server(s)),
        s => Err(HookError::Other(s)),
    }
}

fn parse_after(header: &str) -> Vec<Call> {
    serde_json::from_str(header).unwrap_or_else(|e| {
        warn!(error = %e, "malformed after header");
        Vec::new()
    })
}

/// Send one hook request, bounded by `timeout` and cut short by `abort`.
pub(crate) async fn send(
    transport: Arc<dyn Transport>,
    door: u64,
    hook: u64,
    body: HookBody,
    timeout: Duration,
    abort: oneshot::Receiver<()>,
) -> HookResult {
    tokio::select! {
        _ = abort => Err(HookError::Canceled),
        r = tokio::time::timeout(timeout, transport.post_hook(door, hook, body)) => match r {
            Err(_) | Ok(Err(TransportError::Timeout)) => Err(HookError::Timeout),
            Ok(Err(e)) => Err(HookError::Network(e.to_string())),
            Ok(Ok(reply)) => classify(reply),
        },
    }
}

/// Pending hook. Resolves once; a dropped engine resolves as canceled.
pub struct HookHandle {
    id: HookId,
    rx: oneshot::Receiver<HookResult>,
    tx: mpsc::UnboundedSender<Event>,
}

impl HookHandle {
    pub(crate) fn new(id: HookId, rx: oneshot::Receiver<HookResult>, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { id, rx, tx }
    }

    pub fn id(&self) -> HookId {
        self.id
    }

    /// Cancel: rejected at once before dispatch, aborted after.
    pub fn cancel(&self) {
        let _ = self.tx.send(Event::Cancel(self.id));
    }
}

impl Future for HookHandle {
    type Output = HookResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(HookError::Canceled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(status: u16, after: Option<&str>) -> HttpReply {
        HttpReply {
            status,
            after: after.map(str::to_string),
            body: Bytes::from_static(b"ok"),
        }
    }

    #[test]
    fn success_carries_after_actions() {
        let r = classify(reply(200, Some(r#"[["set_path", "/x"], ["touch", null]]"#))).unwrap();
        assert_eq!(r.after.len(), 2);
        assert_eq!(r.after[0].action, "set_path");
        assert_eq!(r.after[0].arg, json!("/x"));
        assert!(!r.already_done);
    }

    #[test]
    fn forbidden_is_benign() {
        let r = classify(reply(403, None)).unwrap();
        assert!(r.already_done);
    }

    #[test]
    fn status_taxonomy() {
        assert_eq!(classify(reply(400, None)), Err(HookError::BadRequest));
        assert_eq!(classify(reply(401, None)), Err(HookError::Unauthorized));
        assert_eq!(classify(reply(410, None)), Err(HookError::Unauthorized));
        assert_eq!(classify(reply(404, None)), Err(HookError::NotFound));
        assert_eq!(classify(reply(503, None)), Err(HookError::Server(503)));
        assert_eq!(classify(reply(302, None)), Err(HookError::Other(302)));
    }

    #[test]
    fn malformed_after_is_ignored() {
        let r = classify(reply(204, Some("not json"))).unwrap();
        assert!(r.after.is_empty());
    }
}
