//! One sync session: upload, read the streamed downlink, report how it ended.

use std::sync::Arc;
use std::time::Duration;

use doors_core::{Report, SessionId, Upload, WireEvent, WireParser};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::transport::{SyncResponse, Transport, TransportError};

/// Why a session did not finish cleanly.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("network: {0}")]
    Network(#[from] TransportError),
    #[error("server error {0}")]
    Server(u16),
    #[error("unexpected status {0}")]
    Other(u16),
    #[error("instance gone")]
    Gone,
    #[error("session deadline passed")]
    Timeout,
    #[error("stream closed before completion")]
    Closed,
    #[error("aborted")]
    Aborted,
    #[error("encode upload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SessionError {
    fn from_status(status: u16) -> Self {
        match status {
            401 | 410 => SessionError::Gone,
            500..=599 => SessionError::Server(status),
            _ => SessionError::Other(status),
        }
    }
}

/// Delivered to the engine, in order.
#[derive(Debug)]
pub enum SessionEvent {
    /// Parsed contents of one chunk.
    Wire(Vec<WireEvent>),
    /// The roll interval passed while the session was open.
    Roll,
    /// Last event of every session.
    End {
        report: Report,
        error: Option<SessionError>,
    },
}

pub struct SessionParams {
    pub id: SessionId,
    pub upload: Upload,
    pub ping: Duration,
    pub abort_after: Duration,
}

/// Run a session to completion. `abort` firing (or its sender dropping)
/// ends it early. Exactly one `End` is emitted.
pub async fn run_session<E>(
    transport: Arc<dyn Transport>,
    params: SessionParams,
    abort: oneshot::Receiver<()>,
    emit: E,
) where
    E: Fn(SessionEvent) + Send + Sync,
{
    let mut acked = false;
    let result = drive(transport, &params, abort, &emit, &mut acked).await;
    let report = match (&result, acked) {
        (Ok(()), _) => Report::Ok,
        (Err(_), true) => Report::Interrupted,
        (Err(_), false) => Report::Broken,
    };
    let error = result.err();
    match &error {
        Some(SessionError::Aborted) | None => {
            debug!(session = params.id.0, ?report, "session ended")
        }
        Some(e) => warn!(session = params.id.0, ?report, error = %e, "session failed"),
    }
    emit(SessionEvent::End { report, error });
}

async fn drive<E>(
    transport: Arc<dyn Transport>,
    params: &SessionParams,
    mut abort: oneshot::Receiver<()>,
    emit: &E,
    acked: &mut bool,
) -> Result<(), SessionError>
where
    E: Fn(SessionEvent) + Send + Sync,
{
    let body = params.upload.to_json()?;
    let deadline = tokio::time::sleep(params.abort_after);
    tokio::pin!(deadline);
    let roll = tokio::time::sleep(params.ping);
    tokio::pin!(roll);
    let mut rolled = false;

    let response = tokio::select! {
        r = transport.open_sync(body) => r?,
        _ = &mut deadline => return Err(SessionError::Timeout),
        _ = &mut abort => return Err(SessionError::Aborted),
    };
    let mut downlink = match response {
        SyncResponse::Stream(d) => d,
        SyncResponse::Status(status) => return Err(SessionError::from_status(status)),
    };

    let mut parser = WireParser::new();
    loop {
        let chunk = tokio::select! {
            c = downlink.next_chunk() => c?,
            _ = &mut roll, if !rolled => {
                rolled = true;
                emit(SessionEvent::Roll);
                continue;
            }
            _ = &mut deadline => return Err(SessionError::Timeout),
            _ = &mut abort => return Err(SessionError::Aborted),
        };
        let Some(chunk) = chunk else {
            return Err(SessionError::Closed);
        };
        let mut events = Vec::new();
        let done = parser.feed(&chunk, &mut events);
        if events.iter().any(|e| matches!(e, WireEvent::Ack)) {
            *acked = true;
        }
        if !events.is_empty() {
            emit(SessionEvent::Wire(events));
        }
        if done {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Downlink, HookBody, HttpReply};
    use async_trait::async_trait;
    use bytes::Bytes;
    use doors_core::wire::{SIGNAL_ACK, SIGNAL_ROLL};
    use doors_core::{encode_frame, Package};
    use serde_json::Value;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Chunks(mpsc::UnboundedReceiver<Bytes>);

    #[async_trait]
    impl Downlink for Chunks {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
            Ok(self.0.recv().await)
        }
    }

    struct OneShot(Mutex<Option<SyncResponse>>);

    #[async_trait]
    impl Transport for OneShot {
        async fn open_sync(&self, _body: Vec<u8>) -> Result<SyncResponse, TransportError> {
            match self.0.lock().unwrap().take() {
                Some(r) => Ok(r),
                None => Err(TransportError::Other("no response".into())),
            }
        }

        async fn post_hook(&self, _: u64, _: u64, _: HookBody) -> Result<HttpReply, TransportError> {
            Err(TransportError::Other("unused".into()))
        }
    }

    fn params() -> SessionParams {
        SessionParams {
            id: SessionId(1),
            upload: Upload::default(),
            ping: Duration::from_secs(10),
            abort_after: Duration::from_secs(13),
        }
    }

    async fn run(response: SyncResponse, abort: oneshot::Receiver<()>) -> Vec<SessionEvent> {
        let transport: Arc<dyn Transport> = Arc::new(OneShot(Mutex::new(Some(response))));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        run_session(transport, params(), abort, move |e| sink.lock().unwrap().push(e)).await;
        let mut out = events.lock().unwrap();
        std::mem::take(&mut *out)
    }

    fn end(events: &[SessionEvent]) -> (Report, Option<&SessionError>) {
        match events.last() {
            Some(SessionEvent::End { report, error }) => (*report, error.as_ref()),
            other => panic!("expected End, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn roll_signal_ends_ok() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut bytes = vec![SIGNAL_ACK];
        bytes.extend(encode_frame(&Package::call(1, "a", Value::Null)).unwrap());
        tx.send(Bytes::from(bytes)).unwrap();
        tx.send(Bytes::from_static(&[SIGNAL_ROLL])).unwrap();
        let (_keep, abort) = oneshot::channel();
        let events = run(SyncResponse::Stream(Box::new(Chunks(rx))), abort).await;
        assert_eq!(end(&events).0, Report::Ok);
        assert!(matches!(&events[0], SessionEvent::Wire(w) if w.len() == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn gone_status_is_broken() {
        let (_keep, abort) = oneshot::channel();
        let events = run(SyncResponse::Status(410), abort).await;
        let (report, error) = end(&events);
        assert_eq!(report, Report::Broken);
        assert!(matches!(error, Some(SessionError::Gone)));
    }

    #[tokio::test(start_paused = true)]
    async fn close_after_ack_is_interrupted() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Bytes::from_static(&[SIGNAL_ACK])).unwrap();
        drop(tx);
        let (_keep, abort) = oneshot::channel();
        let events = run(SyncResponse::Stream(Box::new(Chunks(rx))), abort).await;
        let (report, error) = end(&events);
        assert_eq!(report, Report::Interrupted);
        assert!(matches!(error, Some(SessionError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_rolls_then_times_out() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (_keep, abort) = oneshot::channel();
        let events = run(SyncResponse::Stream(Box::new(Chunks(rx))), abort).await;
        assert!(matches!(events[0], SessionEvent::Roll));
        let (report, error) = end(&events);
        assert_eq!(report, Report::Broken);
        assert!(matches!(error, Some(SessionError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_ends_session() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (stop, abort) = oneshot::channel();
        stop.send(()).unwrap();
        let events = run(SyncResponse::Stream(Box::new(Chunks(rx))), abort).await;
        assert!(matches!(end(&events).1, Some(SessionError::Aborted)));
    }
}
