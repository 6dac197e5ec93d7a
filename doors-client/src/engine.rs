//! Engine: single owner of the controller, the scope runtime, timers and
//! in-flight hooks. Everything else talks to it through [`Event`]s, so the
//! core state has exactly one writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use doors_core::{
    Command, Controller, ControllerTimer, Effect, HookId, PageState, Payload, Runtime, SessionId,
    TimerToken, WireEvent,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hook::{self, HookError, HookHandle, HookRequest, HookResult};
use crate::page::{Executor, Page};
use crate::session::{run_session, SessionError, SessionEvent, SessionParams};
use crate::transport::Transport;

/// Input of the engine task.
pub enum Event {
    Ready,
    Hidden,
    PageHide,
    Visible,
    Interaction,
    Submit {
        id: HookId,
        request: HookRequest,
        reply: oneshot::Sender<HookResult>,
    },
    Cancel(HookId),
    Session(SessionId, SessionEvent),
    ControllerTimer(ControllerTimer, TimerToken),
    ScopeTimer(TimerToken),
    HookSettled(HookId, HookResult),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

/// Point-in-time view of the engine, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: PageState,
    pub open_sessions: usize,
    pub cursor: u64,
    pub scopes: usize,
    pub hooks: usize,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    tx: mpsc::UnboundedSender<Event>,
    next_hook: Arc<AtomicU64>,
}

impl Engine {
    /// Start the engine task; the first sync session opens right away.
    pub fn spawn(config: Config, transport: Arc<dyn Transport>, page: Box<dyn Page>) -> (Engine, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor::new(config, transport, page, tx.clone());
        let task = tokio::spawn(actor.run(rx));
        let engine = Engine {
            tx,
            next_hook: Arc::new(AtomicU64::new(1)),
        };
        (engine, task)
    }

    fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("engine stopped, event dropped");
        }
    }

    /// The page finished loading; delivered actions may run.
    pub fn ready(&self) {
        self.send(Event::Ready);
    }

    pub fn hidden(&self) {
        self.send(Event::Hidden);
    }

    pub fn page_hide(&self) {
        self.send(Event::PageHide);
    }

    pub fn visible(&self) {
        self.send(Event::Visible);
    }

    pub fn interaction(&self) {
        self.send(Event::Interaction);
    }

    pub fn submit(&self, request: HookRequest) -> HookHandle {
        let id = HookId(self.next_hook.fetch_add(1, Ordering::Relaxed));
        let (reply, rx) = oneshot::channel();
        self.send(Event::Submit { id, request, reply });
        HookHandle::new(id, rx, self.tx.clone())
    }

    pub fn cancel(&self, id: HookId) {
        self.send(Event::Cancel(id));
    }

    pub async fn snapshot(&self) -> Option<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Snapshot(tx));
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        self.send(Event::Shutdown);
    }
}

struct PendingHook {
    request: HookRequest,
    reply: Option<oneshot::Sender<HookResult>>,
    /// Present once dispatched.
    abort: Option<oneshot::Sender<()>>,
}

struct Actor {
    config: Config,
    controller: Controller,
    runtime: Runtime,
    transport: Arc<dyn Transport>,
    page: Box<dyn Page>,
    tx: mpsc::UnboundedSender<Event>,
    sessions: HashMap<SessionId, oneshot::Sender<()>>,
    controller_timers: HashMap<ControllerTimer, JoinHandle<()>>,
    scope_timers: HashMap<TimerToken, JoinHandle<()>>,
    hooks: HashMap<HookId, PendingHook>,
    terminal_notified: bool,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl Actor {
    fn new(config: Config, transport: Arc<dyn Transport>, page: Box<dyn Page>, tx: mpsc::UnboundedSender<Event>) -> Self {
        let controller = Controller::new(config.controller_config());
        Self {
            config,
            controller,
            runtime: Runtime::new(),
            transport,
            page,
            tx,
            sessions: HashMap::new(),
            controller_timers: HashMap::new(),
            scope_timers: HashMap::new(),
            hooks: HashMap::new(),
            terminal_notified: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!(instance = %self.config.instance, "engine started");
        let cmds = self.controller.start();
        self.apply_commands(cmds);
        while let Some(event) = rx.recv().await {
            if matches!(event, Event::Shutdown) {
                break;
            }
            self.handle(event);
        }
        self.stop();
        info!("engine stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Ready => {
                let cmds = self.controller.ready(&mut Executor(self.page.as_mut()));
                self.apply_commands(cmds);
            }
            Event::Hidden => {
                let cmds = self.controller.on_hidden();
                self.apply_commands(cmds);
            }
            Event::PageHide => {
                let cmds = self.controller.on_page_hide();
                self.apply_commands(cmds);
            }
            Event::Visible => {
                let cmds = self.controller.on_visible(now());
                self.apply_commands(cmds);
            }
            Event::Interaction => {
                let cmds = self.controller.on_interaction();
                self.apply_commands(cmds);
            }
            Event::Submit { id, request, reply } => {
                let chain = request.scopes.clone();
                self.hooks.insert(
                    id,
                    PendingHook {
                        request,
                        reply: Some(reply),
                        abort: None,
                    },
                );
                let effects = self.runtime.submit(id, chain);
                self.apply_effects(effects);
            }
            Event::Cancel(id) => {
                let effects = self.runtime.cancel(id);
                self.apply_effects(effects);
            }
            Event::Session(id, event) => self.on_session(id, event),
            Event::ControllerTimer(timer, token) => {
                self.controller_timers.remove(&timer);
                let cmds = self.controller.on_timer(timer, token, now());
                self.apply_commands(cmds);
            }
            Event::ScopeTimer(token) => {
                self.scope_timers.remove(&token);
                let effects = self.runtime.on_timer(token);
                self.apply_effects(effects);
            }
            Event::HookSettled(id, result) => self.on_hook_settled(id, result),
            Event::Snapshot(reply) => {
                let _ = reply.send(Snapshot {
                    state: self.controller.state(),
                    open_sessions: self.controller.open_sessions(),
                    cursor: self.controller.cursor(),
                    scopes: self.runtime.scope_count(),
                    hooks: self.runtime.hook_count(),
                });
            }
            Event::Shutdown => {}
        }
    }

    fn on_session(&mut self, id: SessionId, event: SessionEvent) {
        match event {
            SessionEvent::Wire(events) => {
                for event in events {
                    let cmds = match event {
                        WireEvent::Package(p) => {
                            self.controller.on_package(p);
                            continue;
                        }
                        WireEvent::Malformed(e) => {
                            warn!(session = id.0, error = %e, "frame dropped");
                            continue;
                        }
                        WireEvent::Ack | WireEvent::Roll => continue,
                        WireEvent::Suspend => self.controller.suspend(),
                        WireEvent::Kill => self.controller.on_gone(),
                    };
                    self.apply_commands(cmds);
                }
                let cmds = self.controller.flush(&mut Executor(self.page.as_mut()));
                self.apply_commands(cmds);
            }
            SessionEvent::Roll => {
                let cmds = self.controller.request_roll(id);
                self.apply_commands(cmds);
            }
            SessionEvent::End { report, error } => {
                self.sessions.remove(&id);
                if matches!(error, Some(SessionError::Gone)) {
                    let cmds = self.controller.on_gone();
                    self.apply_commands(cmds);
                }
                let cmds = self.controller.on_report(id, report, now());
                self.apply_commands(cmds);
            }
        }
    }

    fn on_hook_settled(&mut self, id: HookId, result: HookResult) {
        if let Some(mut pending) = self.hooks.remove(&id) {
            self.page.indicator_end(id);
            match &result {
                Ok(reply) => {
                    for call in &reply.after {
                        if let Err(e) = self.page.execute(call, &Payload::None) {
                            warn!(%id, action = %call.action, error = %e, "after action failed");
                        }
                    }
                }
                Err(HookError::Unauthorized) => {
                    let cmds = self.controller.on_gone();
                    self.apply_commands(cmds);
                }
                Err(e @ (HookError::Canceled | HookError::NotFound)) => {
                    debug!(%id, door = pending.request.door, error = %e, "hook dropped")
                }
                Err(e) if pending.request.on_error.is_empty() => {
                    warn!(%id, door = pending.request.door, error = %e, "hook failed")
                }
                Err(e) => {
                    let payload = Payload::Text(e.to_string());
                    for call in &pending.request.on_error {
                        if let Err(err) = self.page.execute(call, &payload) {
                            warn!(%id, action = %call.action, error = %err, "error action failed");
                        }
                    }
                }
            }
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(result);
            }
        }
        let effects = self.runtime.complete(id);
        self.apply_effects(effects);
    }

    fn apply_commands(&mut self, cmds: Vec<Command>) {
        for cmd in cmds {
            match cmd {
                Command::Open { session, upload } => {
                    let (abort_tx, abort_rx) = oneshot::channel();
                    self.sessions.insert(session, abort_tx);
                    let params = SessionParams {
                        id: session,
                        upload,
                        ping: self.controller.config().ping,
                        abort_after: self.controller.config().abort_after(),
                    };
                    let tx = self.tx.clone();
                    let emit = move |ev| {
                        let _ = tx.send(Event::Session(session, ev));
                    };
                    tokio::spawn(run_session(self.transport.clone(), params, abort_rx, emit));
                }
                Command::Abort(session) => {
                    if let Some(abort) = self.sessions.remove(&session) {
                        let _ = abort.send(());
                    }
                }
                Command::Arm { timer, token, after } => {
                    let tx = self.tx.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(Event::ControllerTimer(timer, token));
                    });
                    if let Some(old) = self.controller_timers.insert(timer, handle) {
                        old.abort();
                    }
                }
                Command::Disarm { timer } => {
                    if let Some(old) = self.controller_timers.remove(&timer) {
                        old.abort();
                    }
                }
                Command::Reload => {
                    info!("reloading page");
                    self.page.reload();
                }
            }
        }
        if self.controller.state() == PageState::Dead && !self.terminal_notified {
            self.terminal_notified = true;
            self.page.on_terminal(PageState::Dead);
        }
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Dispatch(id) => self.dispatch(id),
                Effect::Canceled(id) => {
                    if let Some(mut pending) = self.hooks.remove(&id) {
                        if let Some(event) = &pending.request.event {
                            event.prevent_default();
                        }
                        if let Some(reply) = pending.reply.take() {
                            let _ = reply.send(Err(HookError::Canceled));
                        }
                    }
                }
                Effect::Abort(id) => {
                    if let Some(abort) = self.hooks.get_mut(&id).and_then(|p| p.abort.take()) {
                        let _ = abort.send(());
                    }
                }
                Effect::ArmTimer { token, after } => {
                    let tx = self.tx.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(Event::ScopeTimer(token));
                    });
                    self.scope_timers.insert(token, handle);
                }
                Effect::DisarmTimer(token) => {
                    if let Some(handle) = self.scope_timers.remove(&token) {
                        handle.abort();
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, id: HookId) {
        let Some(pending) = self.hooks.get_mut(&id) else {
            return;
        };
        for call in &pending.request.before {
            if let Err(e) = self.page.execute(call, &Payload::None) {
                warn!(%id, action = %call.action, error = %e, "before action failed");
            }
        }
        self.page.indicator_start(id, &pending.request.indicator);
        let (abort_tx, abort_rx) = oneshot::channel();
        pending.abort = Some(abort_tx);
        let transport = self.transport.clone();
        let (door, hook_id) = (pending.request.door, pending.request.hook);
        let body = pending.request.body.clone();
        let timeout = self.config.request_timeout();
        let tx = self.tx.clone();
        debug!(%id, door, hook = hook_id, "dispatching hook");
        tokio::spawn(async move {
            let result = hook::send(transport, door, hook_id, body, timeout, abort_rx).await;
            let _ = tx.send(Event::HookSettled(id, result));
        });
    }

    fn stop(&mut self) {
        for (_, handle) in self.controller_timers.drain() {
            handle.abort();
        }
        for (_, handle) in self.scope_timers.drain() {
            handle.abort();
        }
        for (_, abort) in self.sessions.drain() {
            let _ = abort.send(());
        }
        for (_, mut pending) in self.hooks.drain() {
            if let Some(abort) = pending.abort.take() {
                let _ = abort.send(());
            }
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(HookError::Canceled));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Downlink, HookBody, HttpReply, SyncResponse, TransportError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use doors_core::wire::SIGNAL_ACK;
    use doors_core::{encode_frame, Call, Outcome, Package, Policy, ScopeSet};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU16, AtomicUsize};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    enum Script {
        Status(u16),
        Fail,
        Stream(mpsc::UnboundedReceiver<Bytes>),
    }

    struct Chunks(mpsc::UnboundedReceiver<Bytes>);

    #[async_trait]
    impl Downlink for Chunks {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
            Ok(self.0.recv().await)
        }
    }

    struct Idle;

    #[async_trait]
    impl Downlink for Idle {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
            std::future::pending::<()>().await;
            Ok(None)
        }
    }

    struct FakeTransport {
        syncs: Mutex<VecDeque<Script>>,
        uploads: Mutex<Vec<Value>>,
        posts: Mutex<Vec<(u64, u64)>>,
        gate: Semaphore,
        status: AtomicU16,
    }

    impl FakeTransport {
        fn new(syncs: Vec<Script>, permits: usize) -> Arc<Self> {
            Arc::new(Self {
                syncs: Mutex::new(syncs.into()),
                uploads: Mutex::new(Vec::new()),
                posts: Mutex::new(Vec::new()),
                gate: Semaphore::new(permits),
                status: AtomicU16::new(200),
            })
        }

        fn uploads(&self) -> Vec<Value> {
            self.uploads.lock().unwrap().clone()
        }

        fn posts(&self) -> Vec<(u64, u64)> {
            self.posts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open_sync(&self, body: Vec<u8>) -> Result<SyncResponse, TransportError> {
            let upload = serde_json::from_slice(&body).unwrap_or(Value::Null);
            self.uploads.lock().unwrap().push(upload);
            let next = self.syncs.lock().unwrap().pop_front();
            match next {
                Some(Script::Status(s)) => Ok(SyncResponse::Status(s)),
                Some(Script::Fail) => Err(TransportError::Other("connection refused".into())),
                Some(Script::Stream(rx)) => Ok(SyncResponse::Stream(Box::new(Chunks(rx)))),
                None => Ok(SyncResponse::Stream(Box::new(Idle))),
            }
        }

        async fn post_hook(&self, door: u64, hook: u64, _body: HookBody) -> Result<HttpReply, TransportError> {
            self.posts.lock().unwrap().push((door, hook));
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(HttpReply {
                status: self.status.load(Ordering::SeqCst),
                after: None,
                body: Bytes::new(),
            })
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPage {
        log: Arc<Mutex<Vec<String>>>,
        reloads: Arc<AtomicUsize>,
    }

    impl Page for RecordingPage {
        fn execute(&mut self, call: &Call, _payload: &Payload) -> Outcome {
            self.log.lock().unwrap().push(call.action.clone());
            Ok(Value::Null)
        }

        fn reload(&mut self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RecordingPage {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn reloads(&self) -> usize {
            self.reloads.load(Ordering::SeqCst)
        }
    }

    fn start(fake: &Arc<FakeTransport>, page: &RecordingPage) -> Engine {
        let transport: Arc<dyn Transport> = fake.clone();
        let (engine, _task) = Engine::spawn(Config::default(), transport, Box::new(page.clone()));
        engine
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn frame(seq: u64) -> Vec<u8> {
        encode_frame(&Package::call(seq, format!("a{seq}"), Value::Null)).unwrap()
    }

    fn result_keys(upload: &Value) -> Vec<String> {
        upload["results"]
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_order_after_ready() {
        let (chunks, rx) = mpsc::unbounded_channel();
        let fake = FakeTransport::new(vec![Script::Stream(rx)], 0);
        let page = RecordingPage::default();
        let engine = start(&fake, &page);
        let mut bytes = vec![SIGNAL_ACK];
        bytes.extend(frame(2));
        let one = frame(1);
        let (head, tail) = one.split_at(3);
        bytes.extend_from_slice(head);
        chunks.send(Bytes::from(bytes)).unwrap();
        chunks.send(Bytes::copy_from_slice(tail)).unwrap();
        settle().await;
        assert!(page.log().is_empty());
        engine.ready();
        settle().await;
        assert_eq!(page.log(), vec!["a1", "a2"]);
        // Results travel on a fresh session.
        let uploads = fake.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(result_keys(&uploads[1]), vec!["1", "2"]);
        assert_eq!(uploads[1]["results"]["1"], json!([null, null]));
        let snap = engine.snapshot().await.unwrap();
        assert_eq!(snap.cursor, 3);
        assert_eq!(snap.state, PageState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn gone_reloads_once() {
        let fake = FakeTransport::new(vec![Script::Status(401)], 0);
        let page = RecordingPage::default();
        let engine = start(&fake, &page);
        settle().await;
        assert_eq!(engine.snapshot().await.unwrap().state, PageState::Dead);
        assert_eq!(page.reloads(), 1);
        engine.interaction();
        engine.visible();
        settle().await;
        assert_eq!(page.reloads(), 1);
        assert_eq!(fake.uploads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_session_resends_results() {
        let (chunks, rx) = mpsc::unbounded_channel();
        let fake = FakeTransport::new(vec![Script::Stream(rx), Script::Fail], 0);
        let page = RecordingPage::default();
        let engine = start(&fake, &page);
        engine.ready();
        chunks.send(Bytes::from(frame(1))).unwrap();
        settle().await;
        assert_eq!(page.log(), vec!["a1"]);
        let uploads = fake.uploads();
        // Second session failed to open, third carries the same result.
        assert_eq!(uploads.len(), 3);
        assert_eq!(result_keys(&uploads[1]), vec!["1"]);
        assert_eq!(result_keys(&uploads[2]), vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_dispatches_latest_once() {
        let fake = FakeTransport::new(vec![], Semaphore::MAX_PERMITS);
        let page = RecordingPage::default();
        let engine = start(&fake, &page);
        let scopes = || {
            vec![ScopeSet::new(
                "search",
                Policy::Debounce {
                    duration: Duration::from_millis(300),
                    limit: Some(Duration::from_millis(1000)),
                },
            )]
        };
        let mut handles = Vec::new();
        for n in 1..=5 {
            handles.push(engine.submit(HookRequest::new(7, n).with_scopes(scopes())));
            settle().await;
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        settle().await;
        assert!(fake.posts().is_empty());
        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;
        assert_eq!(fake.posts(), vec![(7, 5)]);
        let last = handles.pop().unwrap();
        for h in handles {
            assert_eq!(h.await, Err(HookError::Canceled));
        }
        assert!(last.await.is_ok());
        settle().await;
        assert_eq!(engine.snapshot().await.unwrap().scopes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_cancels_while_busy() {
        let fake = FakeTransport::new(vec![], 0);
        let page = RecordingPage::default();
        let engine = start(&fake, &page);
        let blocking = || HookRequest::new(1, 1).with_scopes(vec![ScopeSet::new("b", Policy::Blocking)]);
        let first = engine.submit(blocking());
        let second = engine.submit(blocking());
        assert_eq!(second.await, Err(HookError::Canceled));
        settle().await;
        assert_eq!(fake.posts().len(), 1);
        fake.gate.add_permits(1);
        assert!(first.await.is_ok());
        settle().await;
        fake.gate.add_permits(1);
        let third = engine.submit(blocking());
        assert!(third.await.is_ok());
        assert_eq!(fake.posts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_hook_runs_error_actions() {
        let fake = FakeTransport::new(vec![], Semaphore::MAX_PERMITS);
        fake.status.store(503, Ordering::SeqCst);
        let page = RecordingPage::default();
        let engine = start(&fake, &page);
        let on_error = || vec![Call::new("show_error", json!("#status"))];
        let failed = engine.submit(HookRequest::new(4, 1).with_on_error(on_error()));
        assert_eq!(failed.await, Err(HookError::Server(503)));
        assert_eq!(page.log(), vec!["show_error"]);

        fake.status.store(404, Ordering::SeqCst);
        let missing = engine.submit(HookRequest::new(4, 2).with_on_error(on_error()));
        assert_eq!(missing.await, Err(HookError::NotFound));
        assert_eq!(page.log(), vec!["show_error"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_dispatch_aborts_request() {
        let fake = FakeTransport::new(vec![], 0);
        let page = RecordingPage::default();
        let engine = start(&fake, &page);
        let handle = engine.submit(HookRequest::new(2, 3));
        settle().await;
        assert_eq!(fake.posts(), vec![(2, 3)]);
        handle.cancel();
        assert_eq!(handle.await, Err(HookError::Canceled));
        settle().await;
        assert_eq!(engine.snapshot().await.unwrap().hooks, 0);
    }
}
